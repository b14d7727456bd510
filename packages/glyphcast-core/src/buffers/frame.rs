//! Latest-only double-buffered frame holder.
//!
//! One writer fills the back slot and commits; readers copy the front slot.
//! Frames older than the most recent commit are discarded by definition: a
//! conferencing hub only ever cares about the freshest picture.

use parking_lot::{Mutex, MutexGuard};

/// One frame slot: pixel or text payload plus its provenance.
#[derive(Debug, Default, Clone)]
pub struct FrameSlot {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture time at the producing client, microseconds.
    pub capture_timestamp_us: u64,
    /// Monotonic per-buffer sequence; 0 means "never committed".
    pub sequence: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds slot capacity {capacity}")]
    Oversize { size: usize, capacity: usize },
}

struct SwapState {
    front: usize,
    committed_sequence: u64,
}

/// Double-buffered latest-frame holder; every client carries one for its
/// ingress video and one for its egress composite.
///
/// # Concurrency design
///
/// - A single writer owns the back slot between `begin_write` and commit;
///   readers only ever lock the front slot, so the slot mutexes are
///   uncontended except during the brief post-swap window.
/// - The swap state mutex serializes front/back flips against readers
///   snapshotting the front index. Critical sections are a pointer flip and
///   a memcpy respectively.
pub struct FrameBuffer {
    slots: [Mutex<FrameSlot>; 2],
    state: Mutex<SwapState>,
    capacity: usize,
}

/// Exclusive access to the back slot; [`FrameWrite::commit`] publishes it.
pub struct FrameWrite<'a> {
    buffer: &'a FrameBuffer,
    slot: MutexGuard<'a, FrameSlot>,
    index: usize,
}

impl<'a> FrameWrite<'a> {
    /// The back slot being filled. `data` may be resized up to the buffer
    /// capacity; larger commits are rejected.
    pub fn slot(&mut self) -> &mut FrameSlot {
        &mut self.slot
    }

    /// Publishes the back slot as the new front. Assigns the next sequence
    /// number and swaps under the state mutex.
    pub fn commit(mut self) -> Result<u64, FrameError> {
        if self.slot.data.len() > self.buffer.capacity {
            return Err(FrameError::Oversize {
                size: self.slot.data.len(),
                capacity: self.buffer.capacity,
            });
        }
        let mut state = self.buffer.state.lock();
        state.committed_sequence += 1;
        self.slot.sequence = state.committed_sequence;
        state.front = self.index;
        Ok(state.committed_sequence)
    }
}

impl FrameBuffer {
    /// Creates a buffer whose slots accept frames up to `slot_capacity` bytes.
    pub fn new(slot_capacity: usize) -> Self {
        Self {
            slots: [Mutex::new(FrameSlot::default()), Mutex::new(FrameSlot::default())],
            state: Mutex::new(SwapState {
                front: 0,
                committed_sequence: 0,
            }),
            capacity: slot_capacity,
        }
    }

    /// Begins writing the back slot. Never blocks on readers.
    pub fn begin_write(&self) -> FrameWrite<'_> {
        let back = 1 - self.state.lock().front;
        FrameWrite {
            buffer: self,
            slot: self.slots[back].lock(),
            index: back,
        }
    }

    /// Copies the most recently committed frame into `out`.
    ///
    /// Returns `false` when nothing has been committed yet. `out`'s data
    /// vector is reused to avoid reallocation on steady-state reads.
    pub fn read_latest(&self, out: &mut FrameSlot) -> bool {
        let state = self.state.lock();
        if state.committed_sequence == 0 {
            return false;
        }
        let front = self.slots[state.front].lock();
        drop(state);

        out.data.clear();
        out.data.extend_from_slice(&front.data);
        out.width = front.width;
        out.height = front.height;
        out.capture_timestamp_us = front.capture_timestamp_us;
        out.sequence = front.sequence;
        true
    }

    /// Sequence number of the latest committed frame (0 = none).
    pub fn latest_sequence(&self) -> u64 {
        self.state.lock().committed_sequence
    }

    /// Slot capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
