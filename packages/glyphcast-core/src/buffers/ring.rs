//! Single-producer/single-consumer sample ring with a drop-oldest policy.
//!
//! The audio ingress path is latency-bounded: when the producer outruns the
//! consumer, the oldest samples are discarded so the buffered backlog never
//! exceeds the ring capacity. Writes never block and never fail.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Lock-free SPSC ring of `f32` audio samples.
///
/// Samples are stored as raw bits in `AtomicU32` cells so both sides stay in
/// safe code; the index protocol (writer releases `write_index`, reader
/// acquires it) publishes cell contents.
///
/// # Concurrency design
///
/// - Exactly one producer and one consumer. Two producers would race the
///   drop-oldest adjustment; the hub guarantees single ownership (the receive
///   worker writes, the peer audio render workers read through the mixer,
///   serialized by the mixer tick).
/// - `available_write` keeps one slot unused so full and empty states are
///   distinguishable.
/// - On overflow the *writer* advances `read_index`, discarding the oldest
///   samples. A concurrent read may observe either the old or the adjusted
///   index; both yield a valid suffix of the written sequence.
pub struct SampleRing {
    cells: Box<[AtomicU32]>,
    mask: usize,
    write_index: AtomicUsize,
    read_index: AtomicUsize,
}

impl SampleRing {
    /// Creates a ring holding up to `capacity - 1` samples.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two. Configuration validation
    /// rejects such values before a ring is ever constructed.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity > 1,
            "ring capacity must be a power of two > 1"
        );
        let cells = (0..capacity).map(|_| AtomicU32::new(0)).collect();
        Self {
            cells,
            mask: capacity - 1,
            write_index: AtomicUsize::new(0),
            read_index: AtomicUsize::new(0),
        }
    }

    /// Number of samples ready to read.
    pub fn available_read(&self) -> usize {
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        write.wrapping_sub(read) & self.mask
    }

    /// Number of samples writable without displacing unread data.
    pub fn available_write(&self) -> usize {
        self.cells.len() - self.available_read() - 1
    }

    /// Appends `samples`, discarding the oldest buffered samples on overflow.
    ///
    /// Returns the number written, which is always `samples.len()` capped at
    /// `capacity - 1` (a burst larger than the ring keeps only its tail).
    pub fn write(&self, samples: &[f32]) -> usize {
        let cap = self.cells.len() - 1;
        let tail = if samples.len() > cap {
            &samples[samples.len() - cap..]
        } else {
            samples
        };

        let writable = self.available_write();
        if writable < tail.len() {
            // Drop-oldest: push the read index forward past the overflow.
            let displaced = tail.len() - writable;
            let read = self.read_index.load(Ordering::Acquire);
            self.read_index
                .store(read.wrapping_add(displaced), Ordering::Release);
        }

        let write = self.write_index.load(Ordering::Relaxed);
        for (offset, sample) in tail.iter().enumerate() {
            let index = write.wrapping_add(offset) & self.mask;
            self.cells[index].store(sample.to_bits(), Ordering::Relaxed);
        }
        self.write_index
            .store(write.wrapping_add(tail.len()), Ordering::Release);
        tail.len()
    }

    /// Reads up to `out.len()` samples. Non-blocking; returns the count read.
    pub fn read(&self, out: &mut [f32]) -> usize {
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        let available = write.wrapping_sub(read) & self.mask;
        let count = available.min(out.len());

        for (offset, slot) in out.iter_mut().take(count).enumerate() {
            let index = read.wrapping_add(offset) & self.mask;
            *slot = f32::from_bits(self.cells[index].load(Ordering::Relaxed));
        }
        self.read_index
            .store(read.wrapping_add(count), Ordering::Release);
        count
    }
}
