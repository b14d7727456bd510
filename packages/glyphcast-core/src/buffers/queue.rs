//! Bounded MPSC packet queue with two priority bands and shutdown semantics.
//!
//! The send worker drains this queue; the audio render worker, the broadcast
//! path, and control handlers feed it. Bounded capacity is the back-pressure
//! signal the audio render worker uses to drop frames instead of growing
//! memory without limit.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::protocol::PacketType;

/// One queued egress packet.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub packet_type: PacketType,
    pub payload: Bytes,
    pub high_priority: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full ({capacity} packets)")]
    Full { capacity: usize },
    #[error("queue is shut down")]
    ShutDown,
}

struct QueueInner {
    high: VecDeque<QueuedPacket>,
    normal: VecDeque<QueuedPacket>,
    shut_down: bool,
}

impl QueueInner {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }
}

/// Bounded FIFO with a high-priority band that bypasses the normal band.
/// Entries of equal priority keep enqueue order.
pub struct PacketQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    capacity: usize,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                shut_down: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues a packet, failing when full or shut down.
    pub fn enqueue(
        &self,
        packet_type: PacketType,
        payload: Bytes,
        high_priority: bool,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return Err(QueueError::ShutDown);
        }
        if inner.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        let packet = QueuedPacket {
            packet_type,
            payload,
            high_priority,
        };
        if high_priority {
            inner.high.push_back(packet);
        } else {
            inner.normal.push_back(packet);
        }
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Dequeues the next packet, blocking up to `deadline`.
    ///
    /// Returns `None` on timeout or once the queue is shut down (the
    /// shutdown sentinel; any backlog is discarded, since egress data for a
    /// departing client is stale by definition).
    pub fn dequeue_blocking(&self, deadline: Duration) -> Option<QueuedPacket> {
        let timeout_at = Instant::now() + deadline;
        let mut inner = self.inner.lock();
        loop {
            if inner.shut_down {
                return None;
            }
            if let Some(packet) = inner.high.pop_front() {
                return Some(packet);
            }
            if let Some(packet) = inner.normal.pop_front() {
                return Some(packet);
            }
            if self.available.wait_until(&mut inner, timeout_at).timed_out() {
                return None;
            }
        }
    }

    /// Current queue depth across both bands.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes every waiter and fails all subsequent enqueues. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shut_down = true;
        inner.high.clear();
        inner.normal.clear();
        drop(inner);
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(queue: &PacketQueue, tag: u8, high: bool) {
        queue
            .enqueue(PacketType::AudioOpus, Bytes::from(vec![tag]), high)
            .unwrap();
    }

    #[test]
    fn fifo_within_priority() {
        let queue = PacketQueue::new(8);
        packet(&queue, 1, false);
        packet(&queue, 2, false);
        packet(&queue, 3, false);

        for expected in 1..=3u8 {
            let got = queue.dequeue_blocking(Duration::from_millis(10)).unwrap();
            assert_eq!(got.payload[0], expected);
        }
    }

    #[test]
    fn high_priority_bypasses_normal() {
        let queue = PacketQueue::new(8);
        packet(&queue, 1, false);
        packet(&queue, 2, true);
        packet(&queue, 3, false);
        packet(&queue, 4, true);

        let order: Vec<u8> = (0..4)
            .map(|_| queue.dequeue_blocking(Duration::from_millis(10)).unwrap().payload[0])
            .collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn bounded_capacity_rejects_when_full() {
        let queue = PacketQueue::new(2);
        packet(&queue, 1, false);
        packet(&queue, 2, false);
        assert_eq!(
            queue.enqueue(PacketType::AudioOpus, Bytes::from_static(&[3]), false),
            Err(QueueError::Full { capacity: 2 })
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn dequeue_times_out_when_empty() {
        let queue = PacketQueue::new(2);
        let start = Instant::now();
        assert!(queue.dequeue_blocking(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn shutdown_wakes_blocked_waiter() {
        use std::sync::Arc;

        let queue = Arc::new(PacketQueue::new(2));
        let waiter_queue = queue.clone();
        let waiter = std::thread::spawn(move || {
            waiter_queue.dequeue_blocking(Duration::from_secs(30))
        });

        std::thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn enqueue_after_shutdown_fails() {
        let queue = PacketQueue::new(2);
        queue.shutdown();
        assert_eq!(
            queue.enqueue(PacketType::AudioOpus, Bytes::new(), false),
            Err(QueueError::ShutDown)
        );
        // Idempotent.
        queue.shutdown();
        assert!(queue.dequeue_blocking(Duration::from_millis(1)).is_none());
    }
}
