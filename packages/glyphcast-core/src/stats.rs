//! Per-client delivery statistics and rate-limited warning helpers.
//!
//! Counters are lock-free atomics on the hot path; the one-line summary is
//! logged when the client tears down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::client::ClientId;

/// Delivery gaps above this are counted.
const DELIVERY_GAP_THRESHOLD_MS: u64 = 100;

/// Statistics for one client's media plane.
pub struct ClientStats {
    /// Monotonic reference for gap timestamps.
    reference_time: Instant,
    pub frames_sent: AtomicU64,
    pub audio_packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub audio_samples_received: AtomicU64,
    /// Elapsed nanos of the last delivery (0 = none yet).
    last_delivery_nanos: AtomicU64,
    max_gap_ms: AtomicU64,
    gaps_over_threshold: AtomicU64,
}

impl ClientStats {
    pub fn new() -> Self {
        Self {
            reference_time: Instant::now(),
            frames_sent: AtomicU64::new(0),
            audio_packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            audio_samples_received: AtomicU64::new(0),
            last_delivery_nanos: AtomicU64::new(0),
            max_gap_ms: AtomicU64::new(0),
            gaps_over_threshold: AtomicU64::new(0),
        }
    }

    /// Records a packet delivered to the client (lock-free).
    pub fn record_send(&self, bytes: usize, is_video: bool) {
        if is_video {
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.audio_packets_sent.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);

        let now_nanos = self.reference_time.elapsed().as_nanos() as u64;
        let prev_nanos = self.last_delivery_nanos.swap(now_nanos, Ordering::Relaxed);
        if prev_nanos > 0 {
            let gap_ms = now_nanos.saturating_sub(prev_nanos) / 1_000_000;
            self.max_gap_ms.fetch_max(gap_ms, Ordering::Relaxed);
            if gap_ms > DELIVERY_GAP_THRESHOLD_MS {
                self.gaps_over_threshold.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Logs the lifecycle summary. Called once at client teardown.
    pub fn log_summary(&self, client_id: ClientId) {
        log::info!(
            "[Client {}] session summary: {} frames / {} audio packets / {} bytes sent, \
             {} frames received, max delivery gap {}ms, {} gaps >{}ms",
            client_id,
            self.frames_sent.load(Ordering::Relaxed),
            self.audio_packets_sent.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.frames_received.load(Ordering::Relaxed),
            self.max_gap_ms.load(Ordering::Relaxed),
            self.gaps_over_threshold.load(Ordering::Relaxed),
            DELIVERY_GAP_THRESHOLD_MS,
        );
    }
}

impl Default for ClientStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate limiter for log sites that can fire every tick.
///
/// At most one `fire` per interval returns true; the rest are suppressed.
pub struct RateLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// One warning per second, the convention for per-tick lag sites.
    pub fn per_second() -> Self {
        Self::new(Duration::from_secs(1))
    }

    pub fn fire(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        if last.map_or(true, |t| now.duration_since(t) >= self.interval) {
            *last = Some(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_counters_accumulate() {
        let stats = ClientStats::new();
        stats.record_send(100, true);
        stats.record_send(50, false);
        stats.record_send(50, false);
        assert_eq!(stats.frames_sent.load(Ordering::Relaxed), 1);
        assert_eq!(stats.audio_packets_sent.load(Ordering::Relaxed), 2);
        assert_eq!(stats.bytes_sent.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn gap_tracking_counts_large_gaps() {
        let stats = ClientStats::new();
        stats.record_send(1, false);
        std::thread::sleep(Duration::from_millis(110));
        stats.record_send(1, false);
        assert_eq!(stats.gaps_over_threshold.load(Ordering::Relaxed), 1);
        assert!(stats.max_gap_ms.load(Ordering::Relaxed) >= 100);
    }

    #[test]
    fn rate_limiter_suppresses_within_interval() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        assert!(limiter.fire());
        assert!(!limiter.fire());
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.fire());
    }
}
