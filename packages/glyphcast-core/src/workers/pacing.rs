//! Adaptive-sleep pacing for the render workers.
//!
//! Deadline-based: each tick advances the deadline by one period, so work
//! time is absorbed instead of accumulating drift. The renderers run
//! constant-rate (`tick(0, 0)`); the queue-depth parameters keep the API
//! ready for adaptive pacing without reshaping callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Longest single sleep slice, so shutdown is observed promptly even with
/// slow tick rates.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(100);

/// When the loop falls more than this many periods behind, the deadline is
/// re-anchored instead of replaying missed ticks.
const MAX_CATCH_UP_PERIODS: u32 = 2;

pub struct AdaptiveSleep {
    period: Duration,
    next_deadline: Instant,
    last_tick: Option<Instant>,
}

impl AdaptiveSleep {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_deadline: Instant::now() + period,
            last_tick: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Changes the period (e.g. the client updated its requested fps).
    pub fn set_period(&mut self, period: Duration) {
        if period != self.period {
            self.period = period;
            self.next_deadline = Instant::now() + period;
        }
    }

    /// Sleeps until the next deadline, checking `shutdown` at least every
    /// 100ms. Returns `false` when shutdown was observed mid-sleep.
    ///
    /// `queue_depth`/`target_depth` shorten the wait when the consumer is
    /// backed up; the hub's renderers pass `(0, 0)` for constant rate.
    pub fn tick(&mut self, queue_depth: usize, target_depth: usize, shutdown: &AtomicBool) -> bool {
        let mut deadline = self.next_deadline;
        if queue_depth > target_depth {
            // Behind: halve the remaining wait to drain faster.
            let now = Instant::now();
            if let Some(remaining) = deadline.checked_duration_since(now) {
                deadline = now + remaining / 2;
            }
        }

        loop {
            if shutdown.load(Ordering::Relaxed) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(MAX_SLEEP_SLICE));
        }

        let now = Instant::now();
        self.next_deadline += self.period;
        if now > self.next_deadline + self.period * MAX_CATCH_UP_PERIODS {
            self.next_deadline = now + self.period;
        }
        self.last_tick = Some(now);
        true
    }

    /// Interval between the two most recent ticks, for lag telemetry.
    pub fn measured_interval(&self, previous: Option<Instant>) -> Option<Duration> {
        match (previous, self.last_tick) {
            (Some(previous), Some(last)) => Some(last.duration_since(previous)),
            _ => None,
        }
    }

    pub fn last_tick(&self) -> Option<Instant> {
        self.last_tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_paces_at_target_rate() {
        let shutdown = AtomicBool::new(false);
        let mut pacer = AdaptiveSleep::new(Duration::from_millis(20));
        let start = Instant::now();
        for _ in 0..5 {
            assert!(pacer.tick(0, 0, &shutdown));
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(95), "ran fast: {elapsed:?}");
        // Generous upper bound; scheduling jitter only ever adds.
        assert!(elapsed < Duration::from_millis(400), "ran slow: {elapsed:?}");
    }

    #[test]
    fn shutdown_interrupts_sleep() {
        use std::sync::Arc;

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            flag.store(true, Ordering::Relaxed);
        });

        let mut pacer = AdaptiveSleep::new(Duration::from_secs(60));
        let start = Instant::now();
        assert!(!pacer.tick(0, 0, &shutdown));
        // Observed well before the 60s period: the 100ms slice bound works.
        assert!(start.elapsed() < Duration::from_secs(2));
        waker.join().unwrap();
    }

    #[test]
    fn deadline_reanchors_after_stall() {
        let shutdown = AtomicBool::new(false);
        let mut pacer = AdaptiveSleep::new(Duration::from_millis(10));
        assert!(pacer.tick(0, 0, &shutdown));
        // Simulate a long stall.
        std::thread::sleep(Duration::from_millis(80));
        assert!(pacer.tick(0, 0, &shutdown));
        // The next tick must not fire immediately in a replay burst.
        let start = Instant::now();
        assert!(pacer.tick(0, 0, &shutdown));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn backlog_shortens_the_wait() {
        let shutdown = AtomicBool::new(false);
        let mut pacer = AdaptiveSleep::new(Duration::from_millis(40));
        let start = Instant::now();
        assert!(pacer.tick(10, 0, &shutdown));
        assert!(start.elapsed() < Duration::from_millis(35));
    }
}
