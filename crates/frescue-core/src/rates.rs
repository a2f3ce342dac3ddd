//! Read-rate accounting on a one-second monotonic tick.
//!
//! The meter drives the rates log, the min/max read-rate policies, the
//! error-rate budget and the timeout since the last successful read.
//! All arithmetic runs on elapsed monotonic time.

use std::time::Duration;

/// Length of one accounting window.
const TICK: Duration = Duration::from_secs(1);

/// Ticks of history required before the auto minimum-rate policy arms.
const AUTO_WARMUP: u64 = 10;

/// One completed accounting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSample {
    /// Bytes per second over the completed window.
    pub current_rate: u64,
    /// Bytes per second since the meter started.
    pub average_rate: u64,
    /// Growth of `errsize` over the completed window.
    pub error_growth: u64,
}

#[derive(Debug)]
pub struct RateMeter {
    start: Duration,
    window_start: Duration,
    bytes_in_window: u64,
    total_bytes: u64,
    errsize_at_window: u64,
    last_good: Duration,
    ticks: u64,
}

impl RateMeter {
    pub fn new(now: Duration) -> RateMeter {
        RateMeter {
            start: now,
            window_start: now,
            bytes_in_window: 0,
            total_bytes: 0,
            errsize_at_window: 0,
            last_good: now,
            ticks: 0,
        }
    }

    /// Record `n` bytes successfully read at `now`.
    pub fn on_good_read(&mut self, now: Duration, n: u64) {
        self.bytes_in_window += n;
        self.total_bytes += n;
        self.last_good = now;
    }

    /// Time of the last successful read.
    pub fn last_good(&self) -> Duration {
        self.last_good
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Close the accounting window if a second has passed.
    pub fn tick(&mut self, now: Duration, errsize: u64) -> Option<TickSample> {
        let elapsed = now.saturating_sub(self.window_start);
        if elapsed < TICK {
            return None;
        }
        let secs = elapsed.as_secs().max(1);
        let run_secs = now.saturating_sub(self.start).as_secs().max(1);
        let sample = TickSample {
            current_rate: self.bytes_in_window / secs,
            average_rate: self.total_bytes / run_secs,
            error_growth: errsize.saturating_sub(self.errsize_at_window) / secs,
        };
        self.window_start = now;
        self.bytes_in_window = 0;
        self.errsize_at_window = errsize;
        self.ticks += 1;
        Some(sample)
    }

    /// Whether enough history exists for the auto minimum-rate policy.
    pub fn warmed_up(&self) -> bool {
        self.ticks >= AUTO_WARMUP
    }

    /// How long to sleep so the current window stays within `max_rate`
    /// bytes per second.
    pub fn throttle_delay(&self, now: Duration, max_rate: u64) -> Option<Duration> {
        if max_rate == 0 {
            return None;
        }
        let owed = Duration::from_secs_f64(self.bytes_in_window as f64 / max_rate as f64);
        let elapsed = now.saturating_sub(self.window_start);
        (owed > elapsed).then(|| owed - elapsed)
    }
}
