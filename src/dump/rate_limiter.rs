//! Token-bucket byte-rate limiter, one per Worker (spec §4.2).
//!
//! No cross-worker coordination: each Worker reports the data-byte count of
//! the batch it just wrote and sleeps enough to keep its own rolling rate at
//! or below the configured limit.

use std::time::{Duration, Instant};

pub struct RateLimiter {
    bytes_per_second: Option<u64>,
    window_start: Instant,
    bytes_in_window: u64,
}

impl RateLimiter {
    pub fn new(bytes_per_second: Option<u64>) -> Self {
        RateLimiter {
            bytes_per_second,
            window_start: Instant::now(),
            bytes_in_window: 0,
        }
    }

    pub fn unlimited() -> Self {
        RateLimiter::new(None)
    }

    /// Report that `bytes` of data bytes were just written and, if over the
    /// configured rate, sleep the calling thread to bring it back in line.
    pub fn report(&mut self, bytes: u64) {
        let limit = match self.bytes_per_second {
            Some(limit) if limit > 0 => limit,
            _ => return,
        };

        self.bytes_in_window += bytes;
        let elapsed = self.window_start.elapsed();
        let allowed = (limit as f64 * elapsed.as_secs_f64()) as u64;

        if self.bytes_in_window > allowed {
            let overage = self.bytes_in_window - allowed;
            let sleep_secs = overage as f64 / limit as f64;
            if sleep_secs > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(sleep_secs));
            }
        }

        // Reset the window periodically so long-running jobs don't carry an
        // ever-growing `bytes_in_window` counter.
        if elapsed > Duration::from_secs(10) {
            self.window_start = Instant::now();
            self.bytes_in_window = 0;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unlimited_never_sleeps() {
        let mut limiter = RateLimiter::unlimited();
        let start = Instant::now();
        limiter.report(1_000_000_000);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn limited_throttles_large_batches() {
        let mut limiter = RateLimiter::new(Some(1_000_000)); // 1 MB/s
        let start = Instant::now();
        limiter.report(2_000_000); // should induce ~2s of sleep on first report
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
