//! Reconnect backoff for the upstream reader.
//!
//! The relay core never sleeps on the event path; this state machine is
//! consumed by whatever supervises the holder and drives `Resume` after the
//! pump exits with a transient reader error.

use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone)]
pub struct ReaderRetryConfig {
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub backoff_factor: u32,
    pub backoff_jitter: bool,
    /// After this long without a failure the backoff rolls back to the
    /// minimum.
    pub backoff_rollback: Duration,
}

impl Default for ReaderRetryConfig {
    fn default() -> Self {
        ReaderRetryConfig {
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5 * 60),
            backoff_factor: 2,
            backoff_jitter: true,
            backoff_rollback: Duration::from_secs(5 * 60),
        }
    }
}

/// Exponential backoff with jitter and stability rollback.
#[derive(Debug)]
pub struct ReaderBackoff {
    cfg: ReaderRetryConfig,
    current: Duration,
    last_failure: Option<Instant>,
}

impl ReaderBackoff {
    pub fn new(cfg: ReaderRetryConfig) -> ReaderBackoff {
        let current = cfg.backoff_min;
        ReaderBackoff {
            cfg,
            current,
            last_failure: None,
        }
    }

    /// Duration to wait before the next retry. Grows the internal backoff;
    /// rolls it back to the minimum first when the last failure is older
    /// than the rollback window.
    pub fn next_backoff(&mut self) -> Duration {
        let now = Instant::now();
        if let Some(last) = self.last_failure {
            if now.duration_since(last) >= self.cfg.backoff_rollback {
                self.current = self.cfg.backoff_min;
            }
        }
        self.last_failure = Some(now);

        let wait = self.current;
        self.current = (self.current * self.cfg.backoff_factor).min(self.cfg.backoff_max);
        self.jittered(wait)
    }

    /// Current backoff without advancing it.
    pub fn current(&self) -> Duration {
        self.current
    }

    fn jittered(&self, d: Duration) -> Duration {
        if !self.cfg.backoff_jitter || d.is_zero() {
            return d;
        }
        let half = d / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=half)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ReaderRetryConfig {
        ReaderRetryConfig {
            backoff_min: Duration::from_millis(10),
            backoff_max: Duration::from_millis(80),
            backoff_factor: 2,
            backoff_jitter: false,
            backoff_rollback: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let mut b = ReaderBackoff::new(cfg());
        let waits: Vec<Duration> = (0..5).map(|_| b.next_backoff()).collect();
        assert_eq!(
            waits,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80),
                Duration::from_millis(80),
            ]
        );
    }

    #[test]
    fn test_backoff_rollback() {
        let mut c = cfg();
        c.backoff_rollback = Duration::ZERO;
        let mut b = ReaderBackoff::new(c);
        // with a zero rollback window every failure counts as "stable"
        assert_eq!(b.next_backoff(), Duration::from_millis(10));
        assert_eq!(b.next_backoff(), Duration::from_millis(10));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut c = cfg();
        c.backoff_jitter = true;
        let mut b = ReaderBackoff::new(c);
        for _ in 0..32 {
            let d = b.next_backoff();
            assert!(d >= Duration::from_millis(5));
            assert!(d <= Duration::from_millis(80));
        }
    }
}
