//! Deadline timer polled by its owner.
//!
//! Strategies never sleep. They arm a [`Timer`] and the event loop that
//! drives them reports the current time on every tick; the timer fires at
//! most once per poll. The loop can ask for [`Timer::deadline`] to sleep
//! exactly until the next expiry instead of waiting for the next tick.

use std::time::Duration;

use tokio::time::Instant;

/// One-shot or repeating timer with at most one pending expiry.
#[derive(Debug, Default, Clone)]
pub struct Timer {
    deadline: Option<Instant>,
    repeat: Option<Duration>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer to fire `delay` after `now`.
    ///
    /// Replaces any pending expiry. With `repeat` set, the timer re-arms
    /// itself every time it fires.
    pub fn start(&mut self, now: Instant, delay: Duration, repeat: Option<Duration>) {
        self.deadline = Some(now + delay);
        self.repeat = repeat.filter(|r| !r.is_zero());
    }

    /// Cancel the pending expiry, if any.
    pub fn stop(&mut self) {
        self.deadline = None;
        self.repeat = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Report whether the timer expired at or before `now`.
    ///
    /// A one-shot timer disarms when it fires. A repeating timer advances
    /// its deadline by whole periods until it lies in the future, so a late
    /// poll does not produce a burst of expiries.
    pub fn poll(&mut self, now: Instant) -> bool {
        let Some(deadline) = self.deadline else {
            return false;
        };

        if now < deadline {
            return false;
        }

        self.deadline = match self.repeat {
            Some(period) => {
                let mut next = deadline + period;
                while next <= now {
                    next += period;
                }
                Some(next)
            }
            None => None,
        };

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_fires_once() {
        let t0 = Instant::now();
        let mut timer = Timer::new();
        timer.start(t0, Duration::from_secs(5), None);

        assert!(!timer.poll(t0 + Duration::from_secs(4)));
        assert!(timer.poll(t0 + Duration::from_secs(5)));
        assert!(!timer.poll(t0 + Duration::from_secs(6)));
        assert!(!timer.is_pending());
    }

    #[test]
    fn repeating_rearms_without_bursts() {
        let t0 = Instant::now();
        let mut timer = Timer::new();
        timer.start(t0, Duration::from_secs(1), Some(Duration::from_secs(2)));

        assert!(timer.poll(t0 + Duration::from_secs(1)));
        assert_eq!(timer.deadline(), Some(t0 + Duration::from_secs(3)));

        // Polled late: fires once and skips the missed periods
        assert!(timer.poll(t0 + Duration::from_secs(10)));
        assert_eq!(timer.deadline(), Some(t0 + Duration::from_secs(11)));
    }

    #[test]
    fn stop_cancels_pending_expiry() {
        let t0 = Instant::now();
        let mut timer = Timer::new();
        timer.start(t0, Duration::from_millis(10), Some(Duration::from_millis(10)));
        timer.stop();

        assert!(!timer.is_pending());
        assert!(!timer.poll(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn restart_replaces_deadline() {
        let t0 = Instant::now();
        let mut timer = Timer::new();
        timer.start(t0, Duration::from_secs(10), None);
        timer.start(t0, Duration::from_secs(1), None);

        assert!(timer.poll(t0 + Duration::from_secs(1)));
    }
}
