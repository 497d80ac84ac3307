//! Injectable time source and the bounded polling loop built on it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::io::cancel::CancelToken;

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// Call `check` every `interval` until it yields a value, `timeout` elapses
/// on `clock`, or `cancel` fires. Check errors end the loop.
///
/// The iteration count is capped at `timeout / interval + 1` checks, so a
/// clock that never advances still terminates.
pub fn poll_until<T, E, F>(
    clock: &dyn Clock,
    cancel: &CancelToken,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<PollOutcome<T>, E>
where
    F: FnMut() -> Result<Option<T>, E>,
{
    let interval = interval.max(Duration::from_millis(1));
    let started = clock.now();
    let max_checks = timeout.as_millis() / interval.as_millis() + 1;

    for n in 0..max_checks {
        if cancel.is_cancelled() {
            return Ok(PollOutcome::Cancelled);
        }
        if let Some(value) = check()? {
            debug!(checks = n + 1, "poll ready");
            return Ok(PollOutcome::Ready(value));
        }
        let elapsed = (clock.now() - started).to_std().unwrap_or_default();
        if elapsed >= timeout {
            break;
        }
        clock.sleep(interval.min(timeout - elapsed));
    }
    if cancel.is_cancelled() {
        return Ok(PollOutcome::Cancelled);
    }
    debug!(timeout_secs = timeout.as_secs(), "poll timed out");
    Ok(PollOutcome::TimedOut)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::convert::Infallible;

    use super::*;

    struct StepClock {
        now: Cell<DateTime<Utc>>,
        sleeps: Cell<u32>,
    }

    impl StepClock {
        fn new() -> Self {
            Self {
                now: Cell::new(Utc::now()),
                sleeps: Cell::new(0),
            }
        }
    }

    impl Clock for StepClock {
        fn now(&self) -> DateTime<Utc> {
            self.now.get()
        }

        fn sleep(&self, duration: Duration) {
            self.sleeps.set(self.sleeps.get() + 1);
            let step = chrono::Duration::from_std(duration).expect("duration");
            self.now.set(self.now.get() + step);
        }
    }

    #[test]
    fn returns_ready_value() {
        let clock = StepClock::new();
        let mut calls = 0;
        let out = poll_until::<_, Infallible, _>(
            &clock,
            &CancelToken::new(),
            Duration::from_secs(5),
            Duration::from_secs(60),
            || {
                calls += 1;
                Ok((calls == 3).then_some("approved"))
            },
        )
        .expect("poll");
        assert_eq!(out, PollOutcome::Ready("approved"));
        assert_eq!(clock.sleeps.get(), 2);
    }

    /// Verifies exact timeout behavior without real waiting.
    #[test]
    fn times_out_after_simulated_elapsed_time() {
        let clock = StepClock::new();
        let mut calls = 0;
        let out = poll_until::<(), Infallible, _>(
            &clock,
            &CancelToken::new(),
            Duration::from_secs(10),
            Duration::from_secs(30),
            || {
                calls += 1;
                Ok(None)
            },
        )
        .expect("poll");
        assert_eq!(out, PollOutcome::TimedOut);
        assert_eq!(calls, 4, "checks at 0s, 10s, 20s and 30s");
    }

    #[test]
    fn cancellation_stops_polling() {
        let clock = StepClock::new();
        let cancel = CancelToken::new();
        let out = poll_until::<(), Infallible, _>(
            &clock,
            &cancel,
            Duration::from_secs(1),
            Duration::from_secs(100),
            || {
                cancel.cancel();
                Ok(None)
            },
        )
        .expect("poll");
        assert_eq!(out, PollOutcome::Cancelled);
    }

    #[test]
    fn frozen_clock_still_terminates() {
        struct Frozen(DateTime<Utc>);
        impl Clock for Frozen {
            fn now(&self) -> DateTime<Utc> {
                self.0
            }
            fn sleep(&self, _duration: Duration) {}
        }
        let out = poll_until::<(), Infallible, _>(
            &Frozen(Utc::now()),
            &CancelToken::new(),
            Duration::from_secs(1),
            Duration::from_secs(3),
            || Ok(None),
        )
        .expect("poll");
        assert_eq!(out, PollOutcome::TimedOut);
    }

    #[test]
    fn check_errors_propagate() {
        let out = poll_until::<(), &str, _>(
            &StepClock::new(),
            &CancelToken::new(),
            Duration::from_secs(1),
            Duration::from_secs(3),
            || Err("boom"),
        );
        assert_eq!(out, Err("boom"));
    }
}
