use std::time::Duration;

use rand::Rng;

/// How long to wait before a retry attempt.
///
/// Strategies are pure functions of the attempt index and their own carried
/// state; the state lives per request in [`BackoffState`] so a shared policy
/// never synchronizes callers.
#[derive(Clone, Copy, Debug)]
pub enum Backoff {
    /// `min(base * 2^attempt, max)`.
    Exponential { base: Duration, max: Duration },
    /// Decorrelated jitter: `next = min(max, uniform(base, prev * 3))`,
    /// with `prev` seeded to `base`. Keeps the expected growth geometric
    /// while desynchronizing a fleet of retrying clients.
    DecorrelatedJitter { base: Duration, max: Duration },
}

impl Backoff {
    /// Upper bound any produced delay is clamped to.
    pub(crate) fn max(&self) -> Duration {
        match *self {
            Backoff::Exponential { max, .. } => max,
            Backoff::DecorrelatedJitter { max, .. } => max,
        }
    }

    pub(crate) fn delay(&self, state: &mut BackoffState, attempt: u32) -> Duration {
        match *self {
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt);
                base.saturating_mul(factor).min(max)
            }
            Backoff::DecorrelatedJitter { base, max } => {
                let prev = state.prev.unwrap_or(base);
                let high = prev.saturating_mul(3).min(max);
                let next = if high > base {
                    rand::thread_rng().gen_range(base..=high)
                } else {
                    base.min(max)
                };
                state.prev = Some(next);
                next
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Backoff {
        Backoff::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

/// Per-request carry for stateful strategies.
#[derive(Debug, Default)]
pub(crate) struct BackoffState {
    prev: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_cap() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(10),
            max: Duration::from_millis(55),
        };
        let mut state = BackoffState::default();
        let delays: Vec<_> = (0..5).map(|i| backoff.delay(&mut state, i)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(55),
                Duration::from_millis(55),
            ]
        );
    }

    #[test]
    fn exponential_saturates_on_large_attempts() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(10),
            max: Duration::from_secs(1),
        };
        let mut state = BackoffState::default();
        assert_eq!(backoff.delay(&mut state, 64), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_envelope() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        let backoff = Backoff::DecorrelatedJitter { base, max };
        let mut state = BackoffState::default();

        let mut prev = base;
        for attempt in 0..200 {
            let next = backoff.delay(&mut state, attempt);
            assert!(next >= base, "delay below base: {next:?}");
            assert!(
                next <= prev.saturating_mul(3).min(max),
                "delay above 3x prev: {next:?} vs {prev:?}"
            );
            prev = next;
        }
    }

    #[test]
    fn jitter_respects_cap_when_base_exceeds_it() {
        let backoff = Backoff::DecorrelatedJitter {
            base: Duration::from_secs(5),
            max: Duration::from_secs(2),
        };
        let mut state = BackoffState::default();
        assert_eq!(backoff.delay(&mut state, 0), Duration::from_secs(2));
    }
}
