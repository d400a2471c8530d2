use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff shared by provider fetches and rate-limited
/// model calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based), doubling from the base
    /// delay and capped at `max_delay`. A server-provided hint wins when
    /// present, still subject to the cap.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_delay);
        }
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        add_jitter(delay)
    }
}

fn add_jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis < 10 {
        return delay;
    }
    let spread = millis / 10;
    let jitter = rand::thread_rng().gen_range(0..=spread);
    Duration::from_millis(millis - spread / 2 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        let first = policy.delay_for(1, None);
        let second = policy.delay_for(2, None);
        let late = policy.delay_for(5, None);

        assert!(first >= Duration::from_millis(950) && first <= Duration::from_millis(1050));
        assert!(second >= Duration::from_millis(1900) && second <= Duration::from_millis(2100));
        assert!(late <= Duration::from_millis(5250));
    }

    #[test]
    fn hint_is_honoured_but_capped() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(600))),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn immediate_policy_never_sleeps() {
        let policy = RetryPolicy::immediate(4);
        assert_eq!(policy.delay_for(3, None), Duration::ZERO);
    }
}
