use std::time::Duration;

/// Capped exponential backoff: `min(base * multiplier^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(2000),
            multiplier: 1.5,
            max: Duration::from_millis(30_000),
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = (base_ms * self.multiplier.powi(exponent)).min(max_ms);
        Duration::from_millis(delay_ms.round() as u64)
    }
}

/// Consecutive transient failures since the last successful watch fix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
}

impl RetryState {
    /// Delay for the next retry; counts the failure.
    pub fn next_delay(&mut self, backoff: &Backoff) -> Duration {
        let delay = backoff.delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn first_delays_follow_multiplier() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), ms(2000));
        assert_eq!(backoff.delay(1), ms(3000));
        assert_eq!(backoff.delay(2), ms(4500));
        assert_eq!(backoff.delay(3), ms(6750));
    }

    #[test]
    fn delays_are_monotonic_and_capped() {
        let backoff = Backoff::default();
        let delays: Vec<_> = (0..50).map(|a| backoff.delay(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= ms(30_000)));
        assert_eq!(delays[49], ms(30_000));
        assert_eq!(backoff.delay(u32::MAX), ms(30_000));
    }

    #[test]
    fn reset_returns_to_base_delay() {
        let backoff = Backoff::default();
        let mut retry = RetryState::default();
        assert_eq!(retry.next_delay(&backoff), ms(2000));
        assert_eq!(retry.next_delay(&backoff), ms(3000));
        assert_eq!(retry.attempts, 2);

        retry.reset();
        assert_eq!(retry.next_delay(&backoff), ms(2000));
    }
}
