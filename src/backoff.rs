//! Backoff and jitter for redelivery and dispatch retries.

use rand::Rng;
use std::time::Duration;

/// Delay curve between retry attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Same delay every attempt.
    Constant { delay: Duration },
    /// Delay grows linearly with the attempt number.
    Linear { base: Duration },
    /// Delay doubles each attempt, optionally capped.
    Exponential { base: Duration, cap: Option<Duration> },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, cap: None }
    }

    /// Cap exponential growth. No effect on the other curves.
    pub fn with_cap(mut self, max: Duration) -> Self {
        if let Backoff::Exponential { ref mut cap, .. } = self {
            *cap = Some(max);
        }
        self
    }

    /// Delay before the given attempt (1-indexed). Saturates rather than
    /// overflowing for absurd attempt numbers.
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Linear { base } => base
                .checked_mul(attempt as u32)
                .unwrap_or(Duration::from_secs(u64::MAX)),
            Backoff::Exponential { base, cap } => {
                let doublings = attempt.saturating_sub(1) as u32;
                let factor = 2u32.saturating_pow(doublings);
                let raw = base.checked_mul(factor).unwrap_or(Duration::from_secs(u64::MAX));
                match cap {
                    Some(cap) => raw.min(*cap),
                    None => raw,
                }
            }
        }
    }
}

/// Randomisation applied on top of a backoff delay so a herd of retriers
/// does not reconverge on the broker in lockstep.
#[derive(Debug, Clone, Copy, Default)]
pub enum Jitter {
    /// Use the exact backoff delay.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay/2, delay]`.
    Equal,
}

impl Jitter {
    pub fn apply(&self, delay: Duration) -> Duration {
        let millis = delay.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rand::rng().random_range(0..=millis)),
            Jitter::Equal => {
                Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
            }
        }
    }
}
