//! Backoff strategies used to space out the retries of failed jobs.
//!
//! The queue defaults to [`DEFAULT_BACKOFF`], a quadratic strategy producing delays of 1s, 4s,
//! 9s, 16s, ... for the first, second, third and fourth retry respectively. Any of the
//! strategies below can be passed to [`crate::Queue::with_backoff`] instead:
//!
//! 1. Constant
//! 2. Linear
//! 3. Polynomial
//! 4. Exponential
//!
//! each which can be optionally modified by applying different types of jitter.
//!
//! # Example
//!
//! ```
//! # use jobqueue::prelude::*;
//! # use std::time::Duration;
//! let strategy = BackoffStrategy::linear(Duration::from_secs(20))
//!     .with_max(Duration::from_secs(60))
//!     .with_jitter(Jitter::Absolute(Duration::from_secs(10)));
//!
//! assert!(strategy.backoff(1) >= Duration::from_secs(10));
//! assert!(strategy.backoff(1) <= Duration::from_secs(30));
//! // Note the max here is the max plus max jitter
//! assert!(strategy.backoff(10) >= Duration::from_secs(50));
//! assert!(strategy.backoff(10) <= Duration::from_secs(70));
//! ```

use std::time::Duration;

use rand::Rng;

/// The strategy used by a [`crate::Queue`] unless another one is supplied: `attempts²` seconds.
pub const DEFAULT_BACKOFF: BackoffStrategy<Polynomial> =
    BackoffStrategy::polynomial(Duration::from_secs(1), 2);

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the number of attempts made so far returns how long to wait before the job is
    /// resubmitted.
    fn backoff(&self, attempt: u32) -> Duration;
}

/// Always returns the same delay no matter what the attempt is.
///
/// Constructed via [`BackoffStrategy::constant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: Duration,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Grows linearly with each attempt.
///
/// Constructed via [`BackoffStrategy::linear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    factor: Duration,
    max: Option<Duration>,
}

impl Strategy for Linear {
    fn backoff(&self, attempt: u32) -> Duration {
        let backoff = self.factor.saturating_mul(attempt);
        clamp(backoff, self.max)
    }
}

/// Grows as `factor * attempt^power`.
///
/// Constructed via [`BackoffStrategy::polynomial`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Polynomial {
    factor: Duration,
    power: u32,
    max: Option<Duration>,
}

impl Strategy for Polynomial {
    fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = attempt.checked_pow(self.power).unwrap_or(u32::MAX);
        clamp(self.factor.saturating_mul(multiplier), self.max)
    }
}

/// Doubles with each attempt, starting from `base` on the first.
///
/// It is advisable to set a ceiling with [`BackoffStrategy::with_max`]. Constructed via
/// [`BackoffStrategy::exponential`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: Duration,
    max: Option<Duration>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        clamp(self.base.saturating_mul(multiplier), self.max)
    }
}

fn clamp(backoff: Duration, max: Option<Duration>) -> Duration {
    match max {
        Some(max) => backoff.min(max),
        None => backoff,
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter in the range `-delta..=delta`.
    Absolute(Duration),
    /// A random jitter as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: Duration) -> Duration {
        // The spread is symmetric, so only the magnitude of the jitter matters.
        let milliseconds = match self {
            Self::Absolute(delta) => i64::try_from(delta.as_millis()).unwrap_or(i64::MAX),
            Self::Relative(ratio) => (value.as_millis() as f64 * ratio.abs()).round() as i64,
        };
        if milliseconds == 0 {
            return value;
        }
        let offset = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        if offset >= 0 {
            value.saturating_add(Duration::from_millis(offset as u64))
        } else {
            value.saturating_sub(Duration::from_millis(offset.unsigned_abs()))
        }
    }
}

/// A configurable backoff strategy.
///
/// All of the constructors and configuration functions are `const`, so a strategy can be
/// declared as a constant and shared between queues.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: Duration,
}

impl BackoffStrategy<Constant> {
    /// Creates a [`BackoffStrategy`] which always waits `delay`.
    ///
    /// ```
    /// # use jobqueue::prelude::*;
    /// # use std::time::Duration;
    /// let strategy = BackoffStrategy::constant(Duration::from_secs(10));
    ///
    /// assert_eq!(strategy.backoff(1), Duration::from_secs(10));
    /// assert_eq!(strategy.backoff(3), Duration::from_secs(10));
    /// ```
    pub const fn constant(delay: Duration) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Linear> {
    /// Creates a [`BackoffStrategy`] waiting `factor * attempt`.
    pub const fn linear(factor: Duration) -> Self {
        Self::new(Linear { factor, max: None })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: Duration) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl BackoffStrategy<Polynomial> {
    /// Creates a [`BackoffStrategy`] waiting `factor * attempt^power`.
    ///
    /// ```
    /// # use jobqueue::prelude::*;
    /// # use std::time::Duration;
    /// let strategy = BackoffStrategy::polynomial(Duration::from_secs(1), 2)
    ///     .with_max(Duration::from_secs(20));
    ///
    /// assert_eq!(strategy.backoff(1), Duration::from_secs(1));
    /// assert_eq!(strategy.backoff(2), Duration::from_secs(4));
    /// assert_eq!(strategy.backoff(3), Duration::from_secs(9));
    /// assert_eq!(strategy.backoff(4), Duration::from_secs(16));
    /// assert_eq!(strategy.backoff(5), Duration::from_secs(20));
    /// ```
    pub const fn polynomial(factor: Duration, power: u32) -> Self {
        Self::new(Polynomial {
            factor,
            power,
            max: None,
        })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: Duration) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] waiting `base * 2^(attempt - 1)`.
    pub const fn exponential(base: Duration) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: Duration) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Wraps a custom [`Strategy`].
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: Duration::ZERO,
        }
    }

    /// Add a jitter to the backoff strategy, see [`Jitter`].
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Add a minimum value. Useful to avoid a large jitter producing near zero delays.
    pub const fn with_min(mut self, min: Duration) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u32) -> Duration {
        let mut backoff = self.strategy.backoff(attempt);

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }

        backoff.max(self.min)
    }
}
