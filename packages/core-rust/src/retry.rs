//! Retry wrappers built on the interruptible wait.
//!
//! [`Retry`] repeats a call up to a fixed number of attempts; [`UntilTimeout`]
//! repeats it until a wall-clock budget runs out. Both suppress only errors
//! accepted by their matcher, multiply the delay by a backoff factor after
//! each failure, and wait through a [`CancelToken`] so a cancelled group stops
//! retrying within one poll tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;

type Matcher = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;
type Hook = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Multiplicative delay calculator.
///
/// The delay is multiplied by `multiplier` after each call to
/// [`Backoff::next_delay`]. A multiplier of `0.0` makes every delay after the
/// first zero; non-finite or negative multipliers are treated as `0.0`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    multiplier: f64,
    current_delay: Duration,
    /// Number of delays handed out since construction or the last `reset()`.
    pub attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(initial_delay: Duration, multiplier: f64) -> Self {
        let multiplier = if multiplier.is_finite() && multiplier > 0.0 {
            multiplier
        } else {
            0.0
        };
        Self {
            initial_delay,
            multiplier,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// Returns the current delay and advances the state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay =
            Duration::try_from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier)
                .unwrap_or(Duration::MAX);
        delay
    }

    /// Returns the delay that the next call to `next_delay` would hand out.
    #[must_use]
    pub fn peek(&self) -> Duration {
        self.current_delay
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }
}

// ---------------------------------------------------------------------------
// Shared policy
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Policy {
    matcher: Matcher,
    delay: Duration,
    backoff: f64,
    on_error: Option<Hook>,
    token: Option<CancelToken>,
    label: String,
}

impl Policy {
    fn new(matcher: Matcher) -> Self {
        Self {
            matcher,
            delay: Duration::ZERO,
            backoff: 0.0,
            on_error: None,
            token: None,
            label: "call".to_string(),
        }
    }

    fn token(&self) -> CancelToken {
        self.token.clone().unwrap_or_else(CancelToken::global)
    }

    fn matches(&self, err: &anyhow::Error) -> bool {
        (self.matcher)(err)
    }

    fn notify(&self, err: &anyhow::Error) {
        if let Some(hook) = &self.on_error {
            hook(err);
        }
    }
}

fn kind_matcher<E>() -> Matcher
where
    E: std::error::Error + Send + Sync + 'static,
{
    Arc::new(|err: &anyhow::Error| err.downcast_ref::<E>().is_some())
}

macro_rules! policy_builders {
    () => {
        /// Initial delay between attempts (default zero).
        #[must_use]
        pub fn delay(mut self, delay: Duration) -> Self {
            self.policy.delay = delay;
            self
        }

        /// Factor applied to the delay after each failed attempt (default `0.0`).
        #[must_use]
        pub fn backoff(mut self, multiplier: f64) -> Self {
            self.policy.backoff = multiplier;
            self
        }

        /// Callback invoked with each suppressed error before the next wait.
        #[must_use]
        pub fn on_error<F>(mut self, hook: F) -> Self
        where
            F: Fn(&anyhow::Error) + Send + Sync + 'static,
        {
            self.policy.on_error = Some(Arc::new(hook));
            self
        }

        /// Token used for backoff waits. Defaults to [`CancelToken::global`].
        #[must_use]
        pub fn with_token(mut self, token: CancelToken) -> Self {
            self.policy.token = Some(token);
            self
        }

        /// Name of the wrapped call in log messages.
        #[must_use]
        pub fn label(mut self, label: impl Into<String>) -> Self {
            self.policy.label = label.into();
            self
        }
    };
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Attempt-bounded retry.
///
/// ```
/// use std::time::Duration;
/// use tandem_core::retry::Retry;
///
/// let mut calls = 0;
/// let value = Retry::on::<std::io::Error>()
///     .tries(4)
///     .delay(Duration::from_millis(1))
///     .call(|| {
///         calls += 1;
///         if calls < 3 {
///             Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into())
///         } else {
///             Ok(calls)
///         }
///     })
///     .unwrap();
/// assert_eq!(value, 3);
/// ```
#[derive(Clone)]
pub struct Retry {
    policy: Policy,
    tries: u32,
}

impl Retry {
    /// Retry on errors that downcast to `E`.
    #[must_use]
    pub fn on<E>() -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            policy: Policy::new(kind_matcher::<E>()),
            tries: 4,
        }
    }

    /// Retry on errors accepted by `predicate`.
    #[must_use]
    pub fn matching<P>(predicate: P) -> Self
    where
        P: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        Self {
            policy: Policy::new(Arc::new(predicate)),
            tries: 4,
        }
    }

    /// Total number of attempts, including the first (default 4, minimum 1).
    #[must_use]
    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = tries.max(1);
        self
    }

    policy_builders!();

    /// Invoke `f` until it succeeds, fails with an unmatched error, or the
    /// attempts are exhausted.
    ///
    /// # Errors
    ///
    /// Returns the last matched error after exhaustion, any unmatched error
    /// immediately, or [`EndedByController`](crate::EndedByController) when
    /// the token is cancelled during a backoff wait.
    pub fn call<T, F>(&self, mut f: F) -> anyhow::Result<T>
    where
        F: FnMut() -> anyhow::Result<T>,
    {
        let token = self.policy.token();
        let mut backoff = Backoff::new(self.policy.delay, self.policy.backoff);

        let mut attempt = 1;
        loop {
            let err = match f() {
                Ok(value) => return Ok(value),
                Err(err) if self.policy.matches(&err) => err,
                Err(err) => return Err(err),
            };

            if attempt == 1 {
                tracing::info!(
                    call = %self.policy.label,
                    error = %err,
                    "caught error on first call; repeating up to {} more times or until no error is raised",
                    self.tries - 1
                );
            }
            self.policy.notify(&err);

            if attempt >= self.tries {
                return Err(err);
            }
            token.wait(backoff.next_delay())?;
            attempt += 1;
        }
    }

    /// Wrap `f` into a closure that applies this policy on every invocation.
    pub fn wrap<T, F>(self, mut f: F) -> impl FnMut() -> anyhow::Result<T>
    where
        F: FnMut() -> anyhow::Result<T>,
    {
        move || self.call(&mut f)
    }
}

// ---------------------------------------------------------------------------
// UntilTimeout
// ---------------------------------------------------------------------------

/// Time-bounded retry.
///
/// At least one attempt is always made. After each matched failure, the
/// retry stops when waiting out the next delay would exceed the budget;
/// a wait that ends exactly on the budget is still taken.
#[derive(Clone)]
pub struct UntilTimeout {
    policy: Policy,
    timeout: Duration,
}

impl UntilTimeout {
    /// Retry on errors that downcast to `E` for up to `timeout`.
    #[must_use]
    pub fn on<E>(timeout: Duration) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            policy: Policy::new(kind_matcher::<E>()),
            timeout,
        }
    }

    /// Retry on errors accepted by `predicate` for up to `timeout`.
    #[must_use]
    pub fn matching<P>(timeout: Duration, predicate: P) -> Self
    where
        P: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        Self {
            policy: Policy::new(Arc::new(predicate)),
            timeout,
        }
    }

    policy_builders!();

    /// Invoke `f` until it succeeds, fails with an unmatched error, or the
    /// time budget is spent.
    ///
    /// # Errors
    ///
    /// Returns the last matched error once the budget is spent, any
    /// unmatched error immediately, or
    /// [`EndedByController`](crate::EndedByController) on cancellation.
    pub fn call<T, F>(&self, mut f: F) -> anyhow::Result<T>
    where
        F: FnMut() -> anyhow::Result<T>,
    {
        let token = self.policy.token();
        let mut backoff = Backoff::new(self.policy.delay, self.policy.backoff);
        let start = Instant::now();
        let mut notified = false;

        loop {
            let err = match f() {
                Ok(value) => return Ok(value),
                Err(err) if self.policy.matches(&err) => err,
                Err(err) => return Err(err),
            };

            let progress = start.elapsed();
            if !notified && progress < self.timeout {
                tracing::info!(
                    call = %self.policy.label,
                    error = %err,
                    "caught error in first call; repeating calls for another {:.3}s or until no error is raised",
                    (self.timeout - progress).as_secs_f64()
                );
                notified = true;
            }
            self.policy.notify(&err);

            let delay = backoff.next_delay();
            if !within_budget(start.elapsed(), delay, self.timeout) {
                return Err(err);
            }
            token.wait(delay)?;
        }
    }

    /// Wrap `f` into a closure that applies this policy on every invocation.
    pub fn wrap<T, F>(self, mut f: F) -> impl FnMut() -> anyhow::Result<T>
    where
        F: FnMut() -> anyhow::Result<T>,
    {
        move || self.call(&mut f)
    }
}

fn within_budget(elapsed: Duration, delay: Duration, timeout: Duration) -> bool {
    elapsed.saturating_add(delay) <= timeout
}
