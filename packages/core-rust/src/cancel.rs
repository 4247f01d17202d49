//! Cooperative cancellation with in-flight operation tracking.
//!
//! A `CancelToken` is a broadcast flag shared by every operation of an
//! invocation group. Nothing is preempted: operations observe the flag only
//! when they wait through [`CancelToken::wait`] or poll [`CancelToken::check`].
//! An atomic counter with RAII guards tracks outstanding concurrent
//! operations, and the flag clears itself when the last guard drops so a
//! cancelled group never leaks its state into the next one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Upper bound on the poll granularity of every interruptible wait.
pub const MAX_WAIT_TICK: Duration = Duration::from_secs(1);

static GLOBAL: OnceLock<CancelToken> = OnceLock::new();

/// Raised inside an operation when its controller requested termination.
///
/// Runners treat this as an internal signal: it is never surfaced as the
/// final error of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ended by controller")]
pub struct EndedByController;

impl EndedByController {
    /// Returns `true` if `err` is (or wraps) a controller-requested termination.
    #[must_use]
    pub fn is(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| cause.is::<EndedByController>())
    }
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    in_flight: AtomicU64,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Shared cancellation flag plus an interruptible wait primitive.
///
/// Cloning is cheap and every clone observes the same flag. Use
/// [`CancelToken::global`] for the process-wide token, or [`CancelToken::new`]
/// to isolate a set of groups (tests do this to avoid cross-talk).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Creates a fresh, uncancelled token with no in-flight operations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide token.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL.get_or_init(CancelToken::new).clone()
    }

    /// Requests termination and wakes every waiter immediately.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let _guard = self.inner.lock.lock();
        self.inner.wake.notify_all();
    }

    /// Clears the termination request.
    pub fn clear(&self) {
        self.inner.cancelled.store(false, Ordering::Release);
    }

    /// Non-blocking read of the flag.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Returns `Err(EndedByController)` if termination was requested.
    ///
    /// # Errors
    ///
    /// Returns [`EndedByController`] when the flag is set.
    pub fn check(&self) -> Result<(), EndedByController> {
        if self.is_cancelled() {
            Err(EndedByController)
        } else {
            Ok(())
        }
    }

    /// Blocks for up to `duration`, polling the flag at [`MAX_WAIT_TICK`].
    ///
    /// # Errors
    ///
    /// Returns [`EndedByController`] as soon as the flag is observed set,
    /// including before the first tick when it is already set.
    pub fn wait(&self, duration: Duration) -> Result<(), EndedByController> {
        self.wait_with_tick(duration, MAX_WAIT_TICK)
    }

    /// Like [`CancelToken::wait`] with an explicit poll granularity.
    ///
    /// `tick` is clamped to `(0, MAX_WAIT_TICK]`.
    ///
    /// # Errors
    ///
    /// Returns [`EndedByController`] when the flag is observed set.
    pub fn wait_with_tick(
        &self,
        duration: Duration,
        tick: Duration,
    ) -> Result<(), EndedByController> {
        let tick = tick.clamp(Duration::from_millis(1), MAX_WAIT_TICK);
        // An unrepresentable deadline waits until cancelled.
        let deadline = Instant::now().checked_add(duration);
        let mut guard = self.inner.lock.lock();

        loop {
            if self.is_cancelled() {
                return Err(EndedByController);
            }
            let step = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    (deadline - now).min(tick)
                }
                None => tick,
            };
            self.inner.wake.wait_for(&mut guard, step);
        }
    }

    /// Creates an RAII guard that tracks one outstanding concurrent operation.
    ///
    /// When the last outstanding guard drops, the flag is cleared.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            token: self.clone(),
        }
    }

    /// Returns the number of outstanding concurrent operations.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.inner.in_flight.load(Ordering::Acquire)
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
///
/// Decrementing the last outstanding operation clears the cancellation flag.
#[derive(Debug)]
pub struct InFlightGuard {
    token: CancelToken,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let previous = self.token.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && self.token.is_cancelled() {
            self.token.clear();
            tracing::trace!("last in-flight operation finished; cancellation cleared");
        }
    }
}

/// Process-wide interruptible sleep.
///
/// # Errors
///
/// Returns [`EndedByController`] if the global token is cancelled while waiting.
pub fn sleep(duration: Duration) -> Result<(), EndedByController> {
    CancelToken::global().wait(duration)
}

/// Returns an error if the process-wide token has been cancelled.
///
/// # Errors
///
/// Returns [`EndedByController`] when the global flag is set.
pub fn check_cancelled() -> Result<(), EndedByController> {
    CancelToken::global().check()
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn wait_elapses_when_not_cancelled() {
        let token = CancelToken::new();
        let start = Instant::now();
        token.wait(Duration::from_millis(50)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wait_fails_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        let start = Instant::now();
        assert_eq!(token.wait(Duration::from_secs(5)), Err(EndedByController));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn zero_wait_still_observes_flag() {
        let token = CancelToken::new();
        assert!(token.wait(Duration::ZERO).is_ok());
        token.cancel();
        assert!(token.wait(Duration::ZERO).is_err());
        assert!(token.check().is_err());
    }

    #[test]
    fn cancel_interrupts_long_wait_within_a_tick() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let res = token.wait(Duration::from_secs(30));
                (res, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        token.cancel();
        let (res, elapsed) = waiter.join().unwrap();
        assert_eq!(res, Err(EndedByController));
        assert!(elapsed < Duration::from_millis(50) + MAX_WAIT_TICK);
    }

    #[test]
    fn last_guard_clears_flag() {
        let token = CancelToken::new();
        let g1 = token.in_flight_guard();
        let g2 = token.in_flight_guard();
        assert_eq!(token.in_flight_count(), 2);

        token.cancel();
        drop(g1);
        assert!(token.is_cancelled());
        assert_eq!(token.in_flight_count(), 1);

        drop(g2);
        assert!(!token.is_cancelled());
        assert_eq!(token.in_flight_count(), 0);
    }

    #[test]
    fn ended_by_controller_detected_through_context() {
        let err = anyhow::Error::new(EndedByController).context("while waiting for device");
        assert!(EndedByController::is(&err));
        let other = anyhow::anyhow!("boom");
        assert!(!EndedByController::is(&other));
    }

    #[test]
    fn global_token_is_shared() {
        let a = CancelToken::global();
        let b = CancelToken::global();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }
}
