//! Scope aggregation: enter many scopes as one, exit them in reverse.
//!
//! Entry reuses a [`Runner`] so scopes can be acquired concurrently or one
//! after another. A failure during entry unwinds every scope that was
//! already entered before the original error is returned.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tandem_core::{CancelToken, EndedByController, Stopwatch};

use super::config::{GroupParams, RunnerConfig};
use super::operation::{Call, GroupError, OperationFailure, ScopeRef};
use super::runner::Runner;

/// Indices of scopes by entry outcome, shared with the synthetic enter calls.
///
/// `entered` is kept in the order entries completed, which under a
/// concurrent runner need not match input order.
#[derive(Default)]
struct EntryLog {
    entered: Vec<usize>,
    failed: Vec<usize>,
}

/// A classified scope-style group, ready to be entered.
pub struct ScopeGroup {
    params: GroupParams,
    scopes: Vec<ScopeRef>,
    runner: Arc<dyn Runner>,
    token: CancelToken,
    config: RunnerConfig,
}

impl ScopeGroup {
    pub(crate) fn new(
        params: GroupParams,
        scopes: Vec<ScopeRef>,
        runner: Arc<dyn Runner>,
        token: CancelToken,
        config: RunnerConfig,
    ) -> Self {
        Self {
            params,
            scopes,
            runner,
            token,
            config,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.params.name
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.scopes.iter().map(ScopeRef::name).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Enter every scope.
    ///
    /// Errors are never caught during entry, whatever the group's `catch`
    /// option says.
    ///
    /// # Errors
    ///
    /// Returns the original error of the failed scope (or an aggregate when
    /// several failed concurrently) after every scope that did enter has been
    /// exited in reverse entry order.
    pub fn enter(self) -> Result<EnteredScopes, GroupError> {
        let Self {
            mut params,
            scopes,
            runner,
            token,
            config,
        } = self;
        params.catch = false;

        let abort = Arc::new(AtomicBool::new(false));
        let log = Arc::new(Mutex::new(EntryLog::default()));

        let calls: Vec<Call> = scopes
            .iter()
            .enumerate()
            .map(|(index, scope)| {
                let scope = scope.clone();
                let abort = Arc::clone(&abort);
                let log = Arc::clone(&log);
                let concurrent = runner.is_concurrent();
                Call::new(scope.name().to_string(), move |token: &CancelToken| {
                    if abort.load(Ordering::Acquire) {
                        return Err(EndedByController.into());
                    }
                    match scope.enter(token) {
                        Ok(()) => {
                            log.lock().entered.push(index);
                            Ok(())
                        }
                        Err(err) if EndedByController::is(&err) => Err(err),
                        Err(err) => {
                            abort.store(true, Ordering::Release);
                            if concurrent {
                                token.cancel();
                            }
                            log.lock().failed.push(index);
                            Err(err)
                        }
                    }
                })
            })
            .collect();

        let result = {
            let desc = format!("entry into {} ({})", params.name, runner.label());
            let _timer = Stopwatch::start(desc, config.slow_scope_threshold);
            runner.run(&params, calls, &token)
        };

        let log = std::mem::take(&mut *log.lock());
        match result {
            Ok(_) => Ok(EnteredScopes {
                name: params.name,
                scopes: log.entered.iter().map(|&index| scopes[index].clone()).collect(),
                config,
                exited: false,
            }),
            Err(err) => {
                unwind(&params.name, &scopes, log, &config);
                Err(err)
            }
        }
    }
}

impl fmt::Debug for ScopeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeGroup")
            .field("name", &self.params.name)
            .field("scopes", &self.names())
            .field("runner", &self.runner.label())
            .finish_non_exhaustive()
    }
}

fn unwind(group: &str, scopes: &[ScopeRef], log: EntryLog, config: &RunnerConfig) {
    let _timer = Stopwatch::start(format!("unwind of {group}"), config.slow_scope_threshold);

    for &index in log.entered.iter().rev() {
        let scope = &scopes[index];
        if let Err(err) = scope.exit() {
            tracing::warn!(
                group,
                scope = scope.name(),
                error = %format!("{err:#}"),
                "exit failed while unwinding"
            );
        }
    }

    for &index in &log.failed {
        let scope = &scopes[index];
        if let Err(err) = scope.exit() {
            tracing::warn!(
                group,
                scope = scope.name(),
                error = %format!("{err:#}"),
                "cleanup exit after failed entry also failed"
            );
        }
    }
}

/// A group whose scopes are all entered.
///
/// Call [`EnteredScopes::exit`] to release them and observe exit errors.
/// Dropping without exiting releases them too, logging any errors.
pub struct EnteredScopes {
    name: String,
    scopes: Vec<ScopeRef>,
    config: RunnerConfig,
    exited: bool,
}

impl EnteredScopes {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scope names in the order they were entered.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.scopes.iter().map(ScopeRef::name).collect()
    }

    /// Exit every scope in reverse entry order.
    ///
    /// Entry order is completion order under a concurrent runner, so the
    /// scope that finished entering last is the first to exit.
    ///
    /// Every scope is exited even when an earlier exit fails.
    ///
    /// # Errors
    ///
    /// Returns the original exit error when one scope failed to exit, or an
    /// aggregate of all exit errors.
    pub fn exit(mut self) -> Result<(), GroupError> {
        let failures = self.exit_all();
        match GroupError::from_failures(&self.name, failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn exit_all(&mut self) -> Vec<OperationFailure> {
        self.exited = true;
        let desc = format!("exit of {}", self.name);
        let _timer = Stopwatch::start(desc, self.config.slow_scope_threshold);
        self.scopes
            .iter()
            .rev()
            .filter_map(|scope| {
                scope.exit().err().map(|error| OperationFailure {
                    name: scope.name().to_string(),
                    error,
                })
            })
            .collect()
    }
}

impl Drop for EnteredScopes {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        for failure in self.exit_all() {
            tracing::warn!(
                group = %self.name,
                scope = %failure.name,
                error = %format!("{:#}", failure.error),
                "exit failed during drop"
            );
        }
    }
}

impl fmt::Debug for EnteredScopes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnteredScopes")
            .field("name", &self.name)
            .field("scopes", &self.names())
            .finish_non_exhaustive()
    }
}
