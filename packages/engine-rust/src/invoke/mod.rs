//! Invocation groups: run many operations as one logical unit.
//!
//! ```text
//! Invocation ──► classify ──► Calls  ──► Runner ──► merge ──► ResultMap
//!                         └─► Scopes ──► ScopeGroup ──► EnteredScopes
//! ```
//!
//! Both entry points ([`Engine::concurrently`] and [`Engine::sequentially`])
//! share one calling convention and return contract. A callable-style group
//! runs straight away and yields its merged result map; a scope-style group
//! yields a [`ScopeGroup`] for the caller to enter and later exit.

mod classify;
mod concurrent;
mod config;
mod merge;
mod operation;
mod runner;
mod scopes;

use std::sync::Arc;

use tandem_core::{CancelToken, ResultMap};

pub use classify::{classify, option_names, Classified, Invocation};
pub use concurrent::Concurrent;
pub use config::{GroupParams, RunnerConfig};
pub use merge::{merge_contributions, merge_results};
pub use operation::{
    AggregateError, Call, ConfigError, GroupError, Operand, OperationFailure, OperationPanicked,
    Scope, ScopeRef,
};
pub use runner::{Runner, Sequential};
pub use scopes::{EnteredScopes, ScopeGroup};

pub(crate) use operation::{panic_message, short_type_name};

/// Outcome of an invocation: merged results or scopes awaiting entry.
#[derive(Debug)]
pub enum Invoked {
    Results(ResultMap),
    Scopes(ScopeGroup),
}

impl Invoked {
    /// The result map, or `None` for a scope-style group.
    #[must_use]
    pub fn into_results(self) -> Option<ResultMap> {
        match self {
            Invoked::Results(results) => Some(results),
            Invoked::Scopes(_) => None,
        }
    }

    /// The scope group, or `None` for a callable-style group.
    #[must_use]
    pub fn into_scopes(self) -> Option<ScopeGroup> {
        match self {
            Invoked::Scopes(group) => Some(group),
            Invoked::Results(_) => None,
        }
    }
}

/// Entry point binding a runner configuration to a cancellation token.
#[derive(Debug, Clone)]
pub struct Engine {
    config: RunnerConfig,
    token: CancelToken,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl Engine {
    /// An engine on the process-wide cancellation token.
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_token(config, CancelToken::global())
    }

    #[must_use]
    pub fn with_token(config: RunnerConfig, token: CancelToken) -> Self {
        Self { config, token }
    }

    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    #[must_use]
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Run a group with one thread per operation.
    ///
    /// # Errors
    ///
    /// See [`Engine::invoke`].
    pub fn concurrently(&self, invocation: Invocation) -> Result<Invoked, GroupError> {
        self.invoke(invocation, Arc::new(Concurrent::new(self.config.clone())))
    }

    /// Run a group in input order on the calling thread.
    ///
    /// # Errors
    ///
    /// See [`Engine::invoke`].
    pub fn sequentially(&self, invocation: Invocation) -> Result<Invoked, GroupError> {
        self.invoke(invocation, Arc::new(Sequential))
    }

    /// Classify `invocation` and drive it with `runner`.
    ///
    /// An empty group returns an empty map without invoking the runner.
    ///
    /// # Errors
    ///
    /// Returns [`GroupError::Config`] for an invalid composition or a merge
    /// collision, otherwise whatever the runner raised.
    pub fn invoke(
        &self,
        invocation: Invocation,
        runner: Arc<dyn Runner>,
    ) -> Result<Invoked, GroupError> {
        match classify(invocation)? {
            Classified::Empty => Ok(Invoked::Results(ResultMap::new())),
            Classified::Calls {
                params,
                calls,
                contributions,
            } => {
                let results = runner.run(&params, calls, &self.token)?;
                let merged = merge_results(contributions, results, params.flatten)?;
                Ok(Invoked::Results(merged))
            }
            Classified::Scopes { params, scopes } => Ok(Invoked::Scopes(ScopeGroup::new(
                params,
                scopes,
                runner,
                self.token.clone(),
                self.config.clone(),
            ))),
        }
    }
}

/// [`Engine::concurrently`] on the process-wide token with default timing.
///
/// # Errors
///
/// See [`Engine::invoke`].
pub fn concurrently(invocation: Invocation) -> Result<Invoked, GroupError> {
    Engine::default().concurrently(invocation)
}

/// [`Engine::sequentially`] on the process-wide token.
///
/// # Errors
///
/// See [`Engine::invoke`].
pub fn sequentially(invocation: Invocation) -> Result<Invoked, GroupError> {
    Engine::default().sequentially(invocation)
}
