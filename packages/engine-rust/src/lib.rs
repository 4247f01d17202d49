//! Tandem Engine: invocation groups, scope aggregation, and the thread
//! affinity sandbox.

pub mod invoke;
pub mod logging;
pub mod sandbox;

pub use invoke::{
    concurrently, sequentially, AggregateError, Call, ConfigError, Engine, EnteredScopes,
    GroupError, Invocation, Invoked, Operand, Runner, RunnerConfig, Scope, ScopeGroup,
};
pub use sandbox::{Args, Member, Proxy, Remote, Returned, Sandbox, SandboxError};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
