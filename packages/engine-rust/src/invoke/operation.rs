//! Operation types: callables, scopes, operands, and group errors.

use std::any::type_name;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tandem_core::{CancelToken, Value};

type CallFn = dyn Fn(&CancelToken) -> anyhow::Result<Value> + Send + Sync;

/// Returns the last path segment of a type name, without generic arguments.
///
/// `my_crate::devices::fetch_trace` becomes `fetch_trace`; closures keep
/// their `{{closure}}` segment so two unnamed closures collide by name.
pub(crate) fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

// ---------------------------------------------------------------------------
// Call
// ---------------------------------------------------------------------------

/// A named callable operation.
///
/// Arguments are bound by closure capture. Identity is the shared allocation
/// of the callable: clones of one `Call` are the same operand and cannot be
/// submitted twice in one group.
#[derive(Clone)]
pub struct Call {
    name: String,
    func: Arc<CallFn>,
}

impl Call {
    /// Wrap `f` under an explicit name.
    pub fn new<F, R>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CancelToken) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Into<Value>,
    {
        Self {
            name: name.into(),
            func: Arc::new(move |token: &CancelToken| f(token).map(Into::<Value>::into)),
        }
    }

    /// Wrap `f`, deriving the name from the callable's own type name.
    ///
    /// Function items yield their identifier; closures all yield
    /// `{{closure}}`, so pass closures through [`Call::new`] or a named
    /// operand instead.
    pub fn from_fn<F, R>(f: F) -> Self
    where
        F: Fn(&CancelToken) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Into<Value>,
    {
        let name = short_type_name(type_name::<F>()).to_string();
        Self::new(name, f)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.name = name;
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.func).cast::<()>() as usize
    }

    /// Run the callable, converting a panic into an [`OperationPanicked`] error.
    ///
    /// # Errors
    ///
    /// Returns whatever the callable returns, or `OperationPanicked`.
    pub fn invoke(&self, token: &CancelToken) -> anyhow::Result<Value> {
        match catch_unwind(AssertUnwindSafe(|| (self.func)(token))) {
            Ok(result) => result,
            Err(payload) => Err(OperationPanicked {
                name: self.name.clone(),
                message: panic_message(&*payload),
            }
            .into()),
        }
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call").field("name", &self.name).finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// A resource with scoped acquisition.
///
/// `enter` may run on any thread (concurrently with sibling scopes), so
/// implementors use interior mutability. `exit` is only called for scopes
/// whose `enter` returned `Ok`, except for a best-effort cleanup attempt
/// after a failed `enter`.
pub trait Scope: Send + Sync {
    /// Acquire the resource. Long waits should go through `token`.
    ///
    /// # Errors
    ///
    /// Any error aborts entry of the whole group.
    fn enter(&self, token: &CancelToken) -> anyhow::Result<()>;

    /// Release the resource.
    ///
    /// # Errors
    ///
    /// Exit errors are collected; they never stop sibling scopes from exiting.
    fn exit(&self) -> anyhow::Result<()>;

    /// Diagnostic name, used when the scope is passed positionally.
    fn name(&self) -> String {
        short_type_name(type_name::<Self>()).to_string()
    }
}

/// A named, shared handle to a [`Scope`].
#[derive(Clone)]
pub struct ScopeRef {
    name: String,
    scope: Arc<dyn Scope>,
}

impl ScopeRef {
    pub fn new(scope: Arc<dyn Scope>) -> Self {
        Self {
            name: scope.name(),
            scope,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.name = name;
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.scope).cast::<()>() as usize
    }

    pub(crate) fn enter(&self, token: &CancelToken) -> anyhow::Result<()> {
        self.scope.enter(token)
    }

    pub(crate) fn exit(&self) -> anyhow::Result<()> {
        self.scope.exit()
    }
}

impl fmt::Debug for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeRef").field("name", &self.name).finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Operand
// ---------------------------------------------------------------------------

/// One user-supplied operand, resolved at the call boundary.
#[derive(Debug, Clone)]
pub enum Operand {
    /// A plain callable.
    Call(Call),
    /// A scoped resource.
    Scope(ScopeRef),
    /// An object usable either way; the rest of the group decides which.
    Dual { call: Call, scope: ScopeRef },
    /// A plain value. Maps are nested result contributions; anything else
    /// is only valid as a control option.
    Value(Value),
}

impl Operand {
    /// Shorthand for `Operand::Scope(ScopeRef::new(scope))`.
    pub fn scope<S: Scope + 'static>(scope: Arc<S>) -> Self {
        Operand::Scope(ScopeRef::new(scope))
    }

    /// Shorthand for an operand that is both callable and a scope.
    pub fn dual<S: Scope + 'static>(call: Call, scope: Arc<S>) -> Self {
        Operand::Dual {
            call,
            scope: ScopeRef::new(scope),
        }
    }
}

impl From<Call> for Operand {
    fn from(call: Call) -> Self {
        Operand::Call(call)
    }
}

impl From<ScopeRef> for Operand {
    fn from(scope: ScopeRef) -> Self {
        Operand::Scope(scope)
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Operand::Value(value)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Raised in place of a panic escaping an operation body.
#[derive(Debug, thiserror::Error)]
#[error("operation {name:?} panicked: {message}")]
pub struct OperationPanicked {
    pub name: String,
    pub message: String,
}

/// Invalid group composition. Always surfaced immediately, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot run a mixture of scopes and callables")]
    MixedOperands,
    #[error("all operands support both calling and scope management - not sure which to run")]
    Ambiguous,
    #[error("each operand must be a callable and/or a scope, but given {name}={kind}")]
    NotAnOperation { name: String, kind: &'static str },
    #[error("each callable and scope must be unique, but {name:?} was passed more than once")]
    DuplicateOperand { name: String },
    #[error("another operation is already named {name:?} - pass it as a named operand to specify a different name")]
    DuplicateName { name: String },
    #[error("key {key:?} conflicts when merging nested results")]
    KeyCollision { key: String },
    #[error("mapping contributions cannot be combined with scopes")]
    MappingWithScopes,
    #[error("option {name:?} expects a {expected} value, got {got}")]
    OptionType {
        name: &'static str,
        expected: &'static str,
        got: &'static str,
    },
}

/// One operation's captured error.
#[derive(Debug)]
pub struct OperationFailure {
    pub name: String,
    pub error: anyhow::Error,
}

/// Two or more operations of one group failed.
///
/// Failures are kept in completion order.
#[derive(Debug)]
pub struct AggregateError {
    group: String,
    failures: Vec<OperationFailure>,
}

impl AggregateError {
    pub(crate) fn new(group: impl Into<String>, failures: Vec<OperationFailure>) -> Self {
        Self {
            group: group.into(),
            failures,
        }
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn failures(&self) -> &[OperationFailure] {
        &self.failures
    }

    #[must_use]
    pub fn into_failures(self) -> Vec<OperationFailure> {
        self.failures
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Look up the error captured for the named operation.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&anyhow::Error> {
        self.failures
            .iter()
            .find(|f| f.name == name)
            .map(|f| &f.error)
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} operations in group {:?} raised errors",
            self.failures.len(),
            self.group
        )?;
        for failure in &self.failures {
            write!(f, "\n  {}: {:#}", failure.name, failure.error)?;
        }
        Ok(())
    }
}

/// The first captured failure is exposed as the source, so `{:#}` and
/// `anyhow::Error::chain` reach an underlying cause.
impl std::error::Error for AggregateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|failure| &*failure.error as &(dyn std::error::Error + 'static))
    }
}

/// Final error of an invocation group.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Exactly one operation failed; its error passes through unmodified.
    #[error(transparent)]
    Failed(anyhow::Error),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl GroupError {
    /// Collapse a list of failures into the group's final error.
    ///
    /// Returns `None` for an empty list.
    pub(crate) fn from_failures(group: &str, mut failures: Vec<OperationFailure>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop().map(|f| GroupError::Failed(f.error)),
            _ => Some(GroupError::Aggregate(AggregateError::new(group, failures))),
        }
    }

    /// The passthrough error when exactly one operation failed.
    #[must_use]
    pub fn as_failure(&self) -> Option<&anyhow::Error> {
        match self {
            GroupError::Failed(err) => Some(err),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_aggregate(&self) -> Option<&AggregateError> {
        match self {
            GroupError::Aggregate(agg) => Some(agg),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_config(&self) -> Option<&ConfigError> {
        match self {
            GroupError::Config(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch_trace(_: &CancelToken) -> anyhow::Result<i64> {
        Ok(7)
    }

    struct Relay;

    impl Scope for Relay {
        fn enter(&self, _: &CancelToken) -> anyhow::Result<()> {
            Ok(())
        }

        fn exit(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn short_names() {
        assert_eq!(short_type_name("a::b::fetch"), "fetch");
        assert_eq!(short_type_name("a::Wrapper<a::b::Inner>"), "Wrapper");
        assert_eq!(short_type_name("plain"), "plain");
        assert_eq!(short_type_name("a::b::{{closure}}"), "{{closure}}");
    }

    #[test]
    fn from_fn_derives_identifier() {
        let call = Call::from_fn(fetch_trace);
        assert_eq!(call.name(), "fetch_trace");
        assert_eq!(call.invoke(&CancelToken::new()).unwrap(), Value::Int(7));
    }

    #[test]
    fn closures_share_a_derived_name() {
        let a = Call::from_fn(|_: &CancelToken| Ok(1));
        let b = Call::from_fn(|_: &CancelToken| Ok(2));
        assert_eq!(a.name(), b.name());
        assert_eq!(a.name(), "{{closure}}");
    }

    #[test]
    fn clones_share_identity() {
        let a = Call::new("a", |_: &CancelToken| Ok(()));
        let b = a.clone();
        let c = Call::new("a", |_: &CancelToken| Ok(()));
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
    }

    #[test]
    fn panics_become_errors() {
        let call = Call::new("boom", |_: &CancelToken| -> anyhow::Result<()> {
            panic!("detonated")
        });
        let err = call.invoke(&CancelToken::new()).unwrap_err();
        let panicked = err.downcast_ref::<OperationPanicked>().unwrap();
        assert_eq!(panicked.name, "boom");
        assert_eq!(panicked.message, "detonated");
    }

    #[test]
    fn scope_name_defaults_to_type() {
        let scope = ScopeRef::new(Arc::new(Relay));
        assert_eq!(scope.name(), "Relay");
    }

    #[test]
    fn single_failure_passes_through() {
        let failures = vec![OperationFailure {
            name: "f".to_string(),
            error: anyhow::Error::new(std::io::Error::other("disk")),
        }];
        let err = GroupError::from_failures("g", failures).unwrap();
        let inner = err.as_failure().unwrap();
        assert!(inner.downcast_ref::<std::io::Error>().is_some());
        assert_eq!(err.to_string(), "disk");
    }

    #[test]
    fn aggregate_lists_every_failure() {
        let failures = vec![
            OperationFailure {
                name: "a".to_string(),
                error: anyhow::anyhow!("first"),
            },
            OperationFailure {
                name: "b".to_string(),
                error: anyhow::anyhow!("second"),
            },
        ];
        let err = GroupError::from_failures("bench", failures).unwrap();
        let agg = err.as_aggregate().unwrap();
        assert_eq!(agg.len(), 2);
        assert_eq!(agg.get("b").unwrap().to_string(), "second");
        let text = err.to_string();
        assert!(text.starts_with("2 operations in group \"bench\" raised errors"));
        assert!(text.contains("a: first"));
    }

    #[test]
    fn aggregate_source_is_first_failure() {
        use std::error::Error as _;

        let failures = vec![
            OperationFailure {
                name: "read_a".to_string(),
                error: std::io::Error::new(std::io::ErrorKind::TimedOut, "bus timeout").into(),
            },
            OperationFailure {
                name: "read_b".to_string(),
                error: anyhow::anyhow!("second"),
            },
        ];
        let agg = AggregateError::new("bench", failures);
        let source = agg.source().unwrap();
        assert_eq!(source.to_string(), "bus timeout");
        assert!(source.downcast_ref::<std::io::Error>().is_some());

        let chained = anyhow::Error::new(agg);
        assert_eq!(chained.chain().count(), 2);
    }

    #[test]
    fn no_failures_no_error() {
        assert!(GroupError::from_failures("g", Vec::new()).is_none());
    }
}
