//! Operand classification: turns an [`Invocation`] into a runnable group.
//!
//! Classification extracts control options, separates nested result
//! contributions from operations, decides whether the group is callable-style
//! or scope-style, then assigns and validates names.

use std::collections::HashSet;

use tandem_core::{ResultMap, Value};

use super::config::GroupParams;
use super::merge::merge_contributions;
use super::operation::{Call, ConfigError, Operand, ScopeRef};

/// Option names recognized among named operands.
pub mod option_names {
    pub const CATCH: &str = "catch";
    pub const NONES: &str = "nones";
    pub const FLATTEN: &str = "flatten";
    pub const TRACEBACK_DELAY: &str = "traceback_delay";
    pub const NAME: &str = "name";
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Operands and control options for one invocation group.
///
/// Positional operands are named after their callable or scope; named
/// operands use their key. Option setters are sugar for named plain values
/// under the recognized option names, so a scope or callable registered under
/// the name `catch` is still treated as an operation.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    positional: Vec<Operand>,
    named: Vec<(String, Operand)>,
}

impl Invocation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a positional operand.
    #[must_use]
    pub fn add(mut self, operand: impl Into<Operand>) -> Self {
        self.positional.push(operand.into());
        self
    }

    /// Add a named operand.
    ///
    /// Names are never overwritten: passing the same name twice makes
    /// [`classify`] fail with [`ConfigError::DuplicateName`].
    #[must_use]
    pub fn named(mut self, name: impl Into<String>, operand: impl Into<Operand>) -> Self {
        self.named.push((name.into(), operand.into()));
        self
    }

    /// Set a control option, replacing any earlier value for it.
    fn option(mut self, name: &'static str, value: Value) -> Self {
        self.named.retain(|(existing, _)| existing.as_str() != name);
        self.named.push((name.to_string(), Operand::Value(value)));
        self
    }

    #[must_use]
    pub fn catch(self, catch: bool) -> Self {
        self.option(option_names::CATCH, Value::Bool(catch))
    }

    #[must_use]
    pub fn nones(self, nones: bool) -> Self {
        self.option(option_names::NONES, Value::Bool(nones))
    }

    #[must_use]
    pub fn flatten(self, flatten: bool) -> Self {
        self.option(option_names::FLATTEN, Value::Bool(flatten))
    }

    #[must_use]
    pub fn traceback_delay(self, delay: bool) -> Self {
        self.option(option_names::TRACEBACK_DELAY, Value::Bool(delay))
    }

    #[must_use]
    pub fn name(self, name: impl Into<String>) -> Self {
        self.option(option_names::NAME, Value::String(name.into()))
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Outcome of classifying an [`Invocation`].
#[derive(Debug)]
pub enum Classified {
    /// Nothing to run.
    Empty,
    /// Callable-style group.
    Calls {
        params: GroupParams,
        calls: Vec<Call>,
        contributions: ResultMap,
    },
    /// Scope-style group.
    Scopes {
        params: GroupParams,
        scopes: Vec<ScopeRef>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Callable,
    Scope,
    Both,
}

impl Kind {
    /// `None` for plain values, which never select a runner style.
    fn of(operand: &Operand) -> Option<Self> {
        match operand {
            Operand::Call(_) => Some(Kind::Callable),
            Operand::Scope(_) => Some(Kind::Scope),
            Operand::Dual { .. } => Some(Kind::Both),
            Operand::Value(_) => None,
        }
    }
}

enum Resolved {
    Call(Call),
    Scope(ScopeRef),
}

impl Resolved {
    fn identity(&self) -> usize {
        match self {
            Resolved::Call(c) => c.identity(),
            Resolved::Scope(s) => s.identity(),
        }
    }

    fn default_name(&self) -> &str {
        match self {
            Resolved::Call(c) => c.name(),
            Resolved::Scope(s) => s.name(),
        }
    }
}

fn bool_option(name: &'static str, value: &Value) -> Result<bool, ConfigError> {
    value.as_bool().ok_or(ConfigError::OptionType {
        name,
        expected: "bool",
        got: value.kind(),
    })
}

fn apply_option(
    params: &mut GroupParams,
    name: &str,
    value: &Value,
) -> Result<bool, ConfigError> {
    match name {
        option_names::CATCH => params.catch = bool_option(option_names::CATCH, value)?,
        option_names::NONES => params.nones = bool_option(option_names::NONES, value)?,
        option_names::FLATTEN => params.flatten = bool_option(option_names::FLATTEN, value)?,
        option_names::TRACEBACK_DELAY => {
            params.traceback_delay = bool_option(option_names::TRACEBACK_DELAY, value)?;
        }
        option_names::NAME => {
            params.name = value
                .as_str()
                .ok_or(ConfigError::OptionType {
                    name: option_names::NAME,
                    expected: "string",
                    got: value.kind(),
                })?
                .to_string();
        }
        _ => return Ok(false),
    }
    Ok(true)
}

/// Classify an invocation.
///
/// # Errors
///
/// Returns a [`ConfigError`] when operands mix callables and scopes, are all
/// ambiguous, repeat an operand, repeat a name, include a plain value that is
/// neither an option nor a map, carry a mistyped option, combine mapping
/// contributions with scopes, or when contributions collide.
pub fn classify(invocation: Invocation) -> Result<Classified, ConfigError> {
    let mut params = GroupParams::default();

    let mut candidates: Vec<(Option<String>, Operand)> = invocation
        .positional
        .into_iter()
        .map(|operand| (None, operand))
        .collect();

    let mut named_keys = HashSet::new();
    for (name, _) in &invocation.named {
        if !named_keys.insert(name.as_str()) {
            return Err(ConfigError::DuplicateName { name: name.clone() });
        }
    }

    for (name, operand) in invocation.named {
        if let Operand::Value(value) = &operand {
            if apply_option(&mut params, &name, value)? {
                continue;
            }
        }
        candidates.push((Some(name), operand));
    }

    // Separate nested contributions and reject non-operation values.
    let mut contributions = Vec::new();
    let mut operations = Vec::new();
    for (name, operand) in candidates {
        match operand {
            Operand::Value(Value::Map(map)) => contributions.push(map),
            Operand::Value(other) => {
                return Err(ConfigError::NotAnOperation {
                    name: name.unwrap_or_else(|| "<positional>".to_string()),
                    kind: other.kind(),
                })
            }
            operand => operations.push((name, operand)),
        }
    }

    let mut group_kind: Option<Kind> = None;
    for this in operations.iter().filter_map(|(_, operand)| Kind::of(operand)) {
        group_kind = match group_kind {
            None | Some(Kind::Both) => Some(this),
            Some(current) if this == current || this == Kind::Both => Some(current),
            Some(_) => return Err(ConfigError::MixedOperands),
        };
    }

    let group_kind = match group_kind {
        None => return Ok(Classified::Empty),
        Some(Kind::Both) => return Err(ConfigError::Ambiguous),
        Some(kind) => kind,
    };

    let resolved: Vec<(Option<String>, Resolved)> = operations
        .into_iter()
        .map(|(name, operand)| {
            let resolved = match (operand, group_kind) {
                (Operand::Call(call) | Operand::Dual { call, .. }, Kind::Callable) => {
                    Resolved::Call(call)
                }
                (Operand::Scope(scope) | Operand::Dual { scope, .. }, _) => Resolved::Scope(scope),
                _ => return Err(ConfigError::MixedOperands),
            };
            Ok((name, resolved))
        })
        .collect::<Result<_, _>>()?;

    let mut seen_identities = HashSet::new();
    for (name, op) in &resolved {
        if !seen_identities.insert(op.identity()) {
            return Err(ConfigError::DuplicateOperand {
                name: name.clone().unwrap_or_else(|| op.default_name().to_string()),
            });
        }
    }

    let mut seen_names = HashSet::new();
    let mut calls = Vec::new();
    let mut scopes = Vec::new();
    for (name, op) in resolved {
        let name = name.unwrap_or_else(|| op.default_name().to_string());
        if !seen_names.insert(name.clone()) {
            return Err(ConfigError::DuplicateName { name });
        }
        match op {
            Resolved::Call(mut call) => {
                call.rename(name);
                calls.push(call);
            }
            Resolved::Scope(mut scope) => {
                scope.rename(name);
                scopes.push(scope);
            }
        }
    }

    match group_kind {
        Kind::Scope => {
            if !contributions.is_empty() {
                return Err(ConfigError::MappingWithScopes);
            }
            tracing::trace!(group = %params.name, scopes = scopes.len(), "classified scope group");
            Ok(Classified::Scopes { params, scopes })
        }
        _ => {
            let contributions = merge_contributions(contributions, &seen_names)?;
            tracing::trace!(group = %params.name, calls = calls.len(), "classified callable group");
            Ok(Classified::Calls {
                params,
                calls,
                contributions,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use tandem_core::CancelToken;

    use super::*;
    use crate::invoke::operation::Scope;

    fn fetch(_: &CancelToken) -> anyhow::Result<i64> {
        Ok(1)
    }

    fn setup(_: &CancelToken) -> anyhow::Result<()> {
        Ok(())
    }

    struct Analyzer;

    impl Scope for Analyzer {
        fn enter(&self, _: &CancelToken) -> anyhow::Result<()> {
            Ok(())
        }

        fn exit(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn noop_scope() -> Operand {
        Operand::scope(Arc::new(Analyzer))
    }

    fn names(classified: &Classified) -> Vec<String> {
        match classified {
            Classified::Calls { calls, .. } => calls.iter().map(|c| c.name().to_string()).collect(),
            Classified::Scopes { scopes, .. } => {
                scopes.iter().map(|s| s.name().to_string()).collect()
            }
            Classified::Empty => Vec::new(),
        }
    }

    #[test]
    fn empty_invocation_is_empty() {
        assert!(matches!(classify(Invocation::new()).unwrap(), Classified::Empty));
    }

    #[test]
    fn options_only_is_empty() {
        let inv = Invocation::new().catch(true).name("idle");
        assert!(matches!(classify(inv).unwrap(), Classified::Empty));
    }

    #[test]
    fn positional_calls_take_derived_names() {
        let inv = Invocation::new()
            .add(Call::from_fn(fetch))
            .add(Call::from_fn(setup));
        let classified = classify(inv).unwrap();
        assert_eq!(names(&classified), vec!["fetch", "setup"]);
    }

    #[test]
    fn named_operands_override_derived_names() {
        let inv = Invocation::new()
            .named("first", Call::from_fn(fetch))
            .named("second", Call::from_fn(fetch));
        let classified = classify(inv).unwrap();
        assert_eq!(names(&classified), vec!["first", "second"]);
    }

    #[test]
    fn options_are_consumed() {
        let inv = Invocation::new()
            .add(Call::from_fn(fetch))
            .catch(true)
            .nones(true)
            .flatten(false)
            .traceback_delay(false)
            .name("bench");
        match classify(inv).unwrap() {
            Classified::Calls { params, calls, .. } => {
                assert!(params.catch);
                assert!(params.nones);
                assert!(!params.flatten);
                assert!(!params.traceback_delay);
                assert_eq!(params.name, "bench");
                assert_eq!(calls.len(), 1);
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn operation_named_like_an_option_passes_through() {
        let inv = Invocation::new().named("catch", noop_scope());
        match classify(inv).unwrap() {
            Classified::Scopes { params, scopes } => {
                assert!(!params.catch);
                assert_eq!(scopes[0].name(), "catch");
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn mistyped_option_is_rejected() {
        let inv = Invocation::new().named("catch", Value::from("yes"));
        assert_eq!(
            classify(inv).unwrap_err(),
            ConfigError::OptionType {
                name: "catch",
                expected: "bool",
                got: "string"
            }
        );
    }

    #[test]
    fn plain_value_is_not_an_operation() {
        let inv = Invocation::new().named("threshold", Value::Int(3));
        assert!(matches!(
            classify(inv).unwrap_err(),
            ConfigError::NotAnOperation { name, kind: "int" } if name == "threshold"
        ));
    }

    #[test]
    fn mixing_calls_and_scopes_fails() {
        let inv = Invocation::new().add(Call::from_fn(fetch)).add(noop_scope());
        assert_eq!(classify(inv).unwrap_err(), ConfigError::MixedOperands);
    }

    #[test]
    fn all_dual_is_ambiguous() {
        let inv = Invocation::new()
            .add(Operand::dual(Call::from_fn(fetch), Arc::new(Analyzer)))
            .add(Operand::dual(Call::from_fn(setup), Arc::new(Analyzer)));
        assert_eq!(classify(inv).unwrap_err(), ConfigError::Ambiguous);
    }

    #[test]
    fn dual_follows_the_rest_of_the_group() {
        let inv = Invocation::new()
            .named("dual", Operand::dual(Call::from_fn(setup), Arc::new(Analyzer)))
            .named("plain", noop_scope());
        assert!(matches!(classify(inv).unwrap(), Classified::Scopes { .. }));

        let inv = Invocation::new()
            .named("dual", Operand::dual(Call::from_fn(setup), Arc::new(Analyzer)))
            .add(Call::from_fn(fetch));
        assert!(matches!(classify(inv).unwrap(), Classified::Calls { .. }));
    }

    #[test]
    fn same_operand_under_two_names_is_rejected() {
        let call = Call::from_fn(fetch);
        let inv = Invocation::new()
            .named("a", call.clone())
            .named("b", call);
        assert!(matches!(
            classify(inv).unwrap_err(),
            ConfigError::DuplicateOperand { .. }
        ));
    }

    #[test]
    fn same_scope_twice_is_rejected() {
        let scope = Arc::new(Analyzer);
        let inv = Invocation::new()
            .named("a", Operand::scope(Arc::clone(&scope)))
            .named("b", Operand::scope(scope));
        assert!(matches!(
            classify(inv).unwrap_err(),
            ConfigError::DuplicateOperand { .. }
        ));
    }

    #[test]
    fn duplicate_derived_names_are_rejected() {
        let inv = Invocation::new()
            .add(Call::from_fn(|_: &CancelToken| Ok(1)))
            .add(Call::from_fn(|_: &CancelToken| Ok(2)));
        assert_eq!(
            classify(inv).unwrap_err(),
            ConfigError::DuplicateName {
                name: "{{closure}}".to_string()
            }
        );
    }

    #[test]
    fn repeated_named_operand_is_rejected() {
        let inv = Invocation::new()
            .named("trace", Call::from_fn(|_: &CancelToken| Ok(1)))
            .named("trace", Call::from_fn(|_: &CancelToken| Ok(2)));
        assert_eq!(
            classify(inv).unwrap_err(),
            ConfigError::DuplicateName {
                name: "trace".to_string()
            }
        );
    }

    #[test]
    fn option_setters_replace_earlier_values() {
        let inv = Invocation::new()
            .add(Call::from_fn(fetch))
            .catch(true)
            .catch(false)
            .name("first")
            .name("second");
        match classify(inv).unwrap() {
            Classified::Calls { params, .. } => {
                assert!(!params.catch);
                assert_eq!(params.name, "second");
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn contributions_are_merged() {
        let mut nested = BTreeMap::new();
        nested.insert("calibration".to_string(), Value::Int(3));
        let inv = Invocation::new()
            .add(Call::from_fn(fetch))
            .named("previous", Value::Map(nested));
        match classify(inv).unwrap() {
            Classified::Calls { contributions, .. } => {
                assert_eq!(contributions["calibration"], Value::Int(3));
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn contributions_with_scopes_are_rejected() {
        let inv = Invocation::new()
            .add(noop_scope())
            .named("previous", Value::Map(BTreeMap::new()));
        assert_eq!(classify(inv).unwrap_err(), ConfigError::MappingWithScopes);
    }

    #[test]
    fn contribution_key_matching_an_operation_is_rejected() {
        let mut nested = BTreeMap::new();
        nested.insert("fetch".to_string(), Value::Int(3));
        let inv = Invocation::new()
            .add(Call::from_fn(fetch))
            .named("previous", Value::Map(nested));
        assert_eq!(
            classify(inv).unwrap_err(),
            ConfigError::KeyCollision {
                key: "fetch".to_string()
            }
        );
    }

    #[test]
    fn contributions_alone_are_empty() {
        let inv = Invocation::new().named("previous", Value::Map(BTreeMap::new()));
        assert!(matches!(classify(inv).unwrap(), Classified::Empty));
    }
}
