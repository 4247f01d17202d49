//! The object surface a sandbox exposes to other threads.

use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt;

use tandem_core::Value;

use super::SandboxError;

// ---------------------------------------------------------------------------
// Args
// ---------------------------------------------------------------------------

/// Positional and keyword arguments for a remote method call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    positional: Vec<Value>,
    named: BTreeMap<String, Value>,
}

impl Args {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    #[must_use]
    pub fn named(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }
}

impl From<Vec<Value>> for Args {
    fn from(positional: Vec<Value>) -> Self {
        Self {
            positional,
            named: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Member
// ---------------------------------------------------------------------------

/// What a remote `get` or `call` hands back to the worker.
pub enum Member {
    /// A plain value, always copied out to the caller.
    Value(Value),
    /// An object from the protected graph. The worker decides whether it
    /// stays behind a proxy.
    Object(Box<dyn Remote>),
}

impl Member {
    pub fn object<T: Remote>(object: T) -> Self {
        Member::Object(Box::new(object))
    }
}

impl From<Value> for Member {
    fn from(value: Value) -> Self {
        Member::Value(value)
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Member::Object(object) => f.debug_tuple("Object").field(&object.type_name()).finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

/// An object that lives on a sandbox worker thread.
///
/// Implementors need not be `Send`: they are constructed, used, and dropped
/// on the worker. Every method defaults to rejecting the member, so
/// implementors only override what they expose.
pub trait Remote: 'static {
    /// Read an attribute.
    ///
    /// # Errors
    ///
    /// Defaults to [`SandboxError::UnknownMember`].
    fn get(&mut self, member: &str) -> anyhow::Result<Member> {
        Err(unknown(self.type_name(), member))
    }

    /// Assign an attribute.
    ///
    /// # Errors
    ///
    /// Defaults to [`SandboxError::UnknownMember`].
    fn set(&mut self, member: &str, value: Value) -> anyhow::Result<()> {
        let _ = value;
        Err(unknown(self.type_name(), member))
    }

    /// Invoke a method.
    ///
    /// # Errors
    ///
    /// Defaults to [`SandboxError::UnknownMember`].
    fn call(&mut self, method: &str, args: Args) -> anyhow::Result<Member> {
        let _ = args;
        Err(unknown(self.type_name(), method))
    }

    /// Release held resources. Runs on the worker when the session ends.
    ///
    /// # Errors
    ///
    /// Errors are logged; teardown continues.
    fn finalize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Full type path, used by the default proxy predicate.
    fn type_name(&self) -> &'static str {
        type_name::<Self>()
    }

    fn describe(&self) -> String {
        self.type_name().to_string()
    }

    /// A plain-value rendition for objects that may leave the worker.
    fn as_value(&self) -> Option<Value> {
        None
    }
}

fn unknown(type_name: &'static str, member: &str) -> anyhow::Error {
    SandboxError::UnknownMember {
        type_name,
        member: member.to_string(),
    }
    .into()
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// Decides whether an object handed out by the worker must stay behind a
/// proxy.
pub type Predicate = Box<dyn Fn(&dyn Remote) -> bool + Send>;

/// The module path of a type name: `a::b::Thing<c::D>` becomes `a::b`.
#[must_use]
pub fn module_path_of(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit_once("::").map_or("", |(module, _)| module)
}

/// Proxy every object whose type is declared in the same module as `R`.
#[must_use]
pub fn same_module_as<R: ?Sized>() -> Predicate {
    let root = module_path_of(type_name::<R>());
    Box::new(move |object: &dyn Remote| module_path_of(object.type_name()) == root)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;
    impl Remote for Probe {}

    mod elsewhere {
        pub struct Sample;
        impl super::Remote for Sample {}
    }

    #[test]
    fn module_paths() {
        assert_eq!(module_path_of("a::b::Thing"), "a::b");
        assert_eq!(module_path_of("a::b::Thing<c::d::E>"), "a::b");
        assert_eq!(module_path_of("Thing"), "");
    }

    #[test]
    fn default_predicate_follows_modules() {
        let predicate = same_module_as::<Probe>();
        assert!(predicate(&Probe as &dyn Remote));
        assert!(!predicate(&elsewhere::Sample as &dyn Remote));
    }

    #[test]
    fn unimplemented_members_are_unknown() {
        let mut probe = Probe;
        let err = probe.get("voltage").unwrap_err();
        let SandboxError::UnknownMember { member, .. } =
            err.downcast_ref::<SandboxError>().unwrap()
        else {
            panic!("unexpected error {err}");
        };
        assert_eq!(member, "voltage");
    }

    #[test]
    fn args_builder() {
        let args = Args::new().arg(1).arg("two").kwarg("gain", 3.5);
        assert_eq!(args.positional().len(), 2);
        assert_eq!(args.get(1), Some(&Value::from("two")));
        assert_eq!(args.named("gain"), Some(&Value::Float(3.5)));
        assert!(!args.is_empty());
    }
}
