use std::fmt;
use std::sync::Arc;

use tandem_core::Value;

use super::protocol::{Command, ObjectId, Session, Target};
use super::remote::Args;
use super::SandboxError;

/// A value handed back across the sandbox boundary.
#[derive(Debug)]
pub enum Returned {
    Value(Value),
    Proxy(Proxy),
}

impl Returned {
    /// The plain value.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::NotAValue`] for a proxied object.
    pub fn into_value(self) -> Result<Value, SandboxError> {
        match self {
            Returned::Value(value) => Ok(value),
            Returned::Proxy(proxy) => Err(SandboxError::NotAValue {
                type_name: proxy.type_name,
            }),
        }
    }

    /// The proxy handle.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::NotAnObject`] for a plain value.
    pub fn into_proxy(self) -> Result<Proxy, SandboxError> {
        match self {
            Returned::Proxy(proxy) => Ok(proxy),
            Returned::Value(value) => Err(SandboxError::NotAnObject { kind: value.kind() }),
        }
    }
}

/// Routing handle to an object that must stay on the sandbox worker.
///
/// Every operation becomes a request against the owning session and blocks
/// until the worker answers. Dropping the proxy frees the object on the
/// worker.
pub struct Proxy {
    session: Arc<Session>,
    id: ObjectId,
    type_name: &'static str,
}

impl Proxy {
    pub(crate) fn new(session: Arc<Session>, id: ObjectId, type_name: &'static str) -> Self {
        Self {
            session,
            id,
            type_name,
        }
    }

    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Type path of the object behind the proxy.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// # Errors
    ///
    /// Returns the object's own error unmodified, or a [`SandboxError`] when
    /// the session has ended.
    pub fn get(&self, member: &str) -> anyhow::Result<Returned> {
        let target = Target::Object(self.id);
        let member = member.to_string();
        self.session.request(|reply| Command::Get {
            target,
            member,
            reply,
        })
    }

    /// # Errors
    ///
    /// Same as [`Proxy::get`].
    pub fn set(&self, member: &str, value: impl Into<Value>) -> anyhow::Result<()> {
        let target = Target::Object(self.id);
        let member = member.to_string();
        let value = value.into();
        self.session
            .request(|reply| Command::Set {
                target,
                member,
                value,
                reply,
            })
            .map(drop)
    }

    /// # Errors
    ///
    /// Same as [`Proxy::get`].
    pub fn call(&self, method: &str, args: Args) -> anyhow::Result<Returned> {
        let target = Target::Object(self.id);
        let method = method.to_string();
        self.session.request(|reply| Command::Call {
            target,
            method,
            args,
            reply,
        })
    }

    /// The object's own description, rendered on the worker.
    ///
    /// # Errors
    ///
    /// Returns a [`SandboxError`] when the session has ended.
    pub fn describe(&self) -> anyhow::Result<String> {
        let target = Target::Object(self.id);
        let returned = self.session.request(|reply| Command::Describe { target, reply })?;
        match returned.into_value()? {
            Value::String(text) => Ok(text),
            other => Ok(format!("{other:?}")),
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.session.release(self.id);
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("session", &self.session.label())
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .finish()
    }
}
