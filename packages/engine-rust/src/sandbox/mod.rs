//! Thread affinity sandbox.
//!
//! A [`Sandbox`] dedicates one worker thread to a resource that must only
//! ever be touched from that thread. The factory, every access, and the
//! final teardown all run on the worker; callers talk to it over a bounded
//! request channel of capacity 1 and block on a private reply channel.
//!
//! Objects handed out of the protected graph stay on the worker and come
//! back as [`Proxy`] handles. Dropping a proxy frees its object. Which
//! objects count as part of the graph is decided by a [`Predicate`]; the
//! default keeps every object whose type is declared in the root type's
//! module.

mod protocol;
mod proxy;
mod remote;
mod worker;

use std::any::{type_name, Any};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tandem_core::Value;

use crate::invoke::{panic_message, short_type_name};
use protocol::{Command, ExecFn, Session, Target};
use worker::Worker;

pub use protocol::ObjectId;
pub use proxy::{Proxy, Returned};
pub use remote::{module_path_of, same_module_as, Args, Member, Predicate, Remote};

/// Errors raised by the sandbox machinery itself.
///
/// Errors raised by the protected object pass through unmodified instead.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox session has ended")]
    Closed,
    #[error("a sandbox cannot be driven from its own worker thread")]
    Reentrant,
    #[error("failed to spawn sandbox worker")]
    Spawn(#[source] std::io::Error),
    /// The factory failed or panicked; nothing was constructed.
    #[error(transparent)]
    Factory(anyhow::Error),
    #[error("{type_name} has no member {member:?}")]
    UnknownMember {
        type_name: &'static str,
        member: String,
    },
    #[error("member {member:?} expects a {expected} value, got {got}")]
    TypeMismatch {
        member: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("no object {id} in this sandbox session")]
    NoSuchObject { id: u64 },
    #[error("sandbox request panicked: {message}")]
    Panicked { message: String },
    #[error("{type_name} is proxied, not a plain value")]
    NotAValue { type_name: &'static str },
    #[error("expected a proxied object, got a plain {kind}")]
    NotAnObject { kind: &'static str },
    #[error("sandbox root is not a {expected}")]
    RootType { expected: &'static str },
}

/// Transparent handle to a resource owned by a dedicated worker thread.
pub struct Sandbox<R: Remote> {
    session: Arc<Session>,
    handle: Option<JoinHandle<()>>,
    _root: PhantomData<fn() -> R>,
}

impl<R: Remote> Sandbox<R> {
    /// Start a worker, build the resource on it, and proxy objects declared
    /// in the resource type's module.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Factory`] with the factory's own error, or
    /// [`SandboxError::Spawn`] when no thread could be started.
    pub fn new<F>(factory: F) -> Result<Self, SandboxError>
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    {
        Self::with_predicate(factory, same_module_as::<R>())
    }

    /// Like [`Sandbox::new`] with a custom proxy predicate.
    ///
    /// # Errors
    ///
    /// See [`Sandbox::new`].
    pub fn with_predicate<F>(factory: F, predicate: Predicate) -> Result<Self, SandboxError>
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    {
        let label = format!("sandbox-{}", short_type_name(type_name::<R>()));
        let (tx, rx) = sync_channel::<Command>(1);
        let (ready_tx, ready_rx) = sync_channel::<anyhow::Result<()>>(1);

        let worker_label = label.clone();
        let handle = thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                let root = match catch_unwind(AssertUnwindSafe(factory)) {
                    Ok(Ok(root)) => root,
                    Ok(Err(err)) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                    Err(payload) => {
                        let message = panic_message(&*payload);
                        let _ = ready_tx.send(Err(SandboxError::Panicked { message }.into()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                Worker::new(root, predicate, worker_label).run(&rx);
            })
            .map_err(SandboxError::Spawn)?;

        let ready = ready_rx.recv();
        match ready {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = handle.join();
                return Err(SandboxError::Factory(err));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(SandboxError::Closed);
            }
        }

        tracing::debug!(session = %label, "sandbox ready");
        let session = Arc::new(Session::new(tx, handle.thread().id(), label));
        Ok(Self {
            session,
            handle: Some(handle),
            _root: PhantomData,
        })
    }

    /// Name of the worker thread.
    #[must_use]
    pub fn label(&self) -> &str {
        self.session.label()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Read an attribute of the root.
    ///
    /// # Errors
    ///
    /// Returns the resource's own error unmodified, or a [`SandboxError`]
    /// when the session has ended.
    pub fn get(&self, member: &str) -> anyhow::Result<Returned> {
        let member = member.to_string();
        self.session.request(|reply| Command::Get {
            target: Target::Root,
            member,
            reply,
        })
    }

    /// Assign an attribute of the root.
    ///
    /// # Errors
    ///
    /// Same as [`Sandbox::get`].
    pub fn set(&self, member: &str, value: impl Into<Value>) -> anyhow::Result<()> {
        let member = member.to_string();
        let value = value.into();
        self.session
            .request(|reply| Command::Set {
                target: Target::Root,
                member,
                value,
                reply,
            })
            .map(drop)
    }

    /// Invoke a method on the root.
    ///
    /// # Errors
    ///
    /// Same as [`Sandbox::get`].
    pub fn call(&self, method: &str, args: Args) -> anyhow::Result<Returned> {
        let method = method.to_string();
        self.session.request(|reply| Command::Call {
            target: Target::Root,
            method,
            args,
            reply,
        })
    }

    /// # Errors
    ///
    /// Returns a [`SandboxError`] when the session has ended.
    pub fn describe(&self) -> anyhow::Result<String> {
        let returned = self.session.request(|reply| Command::Describe {
            target: Target::Root,
            reply,
        })?;
        match returned.into_value()? {
            Value::String(text) => Ok(text),
            other => Ok(format!("{other:?}")),
        }
    }

    /// Run a typed closure against the root on the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Closed`] when the session has ended, or
    /// [`SandboxError::Panicked`] when `f` panicked.
    pub fn exec<T, F>(&self, f: F) -> Result<T, SandboxError>
    where
        F: FnOnce(&mut R) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = sync_channel::<Result<T, SandboxError>>(1);
        let job: ExecFn = Box::new(move |root: &mut dyn Any| {
            let result = match root.downcast_mut::<R>() {
                Some(root) => catch_unwind(AssertUnwindSafe(|| f(root))).map_err(|payload| {
                    SandboxError::Panicked {
                        message: panic_message(&*payload),
                    }
                }),
                None => Err(SandboxError::RootType {
                    expected: type_name::<R>(),
                }),
            };
            let _ = reply_tx.send(result);
        });
        self.session.post(Command::Exec(job))?;
        reply_rx.recv().map_err(|_| SandboxError::Closed)?
    }

    /// End the session: the worker finalizes the root and exits, then this
    /// call joins it. Stopping twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Reentrant`] when called from the worker, or
    /// [`SandboxError::Panicked`] when the worker thread panicked.
    pub fn stop(&mut self) -> Result<(), SandboxError> {
        if self.session.on_worker() {
            return Err(SandboxError::Reentrant);
        }
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        // Already gone when the worker exited on its own.
        let _ = self.session.post(Command::Quit);
        handle.join().map_err(|payload| SandboxError::Panicked {
            message: panic_message(&*payload),
        })
    }
}

impl<R: Remote> Drop for Sandbox<R> {
    fn drop(&mut self) {
        if self.session.on_worker() || self.handle.is_none() {
            return;
        }
        if let Err(err) = self.stop() {
            tracing::warn!(session = %self.session.label(), error = %err, "sandbox teardown failed");
        }
    }
}

impl<R: Remote> fmt::Debug for Sandbox<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("label", &self.session.label())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
