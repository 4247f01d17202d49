//! Request/reply messages between callers and a sandbox worker.
//!
//! Requests travel over one bounded channel of capacity 1 per session. Each
//! request that expects an answer carries its own single-slot reply channel.

use std::any::Any;
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tandem_core::Value;

use super::proxy::{Proxy, Returned};
use super::remote::Args;
use super::SandboxError;

/// Arena slot of an object held on the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) u64);

/// Which object a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Root,
    Object(ObjectId),
}

/// What the worker sends back for a successful request.
#[derive(Debug)]
pub(crate) enum Reply {
    Value(Value),
    Object {
        id: ObjectId,
        type_name: &'static str,
    },
}

pub(crate) type ReplyTx = SyncSender<anyhow::Result<Reply>>;

/// Typed closure run against the root object.
pub(crate) type ExecFn = Box<dyn FnOnce(&mut dyn Any) + Send>;

pub(crate) enum Command {
    Get {
        target: Target,
        member: String,
        reply: ReplyTx,
    },
    Set {
        target: Target,
        member: String,
        value: Value,
        reply: ReplyTx,
    },
    Call {
        target: Target,
        method: String,
        args: Args,
        reply: ReplyTx,
    },
    Describe {
        target: Target,
        reply: ReplyTx,
    },
    /// A proxy was dropped; free its arena slot.
    Release(ObjectId),
    Exec(ExecFn),
    Quit,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Caller-side end of one sandbox session, shared by the sandbox and every
/// proxy it handed out.
#[derive(Debug)]
pub(crate) struct Session {
    tx: SyncSender<Command>,
    worker: ThreadId,
    label: String,
}

impl Session {
    pub(crate) fn new(tx: SyncSender<Command>, worker: ThreadId, label: String) -> Self {
        Self { tx, worker, label }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn on_worker(&self) -> bool {
        thread::current().id() == self.worker
    }

    /// Send a command without waiting for a reply.
    pub(crate) fn post(&self, command: Command) -> Result<(), SandboxError> {
        if self.on_worker() {
            return Err(SandboxError::Reentrant);
        }
        self.tx.send(command).map_err(|_| SandboxError::Closed)
    }

    /// Send a command and block until the worker replies.
    pub(crate) fn request(
        self: &Arc<Self>,
        build: impl FnOnce(ReplyTx) -> Command,
    ) -> anyhow::Result<Returned> {
        let (reply_tx, reply_rx) = sync_channel(1);
        self.post(build(reply_tx))?;
        let reply = reply_rx.recv().map_err(|_| SandboxError::Closed)??;
        Ok(self.resolve(reply))
    }

    fn resolve(self: &Arc<Self>, reply: Reply) -> Returned {
        match reply {
            Reply::Value(value) => Returned::Value(value),
            Reply::Object { id, type_name } => {
                Returned::Proxy(Proxy::new(Arc::clone(self), id, type_name))
            }
        }
    }

    /// Free an arena slot. Never blocks on the worker's own thread.
    pub(crate) fn release(&self, id: ObjectId) {
        if self.on_worker() {
            match self.tx.try_send(Command::Release(id)) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(session = %self.label, ?id, "release skipped; request slot busy");
                }
            }
        } else {
            let _ = self.tx.send(Command::Release(id));
        }
    }
}
