//! The worker loop that owns a protected object graph.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::Receiver;

use tandem_core::Value;

use super::protocol::{Command, ObjectId, Reply, ReplyTx, Target};
use super::remote::{Member, Predicate, Remote};
use super::SandboxError;
use crate::invoke::panic_message;

/// Owns the root object and every object proxied out of it.
pub(crate) struct Worker<R: Remote> {
    root: R,
    arena: HashMap<ObjectId, Box<dyn Remote>>,
    next_id: u64,
    predicate: Predicate,
    label: String,
}

impl<R: Remote> Worker<R> {
    pub(crate) fn new(root: R, predicate: Predicate, label: String) -> Self {
        Self {
            root,
            arena: HashMap::new(),
            next_id: 0,
            predicate,
            label,
        }
    }

    /// Serve requests one at a time until `Quit` or every sender is gone,
    /// then finalize the root on this thread.
    pub(crate) fn run(mut self, requests: &Receiver<Command>) {
        tracing::debug!(session = %self.label, "sandbox worker started");
        while let Ok(command) = requests.recv() {
            if matches!(command, Command::Quit) {
                break;
            }
            self.handle(command);
        }
        self.shutdown();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Get {
                target,
                member,
                reply,
            } => self.answer(&reply, |this| {
                let found = this.target(target)?.get(&member)?;
                Ok(this.wrap(found))
            }),
            Command::Set {
                target,
                member,
                value,
                reply,
            } => self.answer(&reply, |this| {
                this.target(target)?.set(&member, value)?;
                Ok(Reply::Value(Value::Null))
            }),
            Command::Call {
                target,
                method,
                args,
                reply,
            } => self.answer(&reply, |this| {
                let returned = this.target(target)?.call(&method, args)?;
                Ok(this.wrap(returned))
            }),
            Command::Describe { target, reply } => self.answer(&reply, |this| {
                Ok(Reply::Value(Value::String(this.target(target)?.describe())))
            }),
            Command::Release(id) => {
                if let Some(object) = self.arena.remove(&id) {
                    tracing::trace!(session = %self.label, ?id, "released {}", object.type_name());
                }
            }
            Command::Exec(f) => {
                // The closure replies on its own channel, including on panic.
                f(&mut self.root);
            }
            Command::Quit => {}
        }
    }

    fn answer<F>(&mut self, reply: &ReplyTx, f: F)
    where
        F: FnOnce(&mut Self) -> anyhow::Result<Reply>,
    {
        let result = match catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(result) => result,
            Err(payload) => Err(SandboxError::Panicked {
                message: panic_message(&*payload),
            }
            .into()),
        };
        // A caller that stopped waiting is not an error here.
        let _ = reply.send(result);
    }

    fn target(&mut self, target: Target) -> anyhow::Result<&mut dyn Remote> {
        match target {
            Target::Root => Ok(&mut self.root as &mut dyn Remote),
            Target::Object(id) => match self.arena.get_mut(&id) {
                Some(object) => Ok(object.as_mut()),
                None => Err(SandboxError::NoSuchObject { id: id.0 }.into()),
            },
        }
    }

    /// Keep protected objects on this thread and copy everything else out.
    fn wrap(&mut self, member: Member) -> Reply {
        match member {
            Member::Value(value) => Reply::Value(value),
            Member::Object(object) => {
                if !(self.predicate)(object.as_ref()) {
                    if let Some(value) = object.as_value() {
                        return Reply::Value(value);
                    }
                }
                let id = ObjectId(self.next_id);
                self.next_id += 1;
                let type_name = object.type_name();
                self.arena.insert(id, object);
                Reply::Object { id, type_name }
            }
        }
    }

    fn shutdown(mut self) {
        let live = self.arena.len();
        for (_, mut object) in self.arena.drain() {
            if let Err(err) = object.finalize() {
                tracing::warn!(
                    session = %self.label,
                    error = %format!("{err:#}"),
                    "finalize of proxied object failed"
                );
            }
        }
        match catch_unwind(AssertUnwindSafe(|| self.root.finalize())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(
                    session = %self.label,
                    error = %format!("{err:#}"),
                    "finalize failed"
                );
            }
            Err(payload) => {
                tracing::warn!(
                    session = %self.label,
                    panic = %panic_message(&*payload),
                    "finalize panicked"
                );
            }
        }
        tracing::debug!(session = %self.label, live_proxies = live, "sandbox worker stopped");
    }
}
