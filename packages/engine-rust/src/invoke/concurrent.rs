//! Thread-per-operation runner.
//!
//! Each operation runs on its own named OS thread and reports back over a
//! completion channel. The controller polls that channel with a bounded
//! timeout so it stays responsive, emits a liveness report while operations
//! are outstanding, and cancels siblings on the first unexpected error.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tandem_core::{CancelToken, EndedByController, InFlightGuard, ResultMap, Value};
use tracing::info_span;

use super::config::{GroupParams, RunnerConfig};
use super::operation::{Call, GroupError, OperationFailure};
use super::runner::Runner;

type Completion = (usize, anyhow::Result<Value>);

/// One spawned operation awaiting its completion message.
struct Pending {
    name: String,
    handle: JoinHandle<()>,
    // Dropped only after the completion is recorded, so a cancellation raised
    // by this operation is set before the in-flight count can reach zero.
    guard: InFlightGuard,
}

/// Runs every operation of a group at the same time.
#[derive(Debug, Clone, Default)]
pub struct Concurrent {
    config: RunnerConfig,
}

impl Concurrent {
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn spawn(
        index: usize,
        call: Call,
        token: &CancelToken,
        tx: mpsc::Sender<Completion>,
    ) -> std::io::Result<JoinHandle<()>> {
        let thread_name = call.name().replace('\0', "");
        let token = token.clone();
        thread::Builder::new().name(thread_name).spawn(move || {
            let result = call.invoke(&token);
            // The controller only hangs up after every operation reported.
            let _ = tx.send((index, result));
        })
    }
}

/// Accumulates outcomes as completions arrive.
struct Outcome<'a> {
    params: &'a GroupParams,
    token: &'a CancelToken,
    results: ResultMap,
    failures: Vec<OperationFailure>,
}

impl Outcome<'_> {
    fn record(&mut self, name: String, result: anyhow::Result<Value>) {
        match result {
            Ok(value) => {
                if self.params.nones || !value.is_null() {
                    self.results.insert(name, value);
                }
            }
            Err(err) if EndedByController::is(&err) => {
                tracing::debug!(operation = %name, "operation ended by controller");
            }
            Err(err) => self.fail(name, err),
        }
    }

    fn fail(&mut self, name: String, error: anyhow::Error) {
        if !self.params.traceback_delay {
            tracing::error!(operation = %name, error = %format!("{error:#}"), "operation failed");
        }
        if !self.params.catch {
            self.token.cancel();
        }
        self.failures.push(OperationFailure { name, error });
    }
}

impl Runner for Concurrent {
    fn run(
        &self,
        params: &GroupParams,
        calls: Vec<Call>,
        token: &CancelToken,
    ) -> Result<ResultMap, GroupError> {
        // A nested group shares its parent's in-flight operations and must
        // not discard a cancellation meant for them.
        if token.in_flight_count() == 0 {
            token.clear();
        }

        let span = info_span!(
            "group",
            name = %params.name,
            runner = "concurrent",
            operations = calls.len(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let _entered = span.enter();
        let start = Instant::now();

        let mut outcome = Outcome {
            params,
            token,
            results: ResultMap::new(),
            failures: Vec::new(),
        };

        let (tx, rx) = mpsc::channel::<Completion>();
        let mut pending: BTreeMap<usize, Pending> = BTreeMap::new();

        for (index, call) in calls.into_iter().enumerate() {
            let name = call.name().to_string();
            let guard = token.in_flight_guard();
            match Self::spawn(index, call, token, tx.clone()) {
                Ok(handle) => {
                    pending.insert(
                        index,
                        Pending {
                            name,
                            handle,
                            guard,
                        },
                    );
                }
                Err(err) => {
                    let error =
                        anyhow::Error::new(err).context(format!("failed to spawn thread for {name:?}"));
                    outcome.fail(name, error);
                    drop(guard);
                }
            }
        }
        drop(tx);

        let mut last_report = Instant::now();
        while !pending.is_empty() {
            match rx.recv_timeout(self.config.poll_interval) {
                Ok((index, result)) => {
                    let Some(done) = pending.remove(&index) else {
                        continue;
                    };
                    outcome.record(done.name, result);
                    drop(done.guard);
                    if done.handle.join().is_err() {
                        tracing::warn!("operation thread panicked after reporting");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if last_report.elapsed() >= self.config.liveness_interval {
                        let outstanding: Vec<&str> =
                            pending.values().map(|p| p.name.as_str()).collect();
                        tracing::debug!(
                            ?outstanding,
                            elapsed_s = start.elapsed().as_secs(),
                            "operations still running"
                        );
                        last_report = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    for (_, lost) in std::mem::take(&mut pending) {
                        let error = anyhow::anyhow!("operation thread exited without reporting");
                        outcome.fail(lost.name, error);
                        drop(lost.guard);
                        let _ = lost.handle.join();
                    }
                }
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        span.record("duration_ms", start.elapsed().as_millis() as u64);

        let Outcome {
            results, failures, ..
        } = outcome;

        if params.traceback_delay && (params.catch || failures.len() > 1) {
            for failure in &failures {
                tracing::error!(
                    operation = %failure.name,
                    error = %format!("{:#}", failure.error),
                    "operation failed"
                );
            }
        }

        if params.catch {
            span.record("outcome", if failures.is_empty() { "ok" } else { "caught" });
            return Ok(results);
        }
        match GroupError::from_failures(&params.name, failures) {
            Some(err) => {
                span.record("outcome", "error");
                Err(err)
            }
            None => {
                span.record("outcome", "ok");
                Ok(results)
            }
        }
    }

    fn is_concurrent(&self) -> bool {
        true
    }

    fn label(&self) -> &'static str {
        "concurrent"
    }
}
