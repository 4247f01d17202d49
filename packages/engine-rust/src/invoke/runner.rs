//! The runner seam and the sequential runner.

use std::time::Instant;

use tandem_core::{CancelToken, ResultMap};
use tracing::info_span;

use super::config::GroupParams;
use super::operation::{Call, GroupError};

/// Executes a classified group of callable operations.
///
/// Implementations return the unmerged result map: one entry per operation
/// that produced a non-`Null` value (or every successful operation when
/// `params.nones` is set).
pub trait Runner: Send + Sync {
    /// Run every operation of the group.
    ///
    /// # Errors
    ///
    /// Returns [`GroupError::Failed`] with the original error when exactly one
    /// operation failed, or [`GroupError::Aggregate`] when several did.
    fn run(
        &self,
        params: &GroupParams,
        calls: Vec<Call>,
        token: &CancelToken,
    ) -> Result<ResultMap, GroupError>;

    /// Whether sibling operations run at the same time.
    fn is_concurrent(&self) -> bool;

    /// Short label for logs.
    fn label(&self) -> &'static str;
}

/// Runs operations one at a time on the calling thread, in input order.
///
/// The first error aborts the group and passes through unmodified; later
/// operations never run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl Runner for Sequential {
    fn run(
        &self,
        params: &GroupParams,
        calls: Vec<Call>,
        token: &CancelToken,
    ) -> Result<ResultMap, GroupError> {
        let span = info_span!(
            "group",
            name = %params.name,
            runner = "sequential",
            operations = calls.len(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let _entered = span.enter();
        let start = Instant::now();

        let mut results = ResultMap::new();
        for call in calls {
            match call.invoke(token) {
                Ok(value) => {
                    if params.nones || !value.is_null() {
                        results.insert(call.name().to_string(), value);
                    }
                }
                Err(err) => {
                    tracing::debug!(operation = call.name(), "sequential group aborted");
                    span.record("outcome", "error");
                    return Err(GroupError::Failed(err));
                }
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        span.record("outcome", "ok");
        Ok(results)
    }

    fn is_concurrent(&self) -> bool {
        false
    }

    fn label(&self) -> &'static str {
        "sequential"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use tandem_core::Value;

    use super::*;

    #[test]
    fn runs_in_input_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let calls: Vec<Call> = (0..5)
            .map(|i| {
                let order = Arc::clone(&order);
                Call::new(format!("op{i}"), move |_: &CancelToken| {
                    order.lock().push(i);
                    Ok(i)
                })
            })
            .collect();
        let results = Sequential
            .run(&GroupParams::default(), calls, &CancelToken::new())
            .unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(results.len(), 5);
        assert_eq!(results["op3"], Value::Int(3));
    }

    #[test]
    fn first_error_stops_the_group() {
        let later = Arc::new(AtomicU32::new(0));
        let later_count = Arc::clone(&later);
        let calls = vec![
            Call::new("ok", |_: &CancelToken| Ok(1)),
            Call::new("bad", |_: &CancelToken| -> anyhow::Result<()> {
                Err(std::io::Error::other("bus fault").into())
            }),
            Call::new("never", move |_: &CancelToken| {
                later_count.fetch_add(1, Ordering::SeqCst);
                Ok(3)
            }),
        ];
        let err = Sequential
            .run(&GroupParams::default(), calls, &CancelToken::new())
            .unwrap_err();
        assert_eq!(later.load(Ordering::SeqCst), 0);
        let inner = err.as_failure().unwrap();
        assert!(inner.downcast_ref::<std::io::Error>().is_some());
    }

    #[test]
    fn nones_are_dropped_unless_requested() {
        let calls = || {
            vec![
                Call::new("silent", |_: &CancelToken| Ok(())),
                Call::new("loud", |_: &CancelToken| Ok("hi")),
            ]
        };
        let token = CancelToken::new();
        let results = Sequential
            .run(&GroupParams::default(), calls(), &token)
            .unwrap();
        assert_eq!(results.len(), 1);

        let params = GroupParams {
            nones: true,
            ..GroupParams::default()
        };
        let results = Sequential.run(&params, calls(), &token).unwrap();
        assert_eq!(results["silent"], Value::Null);
    }
}
