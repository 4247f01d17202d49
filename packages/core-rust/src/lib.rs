//! Tandem Core: result values, cooperative cancellation, and retry wrappers.

pub mod cancel;
pub mod retry;
pub mod timing;
pub mod types;

pub use cancel::{check_cancelled, sleep, CancelToken, EndedByController, InFlightGuard};
pub use retry::{Backoff, Retry, UntilTimeout};
pub use timing::{timeout_iter, Stopwatch};
pub use types::{ResultMap, Value};
