use std::time::Duration;

/// Per-group parameters, fixed once execution starts.
#[derive(Debug, Clone)]
pub struct GroupParams {
    /// Collect errors instead of raising them; only successes are returned.
    pub catch: bool,
    /// Keep `Null` results in the output map.
    pub nones: bool,
    /// Merge map-shaped results into the parent map.
    pub flatten: bool,
    /// Hold per-operation error reports until the whole group finishes.
    pub traceback_delay: bool,
    /// Diagnostic label for logs and aggregate errors.
    pub name: String,
}

impl GroupParams {
    /// Generates a unique diagnostic label for an unnamed group.
    #[must_use]
    pub fn generated_name() -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("group-{}", &id[..8])
    }
}

impl Default for GroupParams {
    fn default() -> Self {
        Self {
            catch: false,
            nones: false,
            flatten: true,
            traceback_delay: true,
            name: Self::generated_name(),
        }
    }
}

/// Timing knobs shared by the runners and the scope aggregator.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Bounded poll timeout on the completion channel.
    pub poll_interval: Duration,
    /// How long operations may stay outstanding between liveness reports.
    pub liveness_interval: Duration,
    /// Scope entry or exit slower than this is logged.
    pub slow_scope_threshold: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            liveness_interval: Duration::from_secs(15 * 60),
            slow_scope_threshold: Duration::from_millis(500),
        }
    }
}
