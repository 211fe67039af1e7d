use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings under `modules.<module id>` in the host config.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerConfig {
    /// How often due tasks are checked, e.g. `"1s"`.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Run records kept for inspection; older ones are dropped.
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            history_limit: 256,
        }
    }
}
