use std::time::Duration;

use serde::Deserialize;

/// Configuration shared by the work pool variants.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Prefix for worker thread names; a per-pool counter is appended.
    pub name_prefix: String,

    /// How long an idle elastic-pool worker stays parked waiting for a
    /// hand-off before retiring itself.
    ///
    /// A tuning knob, not a correctness requirement: a shorter timeout
    /// trades thread churn for a smaller idle footprint.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            name_prefix: "taskmill-worker".into(),
            idle_timeout: Duration::from_secs(60),
        }
    }
}
