use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Knobs for the tracker synchronization loop.
///
/// All fields carry defaults so deployments only override what they need.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Teams this scheduler pulls assigned requests for.
    pub teams: Vec<String>,
    /// Address recorded at the tracker when a request is acquired, so the
    /// tracker knows where ownership lives.
    pub scheduler_addr: String,
    /// How long to tolerate a terminal tracker status disagreeing with
    /// unfinished local state before force-finishing it.
    pub grace_period_secs: i64,
    /// Minimum percentage-point movement before a progress update is pushed.
    pub progress_delta: f32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            teams: Vec::new(),
            scheduler_addr: "http://localhost:9996".to_string(),
            grace_period_secs: 2 * 3600,
            progress_delta: 1.0,
        }
    }
}

impl SyncConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::seconds(self.grace_period_secs.max(0))
    }
}
