use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::mask::Mask;

/// Metric a block is sliced by when estimating job counts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceType {
    #[default]
    Files,
    Events,
}

/// Scheduler-side view of one tracker request: the input selection, the
/// filtering knobs, and the site policy the split policy honors.
///
/// All list fields default to empty and an empty white-list means
/// "unrestricted" for block and run filtering; the site whitelist by contrast
/// is the set of sites the request may run at and is consulted as-is.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestSpec {
    pub name: String,
    #[serde(default)]
    pub task: Option<String>,
    /// Primary input dataset. Absence is a request-level validation failure
    /// raised before any block resolution.
    #[serde(default)]
    pub input_dataset: Option<String>,
    /// Data-catalog instance the inputs resolve against.
    #[serde(default)]
    pub dbs_url: String,
    #[serde(default)]
    pub block_whitelist: BTreeSet<String>,
    #[serde(default)]
    pub block_blacklist: BTreeSet<String>,
    #[serde(default)]
    pub run_whitelist: BTreeSet<u32>,
    #[serde(default)]
    pub run_blacklist: BTreeSet<u32>,
    #[serde(default)]
    pub mask: Option<Mask>,
    #[serde(default)]
    pub site_whitelist: BTreeSet<String>,
    #[serde(default)]
    pub site_blacklist: BTreeSet<String>,
    /// Grid "trust site lists" mode: use the stated site list directly
    /// instead of recomputing eligibility from data location.
    #[serde(default)]
    pub trust_site_lists: bool,
    #[serde(default)]
    pub trust_pileup_site_lists: bool,
    /// Secondary datasets whose data must co-locate with processing.
    #[serde(default)]
    pub pileup_datasets: BTreeSet<String>,
    /// Whether parent blocks must be resolved alongside each input block.
    #[serde(default)]
    pub include_parents: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub slice_type: SliceType,
    #[serde(default = "default_slice_size")]
    pub slice_size: u64,
}

fn default_slice_size() -> u64 {
    1
}

impl RequestSpec {
    pub fn new(name: impl Into<String>, input_dataset: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_dataset: Some(input_dataset.into()),
            slice_size: default_slice_size(),
            ..Self::default()
        }
    }

    /// Whether run filtering is active at all.
    pub fn has_run_filter(&self) -> bool {
        !self.run_whitelist.is_empty() || !self.run_blacklist.is_empty()
    }

    /// Applies the run white/black lists to a set of runs.
    pub fn filter_runs(&self, runs: impl IntoIterator<Item = u32>) -> BTreeSet<u32> {
        runs.into_iter()
            .filter(|run| self.run_whitelist.is_empty() || self.run_whitelist.contains(run))
            .filter(|run| !self.run_blacklist.contains(run))
            .collect()
    }
}
