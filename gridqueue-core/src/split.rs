//! Block-based split policy: turns a request's input dataset into one work
//! unit per eligible block.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use gridqueue_model::{RequestSpec, SliceType, WorkUnit};

use crate::error::{QueueError, Result};
use crate::location::{BlockSummary, DataLocation, NO_INITIAL_SITE};

/// Block names already turned into units or explicitly rejected in earlier
/// splitting passes for one request.
///
/// The ledger is passed in and returned updated rather than kept as hidden
/// policy state, so re-running the policy on an evolving open dataset never
/// re-emits a unit for a block already handled.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockLedger {
    seen: BTreeSet<String>,
}

impl BlockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, block: &str) -> bool {
        self.seen.contains(block)
    }

    pub fn insert(&mut self, block: impl Into<String>) {
        self.seen.insert(block.into());
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Why a candidate block did not become a work unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Listed in the request's block blacklist.
    Blacklisted,
    /// Not part of the resolved input dataset.
    UnknownBlock,
    /// Contains none of the lumis selected by the mask.
    NoMaskedLumis,
    /// Every run was filtered away by the run white/black lists.
    NoMatchingRuns,
    /// The catalog reports zero files.
    NoValidFiles,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RejectedBlock {
    pub name: String,
    pub reason: RejectReason,
}

/// Result of one splitting pass.
#[derive(Debug, Default)]
pub struct SplitOutcome {
    pub units: Vec<WorkUnit>,
    /// The input ledger extended with every block handled in this pass.
    pub ledger: BlockLedger,
    pub rejected: Vec<RejectedBlock>,
}

/// Effective counts for a block after mask or run filtering.
#[derive(Clone, Copy, Debug)]
struct BlockCounts {
    files: u64,
    events: u64,
    lumis: u64,
}

impl From<&BlockSummary> for BlockCounts {
    fn from(summary: &BlockSummary) -> Self {
        Self {
            files: summary.num_files,
            events: summary.num_events,
            lumis: summary.num_lumis,
        }
    }
}

impl BlockCounts {
    /// Ratio-scales counts to a retained fraction of lumis.
    ///
    /// The event count is a linear approximation, not an exact recount; the
    /// scheduler accepts the inexactness and accounting must not treat these
    /// numbers as ground truth.
    fn scaled_to_lumis(self, retained: u64, total: u64) -> Self {
        if total == 0 || retained >= total {
            return self;
        }
        let fraction = retained as f64 / total as f64;
        Self {
            files: ((self.files as f64 * fraction).ceil() as u64).max(1),
            events: (self.events as f64 * fraction).round() as u64,
            lumis: retained,
        }
    }
}

/// Splits requests block-by-block against the data-location service.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlockSplitPolicy;

impl BlockSplitPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Materializes work units for every eligible block of the request's
    /// input not yet present in `ledger`.
    pub async fn split(
        &self,
        spec: &RequestSpec,
        location: &dyn DataLocation,
        ledger: &BlockLedger,
    ) -> Result<SplitOutcome> {
        let dataset = spec
            .input_dataset
            .as_deref()
            .ok_or_else(|| QueueError::MissingInputDataset(spec.name.clone()))?;

        let summaries: BTreeMap<String, BlockSummary> = location
            .resolve_blocks(dataset)
            .await?
            .into_iter()
            .map(|summary| (summary.name.clone(), summary))
            .collect();

        let candidates: Vec<String> = if spec.block_whitelist.is_empty() {
            summaries
                .values()
                .filter(|summary| !summary.open)
                .map(|summary| summary.name.clone())
                .collect()
        } else {
            spec.block_whitelist.iter().cloned().collect()
        };

        let mut outcome = SplitOutcome {
            ledger: ledger.clone(),
            ..SplitOutcome::default()
        };
        let mut already_handled = 0usize;

        for block in candidates {
            if outcome.ledger.contains(&block) {
                already_handled += 1;
                continue;
            }
            if spec.block_blacklist.contains(&block) {
                outcome.reject(block, RejectReason::Blacklisted);
                continue;
            }
            let Some(summary) = summaries.get(&block) else {
                outcome.reject(block, RejectReason::UnknownBlock);
                continue;
            };
            if summary.num_files == 0 {
                // Distinct from filter rejections: the block exists but the
                // catalog has nothing usable in it.
                warn!(request = %spec.name, %block, "rejecting block with no valid files");
                outcome.reject(block, RejectReason::NoValidFiles);
                continue;
            }

            let counts = match self.effective_counts(spec, location, &block, summary).await? {
                Ok(counts) => counts,
                Err(reason) => {
                    outcome.reject(block, reason);
                    continue;
                }
            };

            let sites = self.resolve_sites(spec, location, &block).await?;
            let mut parent_data = BTreeMap::new();
            if spec.include_parents {
                for parent in location.block_parents(&block).await? {
                    let parent_sites = self.resolve_sites(spec, location, &parent).await?;
                    parent_data.insert(parent, parent_sites);
                }
            }

            let metric = match spec.slice_type {
                SliceType::Files => counts.files,
                SliceType::Events => counts.events,
            };
            let jobs = metric.div_ceil(spec.slice_size.max(1)).max(1);

            debug!(
                request = %spec.name,
                %block,
                jobs,
                files = counts.files,
                events = counts.events,
                lumis = counts.lumis,
                "emitting work unit"
            );

            let mut builder = WorkUnit::builder(&spec.name)
                .input(&block, sites)
                .parent_flag(spec.include_parents)
                .site_whitelist(spec.site_whitelist.clone())
                .site_blacklist(spec.site_blacklist.clone())
                .trust_site_lists(spec.trust_site_lists, spec.trust_pileup_site_lists)
                .mask(spec.mask.clone())
                .dbs_url(&spec.dbs_url)
                .jobs(jobs)
                .counts(counts.files, counts.events, counts.lumis)
                .open_for_new_data(summary.open)
                .priority(spec.priority);
            if let Some(task) = &spec.task {
                builder = builder.task_name(task);
            }
            if spec.trust_pileup_site_lists {
                for pileup in &spec.pileup_datasets {
                    builder = builder.pileup(pileup, spec.site_whitelist.clone());
                }
            }
            let mut unit = builder.build();
            unit.parent_data = parent_data;

            outcome.ledger.insert(block);
            outcome.units.push(unit);
        }

        info!(
            request = %spec.name,
            emitted = outcome.units.len(),
            rejected = outcome.rejected.len(),
            already_handled,
            "splitting pass finished"
        );
        Ok(outcome)
    }

    /// Whether the request's input dataset still has open blocks, i.e. a
    /// later splitting pass may find more work.
    pub async fn has_new_work(
        &self,
        spec: &RequestSpec,
        location: &dyn DataLocation,
    ) -> Result<bool> {
        let dataset = spec
            .input_dataset
            .as_deref()
            .ok_or_else(|| QueueError::MissingInputDataset(spec.name.clone()))?;
        Ok(!location.open_blocks(dataset).await?.is_empty())
    }

    /// Applies mask or run filtering to the block's raw counts.
    ///
    /// The inner `Err` carries a per-block rejection, which is not a failure
    /// of the splitting pass.
    async fn effective_counts(
        &self,
        spec: &RequestSpec,
        location: &dyn DataLocation,
        block: &str,
        summary: &BlockSummary,
    ) -> Result<std::result::Result<BlockCounts, RejectReason>> {
        let counts = BlockCounts::from(summary);

        if let Some(mask) = &spec.mask {
            let runs = location.block_runs(block).await?;
            let retained: u64 = runs
                .iter()
                .filter(|(run, _)| mask.contains_run(**run))
                .map(|(run, lumis)| mask.lumis_for_run(*run).min(*lumis))
                .sum();
            if retained == 0 {
                return Ok(Err(RejectReason::NoMaskedLumis));
            }
            let total: u64 = runs.values().sum();
            return Ok(Ok(counts.scaled_to_lumis(retained, total.max(summary.num_lumis))));
        }

        if spec.has_run_filter() {
            let runs = location.block_runs(block).await?;
            let all_runs: BTreeSet<u32> = runs.keys().copied().collect();
            let kept = spec.filter_runs(all_runs.iter().copied());
            if kept.is_empty() {
                return Ok(Err(RejectReason::NoMatchingRuns));
            }
            if kept != all_runs {
                // Only the filtered path pays for a recount.
                let retained: u64 = runs
                    .iter()
                    .filter(|(run, _)| kept.contains(run))
                    .map(|(_, lumis)| *lumis)
                    .sum();
                let total: u64 = runs.values().sum();
                return Ok(Ok(counts.scaled_to_lumis(retained, total)));
            }
        }

        Ok(Ok(counts))
    }

    async fn resolve_sites(
        &self,
        spec: &RequestSpec,
        location: &dyn DataLocation,
        block: &str,
    ) -> Result<BTreeSet<String>> {
        if spec.trust_site_lists {
            return Ok(spec.site_whitelist.clone());
        }
        let sites: BTreeSet<String> = location.block_sites(block).await?.into_iter().collect();
        if sites.is_empty() {
            debug!(%block, "no location resolved, assigning placeholder site");
            return Ok(BTreeSet::from([NO_INITIAL_SITE.to_string()]));
        }
        Ok(sites)
    }
}

impl SplitOutcome {
    fn reject(&mut self, name: String, reason: RejectReason) {
        self.ledger.insert(name.clone());
        self.rejected.push(RejectedBlock { name, reason });
    }
}
