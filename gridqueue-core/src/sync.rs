//! The tracker synchronization loop: pulls newly-assigned requests, pushes
//! status and progress, and retires finished work.
//!
//! One [`TrackerSync::cycle`] runs the pull, report, and deletion phases
//! sequentially. Requests are processed one at a time with per-request error
//! isolation: a failure in one request is logged and never aborts the rest of
//! the cycle. There is no backoff here; the cycle interval itself throttles
//! retries.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gridqueue_model::{
    ProgressReport, RequestSpec, TrackerStatus, UnitStatus, WorkUnit,
};

use crate::config::SyncConfig;
use crate::error::{FailureClass, QueueError, Result};
use crate::location::DataLocation;
use crate::specs::{SpecSource, validate_spec_reference};
use crate::split::{BlockLedger, BlockSplitPolicy};
use crate::store::UnitStore;
use crate::tracker::{AssignedRequest, Tracker};

/// Per-request bookkeeping carried between cycles.
#[derive(Clone, Debug)]
struct RequestState {
    spec: RequestSpec,
    ledger: BlockLedger,
    /// Last tracker status we pushed, or the terminal status we observed the
    /// tracker reach on its own. Deletion is gated on this being terminal.
    last_status: Option<TrackerStatus>,
    last_progress: Option<(f32, f32)>,
}

/// Keeps local request/work-unit state consistent with the external tracker.
pub struct TrackerSync {
    tracker: Arc<dyn Tracker>,
    location: Arc<dyn DataLocation>,
    store: Arc<dyn UnitStore>,
    specs: Arc<dyn SpecSource>,
    policy: BlockSplitPolicy,
    config: SyncConfig,
    requests: HashMap<String, RequestState>,
}

impl std::fmt::Debug for TrackerSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerSync")
            .field("teams", &self.config.teams)
            .field("request_count", &self.requests.len())
            .finish()
    }
}

impl TrackerSync {
    pub fn new(
        tracker: Arc<dyn Tracker>,
        location: Arc<dyn DataLocation>,
        store: Arc<dyn UnitStore>,
        specs: Arc<dyn SpecSource>,
        config: SyncConfig,
    ) -> Self {
        Self {
            tracker,
            location,
            store,
            specs,
            policy: BlockSplitPolicy::new(),
            config,
            requests: HashMap::new(),
        }
    }

    /// Names of the requests currently tracked by this scheduler.
    pub fn tracked_requests(&self) -> Vec<String> {
        self.requests.keys().cloned().collect()
    }

    /// Runs one full synchronization cycle: pull, report, delete.
    pub async fn cycle(&mut self) {
        let cycle = Uuid::now_v7();
        debug!(%cycle, "synchronization cycle starting");
        self.pull().await;
        self.report().await;
        self.retire().await;
        debug!(%cycle, tracked = self.requests.len(), "synchronization cycle finished");
    }

    /// Pull phase: fetch newly-assigned requests per team and split them,
    /// then re-split known requests whose input datasets are still growing.
    pub async fn pull(&mut self) {
        for team in self.config.teams.clone() {
            let assigned = match self.tracker.assigned_requests(&team).await {
                Ok(assigned) => assigned,
                Err(err) => {
                    warn!(%team, error = %err, "failed to fetch assigned requests, will retry next cycle");
                    continue;
                }
            };
            for request in assigned {
                if self.requests.contains_key(&request.name) {
                    continue;
                }
                let name = request.name.clone();
                if let Err(err) = self.admit_request(request).await {
                    self.handle_pull_failure(&name, err).await;
                }
            }
        }

        // Continuous ingestion: already-split requests over open datasets may
        // have grown new blocks since the last pass.
        for name in self.tracked_requests() {
            if let Err(err) = self.resplit_if_grown(&name).await {
                warn!(request = %name, error = %err, "incremental splitting failed, will retry next cycle");
            }
        }
    }

    async fn admit_request(&mut self, request: AssignedRequest) -> Result<()> {
        validate_spec_reference(&request.name, &request.spec_reference)?;
        let mut spec = self.specs.load(&request.spec_reference).await?;
        if spec.name.is_empty() {
            spec.name = request.name.clone();
        }

        let outcome = self
            .policy
            .split(&spec, self.location.as_ref(), &BlockLedger::new())
            .await?;
        if outcome.units.is_empty() {
            return Err(QueueError::NoEligibleBlocks(request.name));
        }

        let admitted = self.admit_units(outcome.units).await?;
        self.tracker
            .mark_acquired(&request.name, &self.config.scheduler_addr)
            .await?;
        info!(
            request = %request.name,
            units = admitted,
            rejected = outcome.rejected.len(),
            "request queued"
        );

        self.requests.insert(
            request.name,
            RequestState {
                spec,
                ledger: outcome.ledger,
                last_status: None,
                last_progress: None,
            },
        );
        Ok(())
    }

    async fn resplit_if_grown(&mut self, name: &str) -> Result<()> {
        let Some(state) = self.requests.get(name) else {
            return Ok(());
        };
        if state.last_status.is_some_and(TrackerStatus::is_terminal) {
            return Ok(());
        }
        if !self
            .policy
            .has_new_work(&state.spec, self.location.as_ref())
            .await?
        {
            return Ok(());
        }

        let spec = state.spec.clone();
        let ledger = state.ledger.clone();
        let outcome = self.policy.split(&spec, self.location.as_ref(), &ledger).await?;
        let admitted = self.admit_units(outcome.units).await?;
        if admitted > 0 {
            info!(request = %name, units = admitted, "new blocks queued from open dataset");
        }
        if let Some(state) = self.requests.get_mut(name) {
            state.ledger = outcome.ledger;
        }
        Ok(())
    }

    /// Stores freshly-split units, skipping any identity already admitted so
    /// progress on existing units is never clobbered.
    async fn admit_units(&self, units: Vec<WorkUnit>) -> Result<usize> {
        let mut admitted = 0;
        for unit in units {
            let identity = unit.identity();
            if self.store.get(&identity).await?.is_some() {
                debug!(%identity, "duplicate work unit dropped");
                continue;
            }
            self.store.put(unit).await?;
            admitted += 1;
        }
        Ok(admitted)
    }

    async fn handle_pull_failure(&mut self, name: &str, err: QueueError) {
        match err.classify() {
            FailureClass::Permanent => {
                warn!(request = %name, error = %err, "request permanently failed");
                if let Err(push_err) = self.tracker.set_status(name, TrackerStatus::Failed).await {
                    warn!(request = %name, error = %push_err, "could not push failed status");
                }
                if let Err(push_err) = self.tracker.attach_message(name, &err.to_string()).await {
                    warn!(request = %name, error = %push_err, "could not attach failure message");
                }
            }
            FailureClass::Transient => {
                warn!(request = %name, error = %err, "transient failure, leaving request for next cycle");
                let text = format!("will retry: {err}");
                if let Err(push_err) = self.tracker.attach_message(name, &text).await {
                    warn!(request = %name, error = %push_err, "could not attach retry message");
                }
            }
            FailureClass::Unknown => {
                error!(request = %name, error = ?err, "unexpected failure processing request, treating as transient");
            }
        }
    }

    /// Report phase: reconcile each request's local aggregate with the
    /// tracker and push status/progress changes.
    pub async fn report(&mut self) {
        for name in self.tracked_requests() {
            if let Err(err) = self.report_request(&name).await {
                warn!(request = %name, error = %err, "reporting failed, will retry next cycle");
            }
        }
    }

    async fn report_request(&mut self, name: &str) -> Result<()> {
        let units = self.store.query(name).await?;
        if units.is_empty() {
            return Ok(());
        }

        let remote = self.tracker.request_status(name).await?;

        if remote.status == TrackerStatus::Aborted {
            // Abort is an authoritative override; no grace period.
            self.cancel_local_units(name, units).await?;
            self.record_status(name, TrackerStatus::Aborted);
            return Ok(());
        }

        let all_finished = units.iter().all(|unit| unit.status.is_end_state());
        if remote.status.is_terminal() {
            self.record_status(name, remote.status);
            if !all_finished {
                self.maybe_force_finish(name, units, remote.status).await?;
            }
            return Ok(());
        }

        let Some(aggregate) = aggregate_status(&units) else {
            return Ok(());
        };
        if let Some(mapped) = aggregate.tracker_status() {
            let last = self.requests.get(name).and_then(|state| state.last_status);
            if last != Some(mapped) {
                self.tracker.set_status(name, mapped).await?;
                info!(request = %name, status = %mapped, "status pushed");
                self.record_status(name, mapped);
            }
        }

        let progress = aggregate_progress(&units);
        let last = self
            .requests
            .get(name)
            .and_then(|state| state.last_progress);
        let delta = self.config.progress_delta;
        let moved = match last {
            Some((complete, success)) => {
                (progress.0 - complete).abs() > delta || (progress.1 - success).abs() > delta
            }
            None => progress != (0.0, 0.0),
        };
        if moved {
            self.tracker
                .set_progress(name, progress.0, progress.1)
                .await?;
            debug!(
                request = %name,
                percent_complete = progress.0,
                percent_success = progress.1,
                "progress pushed"
            );
            if let Some(state) = self.requests.get_mut(name) {
                state.last_progress = Some(progress);
            }
        }
        Ok(())
    }

    /// Tracker shows a terminal status but local units are still working.
    /// Tolerate transient desynchronization, then force-finish once every
    /// unit is at least running and nothing has been updated within the
    /// grace period.
    async fn maybe_force_finish(
        &mut self,
        name: &str,
        units: Vec<WorkUnit>,
        remote: TrackerStatus,
    ) -> Result<()> {
        let settled = units.iter().all(|unit| {
            unit.status.is_end_state() || unit.status.rank() >= UnitStatus::Running.rank()
        });
        let stalest = units.iter().map(|unit| unit.updated_at).min();
        let expired = stalest
            .is_some_and(|at| Utc::now().signed_duration_since(at) > self.config.grace_period());

        if !(settled && expired) {
            debug!(
                request = %name,
                %remote,
                settled,
                expired,
                "tracker is terminal but local work is unfinished, waiting out grace period"
            );
            return Ok(());
        }

        warn!(request = %name, %remote, "grace period expired, force-finishing local work");
        for mut unit in units {
            if unit.status.is_end_state() {
                continue;
            }
            unit.apply_progress(&ProgressReport::status_only(UnitStatus::Done));
            self.store.put(unit).await?;
        }
        Ok(())
    }

    async fn cancel_local_units(&mut self, name: &str, units: Vec<WorkUnit>) -> Result<()> {
        let mut canceled = 0;
        for mut unit in units {
            if unit.status.is_end_state() {
                continue;
            }
            unit.apply_progress(&ProgressReport::status_only(UnitStatus::Canceled));
            self.store.put(unit).await?;
            canceled += 1;
        }
        if canceled > 0 {
            info!(request = %name, canceled, "request aborted at the tracker, local work canceled");
        }
        Ok(())
    }

    fn record_status(&mut self, name: &str, status: TrackerStatus) {
        if let Some(state) = self.requests.get_mut(name) {
            state.last_status = Some(status);
        }
    }

    /// Deletion phase: retire requests that are terminal on both sides.
    ///
    /// Deletion is irreversible, so it is gated on the tracker having
    /// confirmed a terminal status and on every local unit being in an end
    /// state.
    pub async fn retire(&mut self) {
        for name in self.tracked_requests() {
            if let Err(err) = self.retire_request(&name).await {
                warn!(request = %name, error = %err, "deletion failed, will retry next cycle");
            }
        }
    }

    async fn retire_request(&mut self, name: &str) -> Result<()> {
        let tracker_terminal = self
            .requests
            .get(name)
            .and_then(|state| state.last_status)
            .is_some_and(TrackerStatus::is_terminal);
        if !tracker_terminal {
            return Ok(());
        }

        let units = self.store.query(name).await?;
        if !units.iter().all(|unit| unit.status.is_end_state()) {
            return Ok(());
        }

        self.store.delete(name).await?;
        self.requests.remove(name);
        info!(request = %name, units = units.len(), "request retired, local work deleted");
        Ok(())
    }
}

/// Order-independent aggregate over a request's units.
///
/// While any unit is still working the aggregate is the least-advanced
/// active state; once everything is finished a single failure makes the
/// request failed, a cancellation makes it canceled, and otherwise it is
/// done.
pub fn aggregate_status(units: &[WorkUnit]) -> Option<UnitStatus> {
    if units.is_empty() {
        return None;
    }
    let active = units
        .iter()
        .map(|unit| unit.status)
        .filter(|status| !status.is_end_state())
        .min_by_key(|status| status.rank());
    if let Some(status) = active {
        return Some(status);
    }
    if units.iter().any(|unit| unit.status == UnitStatus::Failed) {
        Some(UnitStatus::Failed)
    } else if units.iter().any(|unit| unit.status == UnitStatus::Canceled) {
        Some(UnitStatus::Canceled)
    } else {
        Some(UnitStatus::Done)
    }
}

/// Mean progress across a request's units.
pub fn aggregate_progress(units: &[WorkUnit]) -> (f32, f32) {
    if units.is_empty() {
        return (0.0, 0.0);
    }
    let count = units.len() as f32;
    let complete: f32 = units.iter().map(|unit| unit.percent_complete).sum();
    let success: f32 = units.iter().map(|unit| unit.percent_success).sum();
    (complete / count, success / count)
}
