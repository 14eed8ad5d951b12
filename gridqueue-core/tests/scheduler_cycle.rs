//! End-to-end cycles of the tracker synchronization loop against in-process
//! collaborator stubs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use gridqueue_core::{
    AssignedRequest, BlockSummary, DataLocation, MemoryUnitStore, QueueError, Result as QueueResult,
    SpecSource, SyncConfig, Tracker, TrackerReport, TrackerSync, UnitStore, NO_INITIAL_SITE,
};
use gridqueue_model::{ProgressReport, RequestSpec, SliceType, TrackerStatus, UnitStatus};

const DATASET: &str = "/Prim/Proc/RAW";
const SPEC_REF: &str = "https://specs.example.org/req-1.json";

#[derive(Default)]
struct LocationInner {
    blocks: Vec<BlockSummary>,
    sites: HashMap<String, Vec<String>>,
    open: Vec<String>,
    fail: bool,
}

#[derive(Default)]
struct StubLocation {
    inner: Mutex<LocationInner>,
}

impl StubLocation {
    fn add_block(&self, name: &str, files: u64, sites: &[&str]) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.push(BlockSummary {
            name: name.to_string(),
            num_files: files,
            num_events: files * 100,
            num_lumis: files,
            open: false,
        });
        inner
            .sites
            .insert(name.to_string(), sites.iter().map(|s| s.to_string()).collect());
    }

    fn set_open(&self, blocks: &[&str]) {
        self.inner.lock().unwrap().open = blocks.iter().map(|s| s.to_string()).collect();
    }

    fn set_failing(&self, fail: bool) {
        self.inner.lock().unwrap().fail = fail;
    }
}

#[async_trait]
impl DataLocation for StubLocation {
    async fn resolve_blocks(&self, _dataset: &str) -> QueueResult<Vec<BlockSummary>> {
        let inner = self.inner.lock().unwrap();
        if inner.fail {
            return Err(QueueError::Location("stub outage".into()));
        }
        Ok(inner.blocks.clone())
    }

    async fn block_sites(&self, block: &str) -> QueueResult<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sites
            .get(block)
            .cloned()
            .unwrap_or_default())
    }

    async fn block_runs(&self, _block: &str) -> QueueResult<BTreeMap<u32, u64>> {
        Ok(BTreeMap::new())
    }

    async fn block_parents(&self, _block: &str) -> QueueResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn open_blocks(&self, _dataset: &str) -> QueueResult<Vec<String>> {
        Ok(self.inner.lock().unwrap().open.clone())
    }
}

#[derive(Default)]
struct TrackerInner {
    assigned: Vec<AssignedRequest>,
    statuses: HashMap<String, TrackerStatus>,
    pushed_statuses: Vec<(String, TrackerStatus)>,
    pushed_progress: Vec<(String, f32, f32)>,
    messages: Vec<(String, String)>,
    acquired: Vec<(String, String)>,
}

#[derive(Default)]
struct StubTracker {
    inner: Mutex<TrackerInner>,
}

impl StubTracker {
    fn assign(&self, name: &str, reference: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.assigned.push(AssignedRequest {
            name: name.to_string(),
            spec_reference: reference.to_string(),
        });
        inner.statuses.insert(name.to_string(), TrackerStatus::Acquired);
    }

    fn set_remote_status(&self, name: &str, status: TrackerStatus) {
        self.inner
            .lock()
            .unwrap()
            .statuses
            .insert(name.to_string(), status);
    }

    fn pushed_statuses(&self) -> Vec<(String, TrackerStatus)> {
        self.inner.lock().unwrap().pushed_statuses.clone()
    }

    fn messages(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().messages.clone()
    }

    fn acquired(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().acquired.clone()
    }

    fn pushed_progress(&self) -> Vec<(String, f32, f32)> {
        self.inner.lock().unwrap().pushed_progress.clone()
    }
}

#[async_trait]
impl Tracker for StubTracker {
    async fn assigned_requests(&self, _team: &str) -> QueueResult<Vec<AssignedRequest>> {
        Ok(self.inner.lock().unwrap().assigned.clone())
    }

    async fn request_status(&self, name: &str) -> QueueResult<TrackerReport> {
        let inner = self.inner.lock().unwrap();
        let status = inner
            .statuses
            .get(name)
            .copied()
            .ok_or_else(|| QueueError::Internal(format!("unknown request {name}")))?;
        Ok(TrackerReport {
            status,
            percent_complete: 0.0,
            percent_success: 0.0,
        })
    }

    async fn set_status(&self, name: &str, status: TrackerStatus) -> QueueResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.statuses.insert(name.to_string(), status);
        inner.pushed_statuses.push((name.to_string(), status));
        Ok(())
    }

    async fn set_progress(
        &self,
        name: &str,
        percent_complete: f32,
        percent_success: f32,
    ) -> QueueResult<()> {
        self.inner.lock().unwrap().pushed_progress.push((
            name.to_string(),
            percent_complete,
            percent_success,
        ));
        Ok(())
    }

    async fn attach_message(&self, name: &str, text: &str) -> QueueResult<()> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .push((name.to_string(), text.to_string()));
        Ok(())
    }

    async fn mark_acquired(&self, name: &str, scheduler_addr: &str) -> QueueResult<()> {
        self.inner
            .lock()
            .unwrap()
            .acquired
            .push((name.to_string(), scheduler_addr.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct MapSpecSource {
    specs: Mutex<HashMap<String, RequestSpec>>,
}

impl MapSpecSource {
    fn insert(&self, reference: &str, spec: RequestSpec) {
        self.specs
            .lock()
            .unwrap()
            .insert(reference.to_string(), spec);
    }
}

#[async_trait]
impl SpecSource for MapSpecSource {
    async fn load(&self, reference: &str) -> QueueResult<RequestSpec> {
        self.specs
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| QueueError::Internal(format!("no spec at {reference}")))
    }
}

struct Harness {
    tracker: Arc<StubTracker>,
    location: Arc<StubLocation>,
    store: Arc<MemoryUnitStore>,
    specs: Arc<MapSpecSource>,
}

impl Harness {
    fn new() -> Self {
        Self {
            tracker: Arc::new(StubTracker::default()),
            location: Arc::new(StubLocation::default()),
            store: Arc::new(MemoryUnitStore::new()),
            specs: Arc::new(MapSpecSource::default()),
        }
    }

    fn sync(&self, config: SyncConfig) -> TrackerSync {
        TrackerSync::new(
            self.tracker.clone(),
            self.location.clone(),
            self.store.clone(),
            self.specs.clone(),
            config,
        )
    }

    fn config(grace_secs: i64) -> SyncConfig {
        SyncConfig {
            teams: vec!["production".to_string()],
            scheduler_addr: "https://queue.example.org".to_string(),
            grace_period_secs: grace_secs,
            progress_delta: 1.0,
        }
    }

    fn file_spec(name: &str, slice_size: u64) -> RequestSpec {
        let mut spec = RequestSpec::new(name, DATASET);
        spec.dbs_url = "https://dbs.example.org/global".to_string();
        spec.slice_type = SliceType::Files;
        spec.slice_size = slice_size;
        spec.site_whitelist = BTreeSet::from([
            "T1_US_FNAL".to_string(),
            "T2_CH_CERN".to_string(),
        ]);
        spec
    }

    async fn mark_all_units(&self, request: &str, status: UnitStatus) {
        for mut unit in self.store.query(request).await.unwrap() {
            unit.apply_progress(&ProgressReport::status_only(status));
            // Age the unit so grace-period checks see it as stale.
            unit.updated_at = Utc::now() - Duration::hours(1);
            self.store.put(unit).await.unwrap();
        }
    }
}

#[tokio::test]
async fn two_block_dataset_splits_into_two_units() -> anyhow::Result<()> {
    let harness = Harness::new();
    harness
        .location
        .add_block(&format!("{DATASET}#b1"), 10, &["T1_US_FNAL", "T2_CH_CERN"]);
    harness.location.add_block(&format!("{DATASET}#b2"), 5, &[]);
    harness.tracker.assign("req-1", SPEC_REF);
    harness
        .specs
        .insert(SPEC_REF, Harness::file_spec("req-1", 10));

    let mut sync = harness.sync(Harness::config(7200));
    sync.cycle().await;

    let units = harness.store.query("req-1").await?;
    assert_eq!(units.len(), 2);

    let b1 = units
        .iter()
        .find(|unit| unit.inputs.contains_key(&format!("{DATASET}#b1")))
        .expect("unit for b1");
    assert_eq!(b1.jobs, 1);
    assert_eq!(b1.eligible_sites().len(), 2);
    assert_eq!(b1.status, UnitStatus::Available);

    let b2 = units
        .iter()
        .find(|unit| unit.inputs.contains_key(&format!("{DATASET}#b2")))
        .expect("unit for b2");
    assert_eq!(b2.jobs, 1);
    assert_eq!(
        b2.inputs[&format!("{DATASET}#b2")],
        BTreeSet::from([NO_INITIAL_SITE.to_string()])
    );

    assert_eq!(
        harness.tracker.acquired(),
        vec![("req-1".to_string(), "https://queue.example.org".to_string())]
    );
    Ok(())
}

#[tokio::test]
async fn running_status_and_progress_are_pushed_once_per_change() -> anyhow::Result<()> {
    let harness = Harness::new();
    harness
        .location
        .add_block(&format!("{DATASET}#b1"), 10, &["T1_US_FNAL"]);
    harness.tracker.assign("req-1", SPEC_REF);
    harness
        .specs
        .insert(SPEC_REF, Harness::file_spec("req-1", 10));

    let mut sync = harness.sync(Harness::config(7200));
    sync.cycle().await;

    for mut unit in harness.store.query("req-1").await? {
        unit.apply_progress(&ProgressReport {
            status: Some(UnitStatus::Running),
            events_written: 100,
            files_processed: 1,
            percent_complete: 10.0,
            percent_success: 100.0,
        });
        harness.store.put(unit).await?;
    }
    sync.cycle().await;
    sync.cycle().await;

    assert_eq!(
        harness.tracker.pushed_statuses(),
        vec![("req-1".to_string(), TrackerStatus::Running)]
    );
    // Unchanged progress must not be pushed again.
    assert_eq!(harness.tracker.pushed_progress().len(), 1);
    Ok(())
}

#[tokio::test]
async fn terminal_tracker_status_waits_out_the_grace_period() -> anyhow::Result<()> {
    let harness = Harness::new();
    harness
        .location
        .add_block(&format!("{DATASET}#b1"), 10, &["T1_US_FNAL"]);
    harness.tracker.assign("req-1", SPEC_REF);
    harness
        .specs
        .insert(SPEC_REF, Harness::file_spec("req-1", 10));

    let mut sync = harness.sync(Harness::config(7200));
    sync.cycle().await;
    harness.mark_all_units("req-1", UnitStatus::Running).await;
    harness
        .tracker
        .set_remote_status("req-1", TrackerStatus::Completed);

    // Units are one hour stale but the grace period is two hours: nothing
    // may be finished or deleted yet.
    sync.cycle().await;
    let units = harness.store.query("req-1").await?;
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].status, UnitStatus::Running);

    // A scheduler with an elapsed grace period force-finishes and retires.
    let mut impatient = harness.sync(Harness::config(60));
    impatient.cycle().await;
    assert!(harness.store.query("req-1").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn aborted_requests_cancel_immediately() -> anyhow::Result<()> {
    let harness = Harness::new();
    harness
        .location
        .add_block(&format!("{DATASET}#b1"), 10, &["T1_US_FNAL"]);
    harness.tracker.assign("req-1", SPEC_REF);
    harness
        .specs
        .insert(SPEC_REF, Harness::file_spec("req-1", 10));

    let mut sync = harness.sync(Harness::config(7200));
    sync.cycle().await;
    harness
        .tracker
        .set_remote_status("req-1", TrackerStatus::Aborted);

    // Units are fresh and not even running; abort overrides the grace
    // period outright.
    sync.report().await;
    let units = harness.store.query("req-1").await?;
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].status, UnitStatus::Canceled);

    sync.retire().await;
    assert!(harness.store.query("req-1").await?.is_empty());
    assert!(sync.tracked_requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn request_without_input_dataset_fails_permanently() -> anyhow::Result<()> {
    let harness = Harness::new();
    harness.tracker.assign("req-bad", SPEC_REF);
    let mut spec = Harness::file_spec("req-bad", 10);
    spec.input_dataset = None;
    harness.specs.insert(SPEC_REF, spec);

    let mut sync = harness.sync(Harness::config(7200));
    sync.cycle().await;

    assert_eq!(
        harness.tracker.pushed_statuses(),
        vec![("req-bad".to_string(), TrackerStatus::Failed)]
    );
    let messages = harness.tracker.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].1.contains("no input dataset"));
    assert!(sync.tracked_requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn malformed_spec_reference_fails_permanently() -> anyhow::Result<()> {
    let harness = Harness::new();
    harness.tracker.assign("req-bad", "no scheme, no such path");

    let mut sync = harness.sync(Harness::config(7200));
    sync.cycle().await;

    assert_eq!(
        harness.tracker.pushed_statuses(),
        vec![("req-bad".to_string(), TrackerStatus::Failed)]
    );
    Ok(())
}

#[tokio::test]
async fn transient_location_outage_leaves_the_request_for_the_next_cycle() -> anyhow::Result<()> {
    let harness = Harness::new();
    harness
        .location
        .add_block(&format!("{DATASET}#b1"), 10, &["T1_US_FNAL"]);
    harness.tracker.assign("req-1", SPEC_REF);
    harness
        .specs
        .insert(SPEC_REF, Harness::file_spec("req-1", 10));
    harness.location.set_failing(true);

    let mut sync = harness.sync(Harness::config(7200));
    sync.cycle().await;

    // No status change pushed, only a retry note; no units queued.
    assert!(harness.tracker.pushed_statuses().is_empty());
    let messages = harness.tracker.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].1.starts_with("will retry"));
    assert!(harness.store.query("req-1").await?.is_empty());

    // The outage clears and the next cycle succeeds.
    harness.location.set_failing(false);
    sync.cycle().await;
    assert_eq!(harness.store.query("req-1").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn open_datasets_are_resplit_without_duplicates() -> anyhow::Result<()> {
    let harness = Harness::new();
    harness
        .location
        .add_block(&format!("{DATASET}#b1"), 10, &["T1_US_FNAL"]);
    harness.tracker.assign("req-1", SPEC_REF);
    harness
        .specs
        .insert(SPEC_REF, Harness::file_spec("req-1", 10));

    let mut sync = harness.sync(Harness::config(7200));
    sync.cycle().await;
    assert_eq!(harness.store.query("req-1").await?.len(), 1);

    // The dataset grows a block and reports itself open.
    harness
        .location
        .add_block(&format!("{DATASET}#b2"), 20, &["T1_US_FNAL"]);
    harness.location.set_open(&[&format!("{DATASET}#b2")]);

    sync.cycle().await;
    let units = harness.store.query("req-1").await?;
    assert_eq!(units.len(), 2);

    // Re-running with nothing new stays stable.
    sync.cycle().await;
    assert_eq!(harness.store.query("req-1").await?.len(), 2);
    Ok(())
}
