use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::mask::Mask;
use crate::status::UnitStatus;

/// One schedulable slice of a request's work.
///
/// Units are keyed in the store by [`WorkUnit::identity`], a content digest
/// over the fields that define *which* work this is. Site lists and parent
/// data may legitimately evolve while the unit stays the same work, so they
/// are excluded from the digest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkUnit {
    pub request_name: String,
    /// Absent for umbrella/"inbox" units.
    pub task_name: Option<String>,
    /// Input block or dataset name mapped to the sites believed to host it.
    pub inputs: BTreeMap<String, BTreeSet<String>>,
    pub parent_flag: bool,
    /// Parent block name mapped to its site set; populated only when
    /// `parent_flag` is true, though it may still be empty.
    pub parent_data: BTreeMap<String, BTreeSet<String>>,
    pub pileup_data: BTreeMap<String, BTreeSet<String>>,
    pub site_whitelist: BTreeSet<String>,
    pub site_blacklist: BTreeSet<String>,
    /// Trust the stated input site lists instead of intersecting with data
    /// location.
    pub no_input_update: bool,
    pub no_pileup_update: bool,
    pub mask: Option<Mask>,
    /// Resubmission/recovery reference; empty for ordinary units.
    pub acdc: BTreeMap<String, String>,
    /// Data-catalog instance used to resolve this unit's inputs.
    pub dbs_url: String,
    /// Estimated number of jobs this unit will yield. Zero is valid only for
    /// zero-input pass-through work.
    pub jobs: u64,
    pub number_of_files: u64,
    pub number_of_events: u64,
    pub number_of_lumis: u64,
    /// True while the source block may still receive new files.
    pub open_for_new_data: bool,
    pub priority: i64,
    pub status: UnitStatus,
    pub creation_time: DateTime<Utc>,
    /// Bumped on every applied progress report; the tracker sync grace
    /// period keys off the least-recently-updated unit of a request.
    pub updated_at: DateTime<Utc>,
    pub events_written: u64,
    pub files_processed: u64,
    pub percent_complete: f32,
    pub percent_success: f32,
}

impl WorkUnit {
    pub fn builder(request_name: impl Into<String>) -> WorkUnitBuilder {
        WorkUnitBuilder::new(request_name)
    }

    /// Deterministic deduplication digest.
    ///
    /// Covers `(request_name, task_name, input keys, mask, acdc, dbs_url)`
    /// with every field length-prefixed before hashing, so no field value can
    /// bleed into its neighbor. Changing this computation without a
    /// coordinated store migration would silently duplicate active work
    /// across queue reloads.
    pub fn identity(&self) -> String {
        let mut hasher = Sha256::new();
        frame(&mut hasher, self.request_name.as_bytes());
        match &self.task_name {
            Some(task) => {
                hasher.update([1u8]);
                frame(&mut hasher, task.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update((self.inputs.len() as u64).to_le_bytes());
        for key in self.inputs.keys() {
            frame(&mut hasher, key.as_bytes());
        }
        match &self.mask {
            Some(mask) => {
                hasher.update([1u8]);
                frame(&mut hasher, &mask.canonical_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update((self.acdc.len() as u64).to_le_bytes());
        for (key, value) in &self.acdc {
            frame(&mut hasher, key.as_bytes());
            frame(&mut hasher, value.as_bytes());
        }
        frame(&mut hasher, self.dbs_url.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Sites this unit may run at once all active location filters are
    /// applied.
    ///
    /// With both trust flags set the whitelist is returned verbatim. A
    /// location filter only participates when its map is populated; a unit
    /// without pileup datasets is not constrained by pileup locality.
    pub fn eligible_sites(&self) -> BTreeSet<String> {
        if self.no_input_update && self.no_pileup_update {
            return self.site_whitelist.clone();
        }
        let mut sites: BTreeSet<String> = self
            .site_whitelist
            .difference(&self.site_blacklist)
            .cloned()
            .collect();
        if !self.no_input_update {
            if !self.inputs.is_empty() {
                let input_sites = union_of(self.inputs.values());
                sites.retain(|site| input_sites.contains(site));
            }
            if self.parent_flag && !self.parent_data.is_empty() {
                let parent_sites = union_of(self.parent_data.values());
                sites.retain(|site| parent_sites.contains(site));
            }
        }
        if !self.no_pileup_update && !self.pileup_data.is_empty() {
            let pileup_sites = union_of(self.pileup_data.values());
            sites.retain(|site| pileup_sites.contains(site));
        }
        sites
    }

    /// Whether a single site satisfies the unit's whitelist, blacklist, and
    /// data-locality requirements. The blacklist always takes precedence.
    pub fn passes_site_restriction(&self, site: &str) -> bool {
        if self.site_blacklist.contains(site) || !self.site_whitelist.contains(site) {
            return false;
        }
        if !self.no_input_update {
            if !self.inputs.values().all(|sites| sites.contains(site)) {
                return false;
            }
            if self.parent_flag
                && !self.parent_data.values().all(|sites| sites.contains(site))
            {
                return false;
            }
        }
        if !self.no_pileup_update
            && !self.pileup_data.values().all(|sites| sites.contains(site))
        {
            return false;
        }
        true
    }

    /// Applies an execution-feedback report.
    ///
    /// The status only moves forward per the monotonic transition rule;
    /// stale downgrades are dropped silently while progress counters are
    /// still taken when they advanced. Returns whether any field changed so
    /// the caller knows to write the unit back.
    pub fn apply_progress(&mut self, report: &ProgressReport) -> bool {
        let mut changed = false;
        if let Some(status) = report.status
            && status != self.status
            && self.status.can_transition_to(status)
        {
            self.status = status;
            changed = true;
        }
        if report.events_written != self.events_written {
            self.events_written = report.events_written;
            changed = true;
        }
        if report.files_processed != self.files_processed {
            self.files_processed = report.files_processed;
            changed = true;
        }
        if report.percent_complete != self.percent_complete {
            self.percent_complete = report.percent_complete;
            changed = true;
        }
        if report.percent_success != self.percent_success {
            self.percent_success = report.percent_success;
            changed = true;
        }
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }
}

fn union_of<'a, I>(sets: I) -> BTreeSet<&'a String>
where
    I: IntoIterator<Item = &'a BTreeSet<String>>,
{
    sets.into_iter().flatten().collect()
}

fn frame(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Execution feedback for one work unit.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProgressReport {
    pub status: Option<UnitStatus>,
    pub events_written: u64,
    pub files_processed: u64,
    pub percent_complete: f32,
    pub percent_success: f32,
}

impl ProgressReport {
    pub fn status_only(status: UnitStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Builder for [`WorkUnit`]; most fields carry defaults and splitting only
/// fills in what it resolved.
#[derive(Clone, Debug)]
pub struct WorkUnitBuilder {
    unit: WorkUnit,
}

impl WorkUnitBuilder {
    pub fn new(request_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            unit: WorkUnit {
                request_name: request_name.into(),
                task_name: None,
                inputs: BTreeMap::new(),
                parent_flag: false,
                parent_data: BTreeMap::new(),
                pileup_data: BTreeMap::new(),
                site_whitelist: BTreeSet::new(),
                site_blacklist: BTreeSet::new(),
                no_input_update: false,
                no_pileup_update: false,
                mask: None,
                acdc: BTreeMap::new(),
                dbs_url: String::new(),
                jobs: 0,
                number_of_files: 0,
                number_of_events: 0,
                number_of_lumis: 0,
                open_for_new_data: false,
                priority: 0,
                status: UnitStatus::Available,
                creation_time: now,
                updated_at: now,
                events_written: 0,
                files_processed: 0,
                percent_complete: 0.0,
                percent_success: 0.0,
            },
        }
    }

    pub fn task_name(mut self, task: impl Into<String>) -> Self {
        self.unit.task_name = Some(task.into());
        self
    }

    pub fn input(mut self, name: impl Into<String>, sites: BTreeSet<String>) -> Self {
        self.unit.inputs.insert(name.into(), sites);
        self
    }

    pub fn parent(mut self, name: impl Into<String>, sites: BTreeSet<String>) -> Self {
        self.unit.parent_flag = true;
        self.unit.parent_data.insert(name.into(), sites);
        self
    }

    pub fn parent_flag(mut self, flag: bool) -> Self {
        self.unit.parent_flag = flag;
        self
    }

    pub fn pileup(mut self, dataset: impl Into<String>, sites: BTreeSet<String>) -> Self {
        self.unit.pileup_data.insert(dataset.into(), sites);
        self
    }

    pub fn site_whitelist(mut self, sites: BTreeSet<String>) -> Self {
        self.unit.site_whitelist = sites;
        self
    }

    pub fn site_blacklist(mut self, sites: BTreeSet<String>) -> Self {
        self.unit.site_blacklist = sites;
        self
    }

    pub fn trust_site_lists(mut self, input: bool, pileup: bool) -> Self {
        self.unit.no_input_update = input;
        self.unit.no_pileup_update = pileup;
        self
    }

    pub fn mask(mut self, mask: Option<Mask>) -> Self {
        self.unit.mask = mask;
        self
    }

    pub fn acdc(mut self, acdc: BTreeMap<String, String>) -> Self {
        self.unit.acdc = acdc;
        self
    }

    pub fn dbs_url(mut self, url: impl Into<String>) -> Self {
        self.unit.dbs_url = url.into();
        self
    }

    pub fn jobs(mut self, jobs: u64) -> Self {
        self.unit.jobs = jobs;
        self
    }

    pub fn counts(mut self, files: u64, events: u64, lumis: u64) -> Self {
        self.unit.number_of_files = files;
        self.unit.number_of_events = events;
        self.unit.number_of_lumis = lumis;
        self
    }

    pub fn open_for_new_data(mut self, open: bool) -> Self {
        self.unit.open_for_new_data = open;
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.unit.priority = priority;
        self
    }

    pub fn build(self) -> WorkUnit {
        self.unit
    }
}
