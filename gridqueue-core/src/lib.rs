//! # GridQueue Core
//!
//! The work-distribution scheduler for large physics-data-processing
//! requests. Requests pulled from an external tracker are decomposed into
//! fine-grained, independently schedulable work units that honor data
//! locality, site restrictions, and run/lumi filtering, and the local status
//! of that work is kept synchronized with the tracker.
//!
//! The crate is organized into:
//!
//! - [`split`]: the block-based split policy that turns an input dataset into
//!   work units.
//! - [`sync`]: the pull/report/delete control loop against the tracker.
//! - [`location`], [`tracker`], [`store`], [`specs`]: ports for the external
//!   collaborators, with an in-memory store and an HTTP tracker binding.
//!
//! The work-unit data model itself lives in `gridqueue-model`.

pub mod config;
pub mod error;
pub mod location;
pub mod specs;
pub mod split;
pub mod store;
pub mod sync;
pub mod tracker;

pub use config::SyncConfig;
pub use error::{FailureClass, QueueError, Result};
pub use location::{BlockSummary, DataLocation, NO_INITIAL_SITE};
pub use specs::{FileSpecSource, SpecSource};
pub use split::{BlockLedger, BlockSplitPolicy, RejectReason, SplitOutcome};
pub use store::{MemoryUnitStore, UnitStore};
pub use sync::TrackerSync;
pub use tracker::{AssignedRequest, HttpTracker, Tracker, TrackerReport};

pub use gridqueue_model as model;
