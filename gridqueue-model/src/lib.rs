//! Core data model definitions shared across GridQueue crates.
//!
//! The central type is [`WorkUnit`], one independently schedulable slice of a
//! processing request. Units carry a content-addressed identity used for
//! deduplication across queue reloads, a monotonic status state machine, and
//! the site/mask bookkeeping the split policy and tracker synchronization
//! layers operate on.

pub mod error;
pub mod mask;
pub mod request;
pub mod status;
pub mod unit;

pub use error::{ModelError, Result as ModelResult};
pub use mask::{LumiRange, Mask};
pub use request::{RequestSpec, SliceType};
pub use status::{TrackerStatus, UnitStatus};
pub use unit::{ProgressReport, WorkUnit, WorkUnitBuilder};
