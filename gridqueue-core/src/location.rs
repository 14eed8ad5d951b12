//! Port for the external data-location service.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Placeholder site assigned when location resolution yields nothing.
///
/// Unresolved location must not silently drop valid data; a later
/// location-mapping pass replaces the sentinel once the data surfaces
/// somewhere.
pub const NO_INITIAL_SITE: &str = "NoInitialSite";

/// Summary counts for one block as reported by the data catalog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockSummary {
    pub name: String,
    pub num_files: u64,
    pub num_events: u64,
    pub num_lumis: u64,
    /// True while the block may still receive new files.
    pub open: bool,
}

/// Resolves dataset/block metadata and locations.
///
/// All calls are remote; failures surface as
/// [`QueueError::Location`](crate::error::QueueError::Location) and are
/// treated as transient by the synchronization loop.
#[async_trait]
pub trait DataLocation: Send + Sync {
    /// All blocks of a dataset with their summary counts.
    async fn resolve_blocks(&self, dataset: &str) -> Result<Vec<BlockSummary>>;

    /// Sites currently hosting a block. May be empty.
    async fn block_sites(&self, block: &str) -> Result<Vec<String>>;

    /// Map of run number to lumi-section count for a block.
    async fn block_runs(&self, block: &str) -> Result<BTreeMap<u32, u64>>;

    /// Names of the blocks a block was produced from.
    async fn block_parents(&self, block: &str) -> Result<Vec<String>>;

    /// Names of the dataset's still-open blocks.
    async fn open_blocks(&self, dataset: &str) -> Result<Vec<String>>;
}
