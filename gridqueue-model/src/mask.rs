use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Inclusive range of lumi section numbers within one run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LumiRange {
    pub first: u64,
    pub last: u64,
}

impl LumiRange {
    pub fn new(first: u64, last: u64) -> Result<Self> {
        if first > last {
            return Err(ModelError::InvalidLumiRange { first, last });
        }
        Ok(Self { first, last })
    }

    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Run/lumi restriction applied to a work unit's input.
///
/// Held in canonical form: runs sorted, ranges per run sorted with
/// overlapping and adjacent ranges merged. Canonical form makes the
/// serialization deterministic, which the identity digest relies on.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Mask {
    runs: BTreeMap<u32, Vec<LumiRange>>,
}

impl Mask {
    pub fn new(runs: BTreeMap<u32, Vec<LumiRange>>) -> Result<Self> {
        let mut normalized = BTreeMap::new();
        for (run, ranges) in runs {
            let merged = normalize_ranges(ranges)?;
            if !merged.is_empty() {
                normalized.insert(run, merged);
            }
        }
        Ok(Self { runs: normalized })
    }

    /// Convenience constructor from `(run, first, last)` triples.
    pub fn from_triples<I>(triples: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u32, u64, u64)>,
    {
        let mut runs: BTreeMap<u32, Vec<LumiRange>> = BTreeMap::new();
        for (run, first, last) in triples {
            runs.entry(run).or_default().push(LumiRange::new(first, last)?);
        }
        Self::new(runs)
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn contains_run(&self, run: u32) -> bool {
        self.runs.contains_key(&run)
    }

    pub fn runs(&self) -> impl Iterator<Item = u32> + '_ {
        self.runs.keys().copied()
    }

    /// Total number of masked lumi sections across all runs.
    pub fn lumi_count(&self) -> u64 {
        self.runs
            .values()
            .flat_map(|ranges| ranges.iter())
            .map(LumiRange::len)
            .sum()
    }

    /// Number of masked lumi sections within a single run.
    pub fn lumis_for_run(&self, run: u32) -> u64 {
        self.runs
            .get(&run)
            .map(|ranges| ranges.iter().map(LumiRange::len).sum())
            .unwrap_or(0)
    }

    /// Deterministic byte encoding of the canonical form, consumed by the
    /// work unit identity digest.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.runs.len() as u64).to_le_bytes());
        for (run, ranges) in &self.runs {
            out.extend_from_slice(&run.to_le_bytes());
            out.extend_from_slice(&(ranges.len() as u64).to_le_bytes());
            for range in ranges {
                out.extend_from_slice(&range.first.to_le_bytes());
                out.extend_from_slice(&range.last.to_le_bytes());
            }
        }
        out
    }
}

fn normalize_ranges(mut ranges: Vec<LumiRange>) -> Result<Vec<LumiRange>> {
    for range in &ranges {
        if range.first > range.last {
            return Err(ModelError::InvalidLumiRange {
                first: range.first,
                last: range.last,
            });
        }
    }
    ranges.sort_by_key(|r| (r.first, r.last));
    let mut merged: Vec<LumiRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(prev) if range.first <= prev.last.saturating_add(1) => {
                prev.last = prev.last.max(range.last);
            }
            _ => merged.push(range),
        }
    }
    Ok(merged)
}
