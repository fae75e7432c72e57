//! tracking: Change Tracking Provider, which blocks changed since the parent backup.
//!
//! Два варианта за одним интерфейсом (выбор задаётся значением конфигурации, не подкласс):
//! - Bitmap (PTRACK): per-relation битовая карта `<relation>_ptrack`, которую ведёт источник.
//!   Карта замораживается и сбрасывается атомарно в начале бэкапа (SourceInstance::freeze_tracking).
//! - Scan (PAGE): читаем каждый блок и сравниваем встроенный LSN с точкой отсчёта родителя.
//!
//! FULL не использует провайдер вовсе: изменённым считается каждый блок.

pub mod bitmap;
pub mod scan;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use crate::cfm::CompressedFileMap;
use crate::codec::Algorithm;
use crate::consts::BLOCK_SIZE;

pub use bitmap::{BitmapTracker, PtrackBitmap};
pub use scan::ScanTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeTracking {
    Bitmap,
    Scan,
}

impl ChangeTracking {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bitmap" | "ptrack" => Some(ChangeTracking::Bitmap),
            "scan" | "page" => Some(ChangeTracking::Scan),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeTracking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeTracking::Bitmap => write!(f, "bitmap"),
            ChangeTracking::Scan => write!(f, "scan"),
        }
    }
}

/// Reference point taken from the parent backup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferencePoint {
    pub start_lsn: u64,
    pub stop_lsn: u64,
}

/// Blocks of one relation file changed since the reference point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockChangeSet {
    pub blocks: BTreeSet<u64>,
}

impl BlockChangeSet {
    pub fn full(nblocks: u64) -> Self {
        Self {
            blocks: (0..nblocks).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn contains(&self, block: u64) -> bool {
        self.blocks.contains(&block)
    }

    /// Chunk numbers touched by the set.
    pub fn chunks(&self, blocks_per_chunk: u64) -> BTreeSet<u64> {
        let bpc = blocks_per_chunk.max(1);
        self.blocks.iter().map(|b| b / bpc).collect()
    }
}

/// Number of logical blocks in a relation file of `logical_size` bytes.
pub fn nblocks_for(logical_size: u64) -> u64 {
    (logical_size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64
}

/// Key of a relation file across tablespaces: "<tablespace_id>/<relative path>".
pub fn rel_key(tablespace_id: u32, rel_path: &str) -> String {
    format!("{}/{}", tablespace_id, rel_path)
}

/// What a provider gets to look at for one relation file.
pub struct RelationView<'a> {
    pub key: &'a str,
    pub path: &'a Path,
    pub map: &'a CompressedFileMap,
    pub data: &'a [u8],
    pub algorithm: Algorithm,
}

impl RelationView<'_> {
    pub fn nblocks(&self) -> u64 {
        nblocks_for(self.map.logical_size)
    }
}

/// Bitmap state captured by SourceInstance::freeze_tracking.
#[derive(Debug, Clone, Default)]
pub struct FrozenTracking {
    pub enabled: bool,
    /// LSN of the reset preceding this freeze (tracking covers (reset_lsn, freeze]).
    pub reset_lsn: Option<u64>,
    /// rel_key -> bitmap
    pub bitmaps: HashMap<String, PtrackBitmap>,
}

/// Capability interface shared by both variants.
pub trait ChangeTrackingProvider: Send + Sync {
    fn kind(&self) -> ChangeTracking;

    fn compute_change_set(
        &self,
        rel: &RelationView<'_>,
        reference: &ReferencePoint,
    ) -> Result<BlockChangeSet>;
}

/// Build the provider for an incremental backup. Availability is checked here,
/// before any block is read.
pub fn provider_for(
    kind: ChangeTracking,
    frozen: FrozenTracking,
    reference: &ReferencePoint,
) -> Result<Box<dyn ChangeTrackingProvider>> {
    match kind {
        ChangeTracking::Bitmap => Ok(Box::new(BitmapTracker::new(frozen, reference)?)),
        ChangeTracking::Scan => Ok(Box::new(ScanTracker::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_set_to_chunks() {
        let set = BlockChangeSet {
            blocks: [0u64, 1, 5, 9].into_iter().collect(),
        };
        let chunks: Vec<u64> = set.chunks(4).into_iter().collect();
        assert_eq!(chunks, vec![0, 1, 2]);
        assert_eq!(BlockChangeSet::full(3).len(), 3);
    }

    #[test]
    fn block_count_rounds_up() {
        assert_eq!(nblocks_for(0), 0);
        assert_eq!(nblocks_for(1), 1);
        assert_eq!(nblocks_for(BLOCK_SIZE as u64 * 2), 2);
    }

    #[test]
    fn tracking_names() {
        assert_eq!(ChangeTracking::parse("PTRACK"), Some(ChangeTracking::Bitmap));
        assert_eq!(ChangeTracking::parse("scan"), Some(ChangeTracking::Scan));
        assert_eq!(ChangeTracking::parse("wal"), None);
    }
}
