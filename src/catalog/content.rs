//! catalog/content: `files.json`, what a backup holds per source file.
//!
//! Every source file seen at DISCOVER gets an entry, including files an
//! incremental backup did not store (`stored = false`). The Validator uses the
//! list to check that every expected data/sidecar pair is present; the next
//! incremental uses it to tell new relation files from known ones.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::codec::Algorithm;
use crate::consts::{CONTENT_FILE, TABLESPACES_DIR};
use crate::util::write_file_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Compressed relation file with a `.cfm` sidecar.
    Relation,
    /// Copied whole (uncompressed tablespace).
    Opaque,
    /// Frozen `_ptrack` bitmap (ARCHIVE mode only).
    Tracking,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablespaceContent {
    pub id: u32,
    pub name: String,
    pub compressed: bool,
    /// Algorithm code from pg_compression (compressed tablespaces only).
    #[serde(default)]
    pub algorithm: Option<u16>,
}

impl TablespaceContent {
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.algorithm.and_then(Algorithm::from_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub tablespace_id: u32,
    /// Path relative to the tablespace root, '/'-separated.
    pub path: String,
    pub kind: FileKind,
    pub logical_size: u64,
    #[serde(default)]
    pub chunks_total: u64,
    #[serde(default)]
    pub chunks_copied: u64,
    pub bytes_copied: u64,
    /// crc32c of opaque file bytes.
    #[serde(default)]
    pub checksum: Option<u32>,
    pub stored: bool,
}

impl ContentEntry {
    /// Location of the entry inside a backup directory.
    pub fn path_in(&self, backup_dir: &Path) -> PathBuf {
        tablespace_dir(backup_dir, self.tablespace_id).join(&self.path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupContent {
    pub tablespaces: Vec<TablespaceContent>,
    pub files: Vec<ContentEntry>,
}

impl BackupContent {
    pub fn contains(&self, tablespace_id: u32, path: &str, kind: FileKind) -> bool {
        self.files
            .iter()
            .any(|e| e.tablespace_id == tablespace_id && e.path == path && e.kind == kind)
    }

    /// Sum of copied payload bytes (tracking artifacts excluded).
    pub fn data_bytes(&self) -> u64 {
        self.files
            .iter()
            .filter(|e| e.kind != FileKind::Tracking)
            .map(|e| e.bytes_copied)
            .sum()
    }

    pub fn stored(&self) -> impl Iterator<Item = &ContentEntry> {
        self.files.iter().filter(|e| e.stored)
    }
}

/// `<backup_dir>/tablespaces/<id>`
pub fn tablespace_dir(backup_dir: &Path, tablespace_id: u32) -> PathBuf {
    backup_dir.join(TABLESPACES_DIR).join(tablespace_id.to_string())
}

pub fn read_content(backup_dir: &Path) -> Result<BackupContent> {
    let path = backup_dir.join(CONTENT_FILE);
    let s = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&s).with_context(|| format!("parse {}", path.display()))
}

pub fn write_content(backup_dir: &Path, content: &BackupContent, fsync: bool) -> Result<()> {
    let json = serde_json::to_string_pretty(content).context("serialize backup content")?;
    write_file_atomic(&backup_dir.join(CONTENT_FILE), json.as_bytes(), fsync)
}
