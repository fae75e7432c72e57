//! transfer: how backup bytes leave the source.
//!
//! - ARCHIVE: файлы читаются напрямую с файловой системы источника; замороженные
//!   ptrack-карты сохраняются в бэкап.
//! - STREAM: всё идёт через выделенное соединение с источником; артефакты
//!   отслеживания изменений в бэкап не попадают. Потеря соединения фатальна
//!   (BackupError::Transfer), повторов нет.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::instance::SourceConnection;
use crate::util::walk_files;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferMode {
    Archive,
    Stream,
}

impl TransferMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "archive" => Some(TransferMode::Archive),
            "stream" => Some(TransferMode::Stream),
            _ => None,
        }
    }

    /// Whether frozen tracking bitmaps are stored alongside the data.
    pub fn persists_tracking(self) -> bool {
        matches!(self, TransferMode::Archive)
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Archive => write!(f, "ARCHIVE"),
            TransferMode::Stream => write!(f, "STREAM"),
        }
    }
}

pub trait Transport: Send + Sync {
    fn mode(&self) -> TransferMode;

    /// Regular files under `dir` (relative, sorted).
    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    /// File bytes, or None if the source has no such file.
    fn fetch(&self, path: &Path) -> Result<Option<Vec<u8>>>;
}

#[derive(Debug, Default)]
pub struct ArchiveTransport;

impl Transport for ArchiveTransport {
    fn mode(&self) -> TransferMode {
        TransferMode::Archive
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        walk_files(dir)
    }

    fn fetch(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        Ok(Some(bytes))
    }
}

/// One connection shared by the copy workers; requests are serialized.
pub struct StreamTransport {
    conn: Mutex<Box<dyn SourceConnection>>,
}

impl StreamTransport {
    pub fn new(conn: Box<dyn SourceConnection>) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

impl Transport for StreamTransport {
    fn mode(&self) -> TransferMode {
        TransferMode::Stream
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("stream connection mutex poisoned"))?;
        conn.list(dir)
            .with_context(|| format!("stream list {}", dir.display()))
    }

    fn fetch(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("stream connection mutex poisoned"))?;
        conn.fetch(path)
    }
}
