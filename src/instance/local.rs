//! instance/local: источник на локальной файловой системе.
//!
//! Раскладка:
//!   <root>/instance.json                # управляющий файл (LSN, архив, ptrack, табличные пространства)
//!   <root>/instance.lock                # эксклюзивный lock писателя (fs2)
//!   <root>/tablespaces/<id>/            # корень табличного пространства
//!       pg_compression                  # карта сжатия (только для сжатых)
//!       <rel>, <rel>.cfm, <rel>_ptrack  # данные, CFM, битовая карта ptrack
//!
//! Запись блоков (сторона "движка") нужна тестам и утилитам: каждый блок получает
//! новый LSN в первых 8 байтах, чанки пересжимаются, CFM и ptrack обновляются,
//! архив WAL догоняет текущий LSN (если не приостановлен).
//!
//! Все изменения и freeze_tracking выполняются под одним lock'ом, поэтому снимок
//! ptrack атомарен относительно писателей.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::{SourceConnection, SourceInstance, TablespaceInfo};
use crate::cfm::{self, chunk_checksum, ChunkDescriptor, CompressedFileMap};
use crate::cmap::{self, TablespaceCompressionMap};
use crate::codec::{compress_chunk, decompress_chunk, Algorithm};
use crate::consts::{
    BLOCK_LSN_LEN, BLOCK_SIZE, INSTANCE_FILE, INSTANCE_LOCK_FILE, PTRACK_SUFFIX, TABLESPACES_DIR,
};
use crate::error::BackupError;
use crate::lock::{acquire_exclusive_lock, LockGuard};
use crate::tracking::bitmap::{is_ptrack, ptrack_path, read_ptrack, write_ptrack};
use crate::tracking::{rel_key, FrozenTracking, PtrackBitmap};
use crate::util::{rel_string, walk_files, write_file_atomic};

const FIRST_TABLESPACE_ID: u32 = 16384;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TablespaceEntry {
    id: u32,
    name: String,
    compressed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstanceControl {
    name: String,
    current_lsn: u64,
    /// None: архивирование WAL не настроено.
    archived_lsn: Option<u64>,
    #[serde(default)]
    archive_paused: bool,
    ptrack_enabled: bool,
    ptrack_reset_lsn: Option<u64>,
    next_tablespace_id: u32,
    tablespaces: Vec<TablespaceEntry>,
}

pub struct LocalInstance {
    root: PathBuf,
    name: String,
    /// STREAM connection "drops" after this many fetches (fault injection).
    stream_fetch_limit: Option<usize>,
}

impl LocalInstance {
    /// Create a new instance at `root` (ptrack enabled, WAL archiving on).
    pub fn init(root: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(root.join(TABLESPACES_DIR))
            .with_context(|| format!("create instance root {}", root.display()))?;
        let ctl_path = root.join(INSTANCE_FILE);
        if ctl_path.exists() {
            return Err(anyhow!("instance already exists at {}", root.display()));
        }
        let ctl = InstanceControl {
            name: name.to_string(),
            current_lsn: 1,
            archived_lsn: Some(1),
            archive_paused: false,
            ptrack_enabled: true,
            ptrack_reset_lsn: Some(0),
            next_tablespace_id: FIRST_TABLESPACE_ID,
            tablespaces: Vec::new(),
        };
        save_control(root, &ctl)?;
        info!("instance: init name={}, root={}", name, root.display());
        Ok(Self {
            root: root.to_path_buf(),
            name: name.to_string(),
            stream_fetch_limit: None,
        })
    }

    pub fn open(root: &Path) -> Result<Self> {
        let ctl = load_control(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            name: ctl.name,
            stream_fetch_limit: None,
        })
    }

    /// STREAM connections opened from this handle fail after `n` fetches.
    pub fn with_stream_fetch_limit(mut self, n: Option<usize>) -> Self {
        self.stream_fetch_limit = n;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn current_lsn(&self) -> Result<u64> {
        Ok(load_control(&self.root)?.current_lsn)
    }

    pub fn tablespace_root(&self, id: u32) -> PathBuf {
        self.root.join(TABLESPACES_DIR).join(id.to_string())
    }

    pub fn relation_path(&self, tablespace_id: u32, rel: &str) -> PathBuf {
        self.tablespace_root(tablespace_id).join(rel)
    }

    // ---------- control knobs ----------

    pub fn set_ptrack_enabled(&self, on: bool) -> Result<()> {
        self.update(|ctl| {
            if on && !ctl.ptrack_enabled {
                // карта начинает отслеживать изменения только с этого момента
                ctl.ptrack_reset_lsn = Some(ctl.current_lsn);
            }
            ctl.ptrack_enabled = on;
            Ok(())
        })
    }

    /// Turn WAL archiving on/off entirely.
    pub fn set_archiving(&self, on: bool) -> Result<()> {
        self.update(|ctl| {
            ctl.archived_lsn = if on { Some(ctl.current_lsn) } else { None };
            Ok(())
        })
    }

    /// Stop/resume the archiver (archived_lsn stops following current_lsn).
    pub fn pause_archive(&self, paused: bool) -> Result<()> {
        self.update(|ctl| {
            ctl.archive_paused = paused;
            if !paused && ctl.archived_lsn.is_some() {
                ctl.archived_lsn = Some(ctl.current_lsn);
            }
            Ok(())
        })
    }

    // ---------- tablespaces ----------

    /// Create a tablespace; with `compression` it gets a pg_compression map.
    pub fn create_tablespace(
        &self,
        name: &str,
        compression: Option<(Algorithm, u32)>,
    ) -> Result<TablespaceInfo> {
        let mut created = None;
        self.update(|ctl| {
            if ctl.tablespaces.iter().any(|t| t.name == name) {
                return Err(anyhow!("tablespace '{}' already exists", name));
            }
            let id = ctl.next_tablespace_id;
            ctl.next_tablespace_id += 1;
            let root = self.tablespace_root(id);
            fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;
            if let Some((algo, chunk_size)) = compression {
                cmap::write_compression_map(
                    &root,
                    &TablespaceCompressionMap::new(id, algo, chunk_size),
                )?;
            }
            ctl.tablespaces.push(TablespaceEntry {
                id,
                name: name.to_string(),
                compressed: compression.is_some(),
            });
            created = Some(TablespaceInfo {
                id,
                name: name.to_string(),
                root,
                compressed: compression.is_some(),
            });
            Ok(())
        })?;
        let ts = created.ok_or_else(|| anyhow!("tablespace not created"))?;
        info!(
            "instance: tablespace created id={}, name={}, compressed={}",
            ts.id, ts.name, ts.compressed
        );
        Ok(ts)
    }

    // ---------- engine-side writes ----------

    /// Write blocks starting at `start_block`. Each payload goes after the block
    /// LSN header and is zero-padded. Returns the LSN of the last written block.
    pub fn write_blocks(
        &self,
        tablespace_id: u32,
        rel: &str,
        start_block: u64,
        payloads: &[Vec<u8>],
    ) -> Result<u64> {
        let max_payload = BLOCK_SIZE - BLOCK_LSN_LEN;
        if let Some(p) = payloads.iter().find(|p| p.len() > max_payload) {
            return Err(anyhow!("block payload {} exceeds {}", p.len(), max_payload));
        }
        let path = self.relation_path(tablespace_id, rel);
        let mut last_lsn = 0;
        self.update(|ctl| {
            let ts = ctl
                .tablespaces
                .iter()
                .find(|t| t.id == tablespace_id)
                .cloned()
                .ok_or_else(|| BackupError::NotFound(format!("tablespace {}", tablespace_id)))?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            let map = if ts.compressed {
                Some(cmap::read_compression_map(&self.tablespace_root(ts.id))?)
            } else {
                None
            };
            let mut raw = match &map {
                Some(m) => load_logical(&path, m.algorithm)?,
                None => {
                    if path.exists() {
                        fs::read(&path).with_context(|| format!("read {}", path.display()))?
                    } else {
                        Vec::new()
                    }
                }
            };

            let mut bm = if ctl.ptrack_enabled {
                Some(read_ptrack(&path)?.unwrap_or_default())
            } else {
                None
            };

            for (k, payload) in payloads.iter().enumerate() {
                let blk = start_block + k as u64;
                ctl.current_lsn += 1;
                let start = blk as usize * BLOCK_SIZE;
                if raw.len() < start + BLOCK_SIZE {
                    raw.resize(start + BLOCK_SIZE, 0);
                }
                let block = &mut raw[start..start + BLOCK_SIZE];
                block.iter_mut().for_each(|b| *b = 0);
                LittleEndian::write_u64(&mut block[0..BLOCK_LSN_LEN], ctl.current_lsn);
                block[BLOCK_LSN_LEN..BLOCK_LSN_LEN + payload.len()].copy_from_slice(payload);
                if let Some(bm) = bm.as_mut() {
                    bm.set(blk as u32);
                }
            }
            last_lsn = ctl.current_lsn;

            match &map {
                Some(m) => store_compressed(&path, m, &raw)?,
                None => write_file_atomic(&path, &raw, false)?,
            }
            if let Some(bm) = bm {
                write_ptrack(&path, &bm)?;
            }
            follow_archive(ctl);
            Ok(())
        })?;
        debug!(
            "instance: wrote {} block(s) to {} from block {}, lsn={}",
            payloads.len(),
            path.display(),
            start_block,
            last_lsn
        );
        Ok(last_lsn)
    }

    /// Append blocks after the current end of the relation.
    pub fn append_blocks(&self, tablespace_id: u32, rel: &str, payloads: &[Vec<u8>]) -> Result<u64> {
        let start = self.relation_nblocks(tablespace_id, rel)?;
        self.write_blocks(tablespace_id, rel, start, payloads)
    }

    /// Current length of a relation in blocks (0 if it does not exist).
    pub fn relation_nblocks(&self, tablespace_id: u32, rel: &str) -> Result<u64> {
        let path = self.relation_path(tablespace_id, rel);
        if !path.exists() {
            return Ok(0);
        }
        let size = if cfm::cfm_path(&path).exists() {
            cfm::read_cfm(&path)?.logical_size
        } else {
            fs::metadata(&path)?.len()
        };
        Ok(crate::tracking::nblocks_for(size))
    }

    /// Read back one logical block (LSN header included).
    pub fn read_block(&self, tablespace_id: u32, rel: &str, block: u64) -> Result<Vec<u8>> {
        let path = self.relation_path(tablespace_id, rel);
        let raw = match cmap::read_compression_map(&self.tablespace_root(tablespace_id)) {
            Ok(m) => load_logical(&path, m.algorithm)?,
            Err(_) => fs::read(&path).with_context(|| format!("read {}", path.display()))?,
        };
        let start = block as usize * BLOCK_SIZE;
        raw.get(start..start + BLOCK_SIZE)
            .map(|b| b.to_vec())
            .ok_or_else(|| anyhow!("block {} beyond end of {}", block, path.display()))
    }

    /// Remove a relation with its sidecars.
    pub fn drop_relation(&self, tablespace_id: u32, rel: &str) -> Result<()> {
        let path = self.relation_path(tablespace_id, rel);
        self.update(|ctl| {
            for p in [path.clone(), cfm::cfm_path(&path), ptrack_path(&path)] {
                if p.exists() {
                    fs::remove_file(&p).with_context(|| format!("remove {}", p.display()))?;
                }
            }
            ctl.current_lsn += 1;
            follow_archive(ctl);
            Ok(())
        })
    }

    // ---------- internals ----------

    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut InstanceControl) -> Result<()>,
    {
        let _lk = self.lock()?;
        let mut ctl = load_control(&self.root)?;
        f(&mut ctl)?;
        save_control(&self.root, &ctl)
    }

    fn lock(&self) -> Result<LockGuard> {
        acquire_exclusive_lock(&self.root.join(INSTANCE_LOCK_FILE))
    }
}

impl SourceInstance for LocalInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn tablespaces(&self) -> Result<Vec<TablespaceInfo>> {
        let ctl = load_control(&self.root)?;
        Ok(ctl
            .tablespaces
            .iter()
            .map(|t| TablespaceInfo {
                id: t.id,
                name: t.name.clone(),
                root: self.tablespace_root(t.id),
                compressed: t.compressed,
            })
            .collect())
    }

    fn start_backup(&self) -> Result<u64> {
        let mut lsn = 0;
        self.update(|ctl| {
            // checkpoint record
            ctl.current_lsn += 1;
            follow_archive(ctl);
            lsn = ctl.current_lsn;
            Ok(())
        })?;
        Ok(lsn)
    }

    fn stop_backup(&self) -> Result<u64> {
        let mut lsn = 0;
        self.update(|ctl| {
            // backup end record
            ctl.current_lsn += 1;
            follow_archive(ctl);
            lsn = ctl.current_lsn;
            Ok(())
        })?;
        Ok(lsn)
    }

    fn archived_lsn(&self) -> Result<Option<u64>> {
        Ok(load_control(&self.root)?.archived_lsn)
    }

    fn freeze_tracking(&self, lsn: u64) -> Result<FrozenTracking> {
        let mut frozen = FrozenTracking::default();
        self.update(|ctl| {
            frozen.enabled = ctl.ptrack_enabled;
            frozen.reset_lsn = ctl.ptrack_reset_lsn;
            if !ctl.ptrack_enabled {
                return Ok(());
            }
            for ts in &ctl.tablespaces {
                let ts_root = self.tablespace_root(ts.id);
                for rel in walk_files(&ts_root)? {
                    let p = ts_root.join(&rel);
                    if !is_ptrack(&p) {
                        continue;
                    }
                    let bytes = fs::read(&p).with_context(|| format!("read {}", p.display()))?;
                    let mut bm = PtrackBitmap::decode(&p, &bytes)?;
                    let key = rel_string(&rel);
                    let rel_name = key.strip_suffix(PTRACK_SUFFIX).unwrap_or(&key);
                    frozen.bitmaps.insert(rel_key(ts.id, rel_name), bm.clone());
                    bm.clear();
                    write_file_atomic(&p, &bm.encode(), false)?;
                }
            }
            ctl.ptrack_reset_lsn = Some(lsn);
            Ok(())
        })?;
        debug!(
            "instance: ptrack frozen, bitmaps={}, previous reset={:?}, new reset={}",
            frozen.bitmaps.len(),
            frozen.reset_lsn,
            lsn
        );
        Ok(frozen)
    }

    fn connect(&self) -> Result<Box<dyn SourceConnection>> {
        Ok(Box::new(LocalConnection {
            remaining: self.stream_fetch_limit,
        }))
    }
}

struct LocalConnection {
    remaining: Option<usize>,
}

impl LocalConnection {
    fn request(&mut self) -> Result<()> {
        if let Some(n) = self.remaining.as_mut() {
            if *n == 0 {
                return Err(BackupError::Transfer("connection to source instance lost".into()).into());
            }
            *n -= 1;
        }
        Ok(())
    }
}

impl SourceConnection for LocalConnection {
    fn list(&mut self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        walk_files(dir)
    }

    fn fetch(&mut self, path: &Path) -> Result<Option<Vec<u8>>> {
        self.request()?;
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(path).with_context(|| format!("stream fetch {}", path.display()))?;
        Ok(Some(bytes))
    }
}

// ---------- helpers ----------

fn load_control(root: &Path) -> Result<InstanceControl> {
    let path = root.join(INSTANCE_FILE);
    let s = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&s).with_context(|| format!("parse {}", path.display()))
}

fn save_control(root: &Path, ctl: &InstanceControl) -> Result<()> {
    let json = serde_json::to_string_pretty(ctl).context("serialize instance control")?;
    write_file_atomic(&root.join(INSTANCE_FILE), json.as_bytes(), true)
}

fn follow_archive(ctl: &mut InstanceControl) {
    if ctl.archived_lsn.is_some() && !ctl.archive_paused {
        ctl.archived_lsn = Some(ctl.current_lsn);
    }
}

/// Logical bytes of a compressed relation (empty if the file does not exist yet).
fn load_logical(path: &Path, algorithm: Algorithm) -> Result<Vec<u8>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let map = cfm::read_cfm(path)?;
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut raw = vec![0u8; map.logical_size as usize];
    for (i, c) in map.chunks.iter().enumerate() {
        let stored = c
            .physical_end()
            .and_then(|end| data.get(c.physical_offset as usize..end as usize))
            .ok_or_else(|| BackupError::corruption(path, Some(i), "chunk beyond end of file"))?;
        let chunk = decompress_chunk(algorithm, stored, c.uncompressed_length as usize)?;
        let lo = c.logical_offset as usize;
        let dst = lo
            .checked_add(chunk.len())
            .and_then(|hi| raw.get_mut(lo..hi))
            .ok_or_else(|| {
                BackupError::corruption(
                    path,
                    Some(i),
                    format!("chunk ends past logical size {}", map.logical_size),
                )
            })?;
        dst.copy_from_slice(&chunk);
    }
    Ok(raw)
}

/// Re-chunk and compress the whole logical image, rewriting data file and CFM.
fn store_compressed(path: &Path, m: &TablespaceCompressionMap, raw: &[u8]) -> Result<()> {
    let mut map = CompressedFileMap::new(path, m.chunk_size);
    map.logical_size = raw.len() as u64;
    let mut data = Vec::new();
    for (i, window) in raw.chunks(m.chunk_size as usize).enumerate() {
        let stored = compress_chunk(m.algorithm, window)?;
        map.chunks.push(ChunkDescriptor {
            logical_offset: i as u64 * m.chunk_size as u64,
            physical_offset: data.len() as u64,
            compressed_length: stored.len() as u32,
            uncompressed_length: window.len() as u32,
            checksum: chunk_checksum(&stored),
        });
        data.extend_from_slice(&stored);
    }
    write_file_atomic(path, &data, false)?;
    cfm::write_cfm(&map)
}
