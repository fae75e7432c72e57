//! tracking/bitmap (PTRACK): битовая карта изменённых блоков, которую ведёт источник.
//!
//! Файл `<relation>_ptrack` (LE):
//!   [magic8="CFSPTRK1"][nblocks u32] + ceil(nblocks/8) байт битов + [crc32 u32]
//!
//! Бит i установлен, если блок i менялся после последнего сброса карты.
//! Точка сброса хранится в источнике (reset_lsn). Если сброс произошёл позже
//! точки отсчёта родителя, карта не покрывает весь интервал, и инкремент по ней
//! невозможен (ChangeTrackingUnavailable), тип бэкапа выбирает вызывающий.

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

use super::{
    BlockChangeSet, ChangeTracking, ChangeTrackingProvider, FrozenTracking, ReferencePoint,
    RelationView,
};
use crate::consts::{PTRACK_HDR_SIZE, PTRACK_MAGIC, PTRACK_SUFFIX};
use crate::error::BackupError;
use crate::util::write_file_atomic;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtrackBitmap {
    nblocks: u32,
    bits: Vec<u8>,
}

impl PtrackBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nblocks(&self) -> u32 {
        self.nblocks
    }

    pub fn set(&mut self, block: u32) {
        if block >= self.nblocks {
            self.nblocks = block + 1;
            self.bits.resize((self.nblocks as usize + 7) / 8, 0);
        }
        self.bits[(block / 8) as usize] |= 1 << (block % 8);
    }

    pub fn is_set(&self, block: u32) -> bool {
        block < self.nblocks && self.bits[(block / 8) as usize] & (1 << (block % 8)) != 0
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    pub fn set_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.nblocks).filter(move |b| self.is_set(*b))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PTRACK_HDR_SIZE + self.bits.len() + 4);
        buf.extend_from_slice(PTRACK_MAGIC);
        let mut n = [0u8; 4];
        LittleEndian::write_u32(&mut n, self.nblocks);
        buf.extend_from_slice(&n);
        buf.extend_from_slice(&self.bits);
        let mut h = Crc32::new();
        h.update(&buf);
        LittleEndian::write_u32(&mut n, h.finalize());
        buf.extend_from_slice(&n);
        buf
    }

    pub fn decode(path: &Path, bytes: &[u8]) -> Result<Self> {
        let bad = |reason: String| BackupError::corruption(path, None, reason);
        if bytes.len() < PTRACK_HDR_SIZE + 4 || &bytes[0..8] != PTRACK_MAGIC {
            return Err(bad("bad ptrack header".into()).into());
        }
        let nblocks = LittleEndian::read_u32(&bytes[8..12]);
        let nbytes = (nblocks as usize + 7) / 8;
        if bytes.len() != PTRACK_HDR_SIZE + nbytes + 4 {
            return Err(bad(format!("length {} does not match nblocks {}", bytes.len(), nblocks)).into());
        }
        let body = bytes.len() - 4;
        let mut h = Crc32::new();
        h.update(&bytes[..body]);
        if h.finalize() != LittleEndian::read_u32(&bytes[body..]) {
            return Err(bad("ptrack crc mismatch".into()).into());
        }
        Ok(Self {
            nblocks,
            bits: bytes[PTRACK_HDR_SIZE..body].to_vec(),
        })
    }
}

/// `<relation>_ptrack`
pub fn ptrack_path(relation_file: &Path) -> PathBuf {
    let mut s = relation_file.as_os_str().to_os_string();
    s.push(PTRACK_SUFFIX);
    PathBuf::from(s)
}

pub fn is_ptrack(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(PTRACK_SUFFIX))
        .unwrap_or(false)
}

pub fn read_ptrack(relation_file: &Path) -> Result<Option<PtrackBitmap>> {
    let path = ptrack_path(relation_file);
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    Ok(Some(PtrackBitmap::decode(&path, &bytes)?))
}

pub fn write_ptrack(relation_file: &Path, bm: &PtrackBitmap) -> Result<()> {
    write_file_atomic(&ptrack_path(relation_file), &bm.encode(), false)
}

/// Bitmap variant of the provider, backed by a frozen copy of the source bitmaps.
pub struct BitmapTracker {
    frozen: FrozenTracking,
}

impl BitmapTracker {
    pub fn new(frozen: FrozenTracking, reference: &ReferencePoint) -> Result<Self> {
        if !frozen.enabled {
            return Err(BackupError::ChangeTrackingUnavailable(
                "ptrack is disabled on the source instance".into(),
            )
            .into());
        }
        match frozen.reset_lsn {
            None => {
                return Err(BackupError::ChangeTrackingUnavailable(
                    "ptrack map has never been reset".into(),
                )
                .into())
            }
            Some(reset) if reset > reference.start_lsn => {
                return Err(BackupError::ChangeTrackingUnavailable(format!(
                    "ptrack map was reset at lsn {} after parent start lsn {}, take a full or page backup",
                    reset, reference.start_lsn
                ))
                .into())
            }
            Some(_) => {}
        }
        Ok(Self { frozen })
    }
}

impl ChangeTrackingProvider for BitmapTracker {
    fn kind(&self) -> ChangeTracking {
        ChangeTracking::Bitmap
    }

    fn compute_change_set(
        &self,
        rel: &RelationView<'_>,
        _reference: &ReferencePoint,
    ) -> Result<BlockChangeSet> {
        let nblocks = rel.nblocks();
        match self.frozen.bitmaps.get(rel.key) {
            Some(bm) => Ok(BlockChangeSet {
                blocks: bm
                    .set_blocks()
                    .map(u64::from)
                    .filter(|b| *b < nblocks)
                    .collect(),
            }),
            None => {
                // Нет карты, значит не знаем, что менялось: копируем всё.
                debug!("ptrack: no bitmap for {}, copying all {} block(s)", rel.key, nblocks);
                Ok(BlockChangeSet::full(nblocks))
            }
        }
    }
}
