//! cfm: Compressed File Map, the sidecar `<relation>.cfm` describing chunk layout.
//!
//! Формат (LE):
//!   [magic8="CFSCFM01"][version u32=1][flags u32][chunk_size u32][logical_size u64][chunk_count u32]
//!   chunk_count × [logical_offset u64][physical_offset u64][compressed_len u32][uncompressed_len u32][checksum u32]
//!   [crc32 u32]  crc32fast по всем предыдущим байтам
//!
//! Инварианты:
//! - logical_offset строго возрастают и кратны chunk_size;
//! - checksum = CRC32C по сжатым байтам чанка в файле данных (physical_offset, compressed_len);
//! - "плотная" карта (без FLAG_SPARSE) покрывает [0, logical_size) без дыр: logical_offset
//!   каждого чанка равен сумме длин предыдущих, все чанки кроме последнего ровно chunk_size;
//! - "разреженная" карта (инкрементальный бэкап) перечисляет только скопированные чанки,
//!   но каждый из них обязан лежать внутри logical_size.

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::codec::{decompress_chunk, Algorithm};
use crate::consts::{
    CFM_EXT, CFM_FLAG_SPARSE, CFM_HDR_SIZE, CFM_MAGIC, CFM_REC_SIZE, CFM_TRAILER_SIZE, CFM_VERSION,
};
use crate::error::BackupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub logical_offset: u64,
    pub physical_offset: u64,
    pub compressed_length: u32,
    pub uncompressed_length: u32,
    pub checksum: u32,
}

impl ChunkDescriptor {
    /// None, если смещение из карты переполняет u64.
    pub fn physical_end(&self) -> Option<u64> {
        self.physical_offset.checked_add(self.compressed_length as u64)
    }

    pub fn logical_end(&self) -> u64 {
        self.logical_offset.saturating_add(self.uncompressed_length as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedFileMap {
    pub relation_file_path: PathBuf,
    pub chunk_size: u32,
    pub logical_size: u64,
    pub sparse: bool,
    pub chunks: Vec<ChunkDescriptor>,
}

impl CompressedFileMap {
    pub fn new(relation_file_path: &Path, chunk_size: u32) -> Self {
        Self {
            relation_file_path: relation_file_path.to_path_buf(),
            chunk_size,
            logical_size: 0,
            sparse: false,
            chunks: Vec::new(),
        }
    }

    /// Sum of stored (compressed) bytes over all chunks.
    pub fn compressed_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.compressed_length as u64).sum()
    }
}

/// `<relation>.cfm`
pub fn cfm_path(relation_file: &Path) -> PathBuf {
    let mut s = relation_file.as_os_str().to_os_string();
    s.push(".");
    s.push(CFM_EXT);
    PathBuf::from(s)
}

/// Data file for a `.cfm` sidecar (None if the name has no `.cfm` suffix).
pub fn data_path_for(cfm: &Path) -> Option<PathBuf> {
    let name = cfm.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{}", CFM_EXT))?;
    Some(cfm.with_file_name(stem))
}

pub fn is_cfm(path: &Path) -> bool {
    path.extension().map(|e| e == CFM_EXT).unwrap_or(false)
}

pub fn encode_cfm(m: &CompressedFileMap) -> Vec<u8> {
    let n = m.chunks.len();
    let mut buf = vec![0u8; CFM_HDR_SIZE + n * CFM_REC_SIZE + CFM_TRAILER_SIZE];
    buf[0..8].copy_from_slice(CFM_MAGIC);
    LittleEndian::write_u32(&mut buf[8..12], CFM_VERSION);
    LittleEndian::write_u32(&mut buf[12..16], if m.sparse { CFM_FLAG_SPARSE } else { 0 });
    LittleEndian::write_u32(&mut buf[16..20], m.chunk_size);
    LittleEndian::write_u64(&mut buf[20..28], m.logical_size);
    LittleEndian::write_u32(&mut buf[28..32], n as u32);

    let mut off = CFM_HDR_SIZE;
    for c in &m.chunks {
        let r = &mut buf[off..off + CFM_REC_SIZE];
        LittleEndian::write_u64(&mut r[0..8], c.logical_offset);
        LittleEndian::write_u64(&mut r[8..16], c.physical_offset);
        LittleEndian::write_u32(&mut r[16..20], c.compressed_length);
        LittleEndian::write_u32(&mut r[20..24], c.uncompressed_length);
        LittleEndian::write_u32(&mut r[24..28], c.checksum);
        off += CFM_REC_SIZE;
    }

    let mut h = Crc32::new();
    h.update(&buf[..off]);
    LittleEndian::write_u32(&mut buf[off..off + CFM_TRAILER_SIZE], h.finalize());
    buf
}

/// Разбор байтов CFM. relation_file: путь файла данных, к которому относится карта.
pub fn decode_cfm(relation_file: &Path, bytes: &[u8]) -> Result<CompressedFileMap> {
    let cfm = cfm_path(relation_file);
    let bad = |reason: String| BackupError::malformed_cfm(&cfm, reason);

    if bytes.len() < CFM_HDR_SIZE + CFM_TRAILER_SIZE {
        return Err(bad(format!("too short ({} bytes)", bytes.len())).into());
    }
    if &bytes[0..8] != CFM_MAGIC {
        return Err(bad("bad magic".into()).into());
    }
    let body_len = bytes.len() - CFM_TRAILER_SIZE;
    let mut h = Crc32::new();
    h.update(&bytes[..body_len]);
    let crc_actual = h.finalize();
    let crc_expected = LittleEndian::read_u32(&bytes[body_len..]);
    if crc_actual != crc_expected {
        return Err(bad(format!(
            "crc mismatch (stored {:08x}, actual {:08x})",
            crc_expected, crc_actual
        ))
        .into());
    }

    let version = LittleEndian::read_u32(&bytes[8..12]);
    if version != CFM_VERSION {
        return Err(bad(format!("unsupported version {}", version)).into());
    }
    let flags = LittleEndian::read_u32(&bytes[12..16]);
    let chunk_size = LittleEndian::read_u32(&bytes[16..20]);
    let logical_size = LittleEndian::read_u64(&bytes[20..28]);
    let count = LittleEndian::read_u32(&bytes[28..32]) as usize;

    if body_len != CFM_HDR_SIZE + count * CFM_REC_SIZE {
        return Err(bad(format!(
            "chunk_count {} does not match length {}",
            count,
            bytes.len()
        ))
        .into());
    }
    if chunk_size == 0 {
        return Err(bad("chunk_size is zero".into()).into());
    }

    let mut chunks = Vec::with_capacity(count);
    let mut off = CFM_HDR_SIZE;
    let mut prev: Option<u64> = None;
    for i in 0..count {
        let r = &bytes[off..off + CFM_REC_SIZE];
        let c = ChunkDescriptor {
            logical_offset: LittleEndian::read_u64(&r[0..8]),
            physical_offset: LittleEndian::read_u64(&r[8..16]),
            compressed_length: LittleEndian::read_u32(&r[16..20]),
            uncompressed_length: LittleEndian::read_u32(&r[20..24]),
            checksum: LittleEndian::read_u32(&r[24..28]),
        };
        if c.logical_offset % chunk_size as u64 != 0 {
            return Err(bad(format!("chunk {} logical offset {} misaligned", i, c.logical_offset)).into());
        }
        if let Some(p) = prev {
            if c.logical_offset <= p {
                return Err(bad(format!("chunk {} out of order", i)).into());
            }
        }
        if c.uncompressed_length == 0 || c.uncompressed_length > chunk_size {
            return Err(bad(format!(
                "chunk {} uncompressed length {} outside (0, {}]",
                i, c.uncompressed_length, chunk_size
            ))
            .into());
        }
        prev = Some(c.logical_offset);
        chunks.push(c);
        off += CFM_REC_SIZE;
    }

    Ok(CompressedFileMap {
        relation_file_path: relation_file.to_path_buf(),
        chunk_size,
        logical_size,
        sparse: flags & CFM_FLAG_SPARSE != 0,
        chunks,
    })
}

/// Прочитать CFM для файла данных relation_file.
pub fn read_cfm(relation_file: &Path) -> Result<CompressedFileMap> {
    let path = cfm_path(relation_file);
    if !path.is_file() {
        return Err(BackupError::missing("CFM", &path).into());
    }
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    decode_cfm(relation_file, &bytes)
}

/// Записать CFM рядом с файлом данных (tmp+rename).
pub fn write_cfm(m: &CompressedFileMap) -> Result<()> {
    let path = cfm_path(&m.relation_file_path);
    let tmp = path.with_extension("cfm.tmp");
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("open {}", tmp.display()))?;
        f.write_all(&encode_cfm(m))?;
        f.sync_all()?;
    }
    fs::rename(&tmp, &path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Checksum of stored chunk bytes.
#[inline]
pub fn chunk_checksum(stored: &[u8]) -> u32 {
    crc32c::crc32c(stored)
}

/// Проверить один чанк по байтам файла данных; возвращает распакованные данные.
pub fn validate_chunk(
    map: &CompressedFileMap,
    index: usize,
    algorithm: Algorithm,
    data: &[u8],
) -> Result<Vec<u8>> {
    let file = &map.relation_file_path;
    let c = &map.chunks[index];

    let stored = match c.physical_end() {
        Some(end) if end <= data.len() as u64 => &data[c.physical_offset as usize..end as usize],
        _ => {
            return Err(BackupError::corruption(
                file,
                Some(index),
                format!(
                    "truncated: needs {} bytes at {}, data file has {}",
                    c.compressed_length,
                    c.physical_offset,
                    data.len()
                ),
            )
            .into());
        }
    };
    let actual = chunk_checksum(stored);
    if actual != c.checksum {
        return Err(BackupError::corruption(
            file,
            Some(index),
            format!("checksum mismatch (stored {:08x}, actual {:08x})", c.checksum, actual),
        )
        .into());
    }
    decompress_chunk(algorithm, stored, c.uncompressed_length as usize).map_err(|e| {
        BackupError::corruption(file, Some(index), format!("length check failed: {}", e)).into()
    })
}

/// Полная проверка карты против байтов файла данных.
pub fn validate(map: &CompressedFileMap, algorithm: Algorithm, data: &[u8]) -> Result<()> {
    let file = &map.relation_file_path;

    if map.sparse {
        if let Some((i, c)) = map
            .chunks
            .iter()
            .enumerate()
            .find(|(_, c)| c.logical_end() > map.logical_size)
        {
            return Err(BackupError::corruption(
                file,
                Some(i),
                format!("chunk ends at {} past logical size {}", c.logical_end(), map.logical_size),
            )
            .into());
        }
    } else {
        let last = map.chunks.len().saturating_sub(1);
        let mut total: u64 = 0;
        for (i, c) in map.chunks.iter().enumerate() {
            if c.logical_offset != total {
                return Err(BackupError::corruption(
                    file,
                    Some(i),
                    format!("chunk starts at {}, previous chunks end at {}", c.logical_offset, total),
                )
                .into());
            }
            if i != last && c.uncompressed_length != map.chunk_size {
                return Err(BackupError::corruption(
                    file,
                    Some(i),
                    format!(
                        "inner chunk holds {} bytes, chunk size is {}",
                        c.uncompressed_length, map.chunk_size
                    ),
                )
                .into());
            }
            total = c.logical_end();
        }
        if total != map.logical_size {
            return Err(BackupError::corruption(
                file,
                None,
                format!("chunks cover {} bytes, logical size is {}", total, map.logical_size),
            )
            .into());
        }
    }

    for i in 0..map.chunks.len() {
        validate_chunk(map, i, algorithm, data)?;
    }
    Ok(())
}
