// src/cmap.rs: карта сжатия табличного пространства (pg_compression)
//
// Формат <tablespace_root>/pg_compression (LE):
// MAGIC8 = "CFSCMAP1"
// u32 format_version  = 1
// u32 tablespace_id
// u16 algorithm       (1=zstd, 2=zlib)
// u32 chunk_size      (кратен BLOCK_SIZE, <= 1 MiB)
// u32 crc32           (crc32fast по всем предыдущим байтам)
//
// Политика:
// - Наличие файла само по себе означает, что табличное пространство сжато.
// - Файл должен быть ровно один на корень табличного пространства (вложенная
//   копия где-то ниже по дереву считается повреждением).
// - Бэкап только читает карту; write_compression_map нужен движку и тестам.

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::codec::Algorithm;
use crate::consts::{BLOCK_SIZE, CMAP_FILE, CMAP_FORMAT_VERSION, CMAP_MAGIC, CMAP_SIZE, MAX_CHUNK_SIZE};
use crate::error::BackupError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablespaceCompressionMap {
    pub tablespace_id: u32,
    pub algorithm: Algorithm,
    pub chunk_size: u32,
    pub format_version: u32,
}

impl TablespaceCompressionMap {
    pub fn new(tablespace_id: u32, algorithm: Algorithm, chunk_size: u32) -> Self {
        Self {
            tablespace_id,
            algorithm,
            chunk_size,
            format_version: CMAP_FORMAT_VERSION,
        }
    }

    /// Blocks covered by one chunk.
    pub fn blocks_per_chunk(&self) -> u64 {
        (self.chunk_size as u64 / BLOCK_SIZE as u64).max(1)
    }
}

#[inline]
pub fn cmap_path(tablespace_root: &Path) -> PathBuf {
    tablespace_root.join(CMAP_FILE)
}

pub fn validate_chunk_size(chunk_size: u32) -> std::result::Result<(), String> {
    if chunk_size == 0
        || chunk_size > MAX_CHUNK_SIZE
        || chunk_size as usize % BLOCK_SIZE != 0
    {
        return Err(format!(
            "chunk_size must be a multiple of {} in [{} .. {}], got {}",
            BLOCK_SIZE, BLOCK_SIZE, MAX_CHUNK_SIZE, chunk_size
        ));
    }
    Ok(())
}

pub fn encode_compression_map(m: &TablespaceCompressionMap) -> Vec<u8> {
    let mut buf = vec![0u8; CMAP_SIZE];
    buf[0..8].copy_from_slice(CMAP_MAGIC);
    LittleEndian::write_u32(&mut buf[8..12], m.format_version);
    LittleEndian::write_u32(&mut buf[12..16], m.tablespace_id);
    LittleEndian::write_u16(&mut buf[16..18], m.algorithm.code());
    LittleEndian::write_u32(&mut buf[18..22], m.chunk_size);
    let mut h = Crc32::new();
    h.update(&buf[0..22]);
    LittleEndian::write_u32(&mut buf[22..26], h.finalize());
    buf
}

/// Разобрать байты карты. `path` нужен только для сообщений об ошибках.
pub fn decode_compression_map(path: &Path, bytes: &[u8]) -> Result<TablespaceCompressionMap> {
    let bad = |reason: String| BackupError::corruption(path, None, reason);

    if bytes.len() != CMAP_SIZE {
        return Err(bad(format!("size {} != {}", bytes.len(), CMAP_SIZE)).into());
    }
    if &bytes[0..8] != CMAP_MAGIC {
        return Err(bad("bad compression map magic".into()).into());
    }
    let mut h = Crc32::new();
    h.update(&bytes[0..22]);
    let crc_actual = h.finalize();
    let crc_expected = LittleEndian::read_u32(&bytes[22..26]);
    if crc_actual != crc_expected {
        return Err(bad(format!(
            "crc mismatch (stored {:08x}, actual {:08x})",
            crc_expected, crc_actual
        ))
        .into());
    }

    let format_version = LittleEndian::read_u32(&bytes[8..12]);
    if format_version != CMAP_FORMAT_VERSION {
        return Err(bad(format!("unsupported format_version {}", format_version)).into());
    }
    let tablespace_id = LittleEndian::read_u32(&bytes[12..16]);
    let algo_code = LittleEndian::read_u16(&bytes[16..18]);
    let algorithm = Algorithm::from_code(algo_code)
        .ok_or_else(|| bad(format!("unknown algorithm code {}", algo_code)))?;
    let chunk_size = LittleEndian::read_u32(&bytes[18..22]);
    validate_chunk_size(chunk_size).map_err(bad)?;

    Ok(TablespaceCompressionMap {
        tablespace_id,
        algorithm,
        chunk_size,
        format_version,
    })
}

/// Прочитать pg_compression из корня табличного пространства.
pub fn read_compression_map(tablespace_root: &Path) -> Result<TablespaceCompressionMap> {
    let path = cmap_path(tablespace_root);
    if !path.is_file() {
        return Err(BackupError::missing("compression map", &path).into());
    }
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let map = decode_compression_map(&path, &bytes)?;

    if let Some(dup) = find_nested_map(tablespace_root)? {
        return Err(BackupError::corruption(
            &dup,
            None,
            format!("second compression map under {}", tablespace_root.display()),
        )
        .into());
    }
    Ok(map)
}

/// Записать карту через tmp+rename (сторона движка).
pub fn write_compression_map(tablespace_root: &Path, m: &TablespaceCompressionMap) -> Result<()> {
    validate_chunk_size(m.chunk_size).map_err(anyhow::Error::msg)?;
    let path = cmap_path(tablespace_root);
    let tmp = tablespace_root.join(format!("{}.tmp", CMAP_FILE));
    let _ = fs::remove_file(&tmp);
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("open {}", tmp.display()))?;
        f.write_all(&encode_compression_map(m))?;
        f.sync_all()?;
    }
    fs::rename(&tmp, &path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

// Поиск второй карты во вложенных каталогах (корневая не считается).
fn find_nested_map(root: &Path) -> Result<Option<PathBuf>> {
    let mut stack: Vec<PathBuf> = Vec::new();
    for e in fs::read_dir(root).with_context(|| format!("read_dir {}", root.display()))? {
        let p = e?.path();
        if p.is_dir() {
            stack.push(p);
        }
    }
    while let Some(dir) = stack.pop() {
        for e in fs::read_dir(&dir).with_context(|| format!("read_dir {}", dir.display()))? {
            let p = e?.path();
            if p.is_dir() {
                stack.push(p);
            } else if p.file_name().map(|n| n == CMAP_FILE).unwrap_or(false) {
                return Ok(Some(p));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    fn tmp_root(tag: &str) -> PathBuf {
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let root = std::env::temp_dir().join(format!("cfs-cmap-{tag}-{}-{t}", std::process::id()));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn write_then_read() {
        let root = tmp_root("rw");
        let m = TablespaceCompressionMap::new(16390, Algorithm::Zlib, 16384);
        write_compression_map(&root, &m).unwrap();
        let got = read_compression_map(&root).unwrap();
        assert_eq!(got, m);
        assert_eq!(got.blocks_per_chunk(), 2);
    }

    #[test]
    fn absent_map_is_missing_metadata() {
        let root = tmp_root("absent");
        let err = read_compression_map(&root).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(BackupError::MissingMetadata { .. })
        ));
    }

    #[test]
    fn flipped_byte_is_corruption() {
        let root = tmp_root("flip");
        write_compression_map(&root, &TablespaceCompressionMap::new(1, Algorithm::Zstd, 8192)).unwrap();
        let p = cmap_path(&root);
        let mut bytes = fs::read(&p).unwrap();
        bytes[13] ^= 0xFF;
        fs::write(&p, &bytes).unwrap();
        let err = read_compression_map(&root).unwrap_err();
        assert!(classify(&err).map(|e| e.is_corruption()).unwrap_or(false));
    }

    #[test]
    fn nested_duplicate_is_rejected() {
        let root = tmp_root("dup");
        let m = TablespaceCompressionMap::new(1, Algorithm::Zstd, 8192);
        write_compression_map(&root, &m).unwrap();
        let nested = root.join("sub");
        fs::create_dir_all(&nested).unwrap();
        write_compression_map(&nested, &m).unwrap();
        assert!(read_compression_map(&root).is_err());
    }

    #[test]
    fn chunk_size_bounds() {
        assert!(validate_chunk_size(8192).is_ok());
        assert!(validate_chunk_size(MAX_CHUNK_SIZE).is_ok());
        assert!(validate_chunk_size(0).is_err());
        assert!(validate_chunk_size(4096).is_err());
        assert!(validate_chunk_size(MAX_CHUNK_SIZE * 2).is_err());
    }
}
