//! Общие константы форматов (compression map, CFM, ptrack, backup tree, instance).

// -------- Blocks --------
/// Logical block size of a relation file (one page).
pub const BLOCK_SIZE: usize = 8192;
/// Offset/length of the embedded block LSN (first 8 bytes of every block, LE u64).
pub const BLOCK_LSN_OFF: usize = 0;
pub const BLOCK_LSN_LEN: usize = 8;

// -------- Compression map (one per compressed tablespace root) --------
pub const CMAP_FILE: &str = "pg_compression";
pub const CMAP_MAGIC: &[u8; 8] = b"CFSCMAP1";
pub const CMAP_FORMAT_VERSION: u32 = 1;
// [magic8][format_version u32][tablespace_id u32][algorithm u16][chunk_size u32][crc32 u32]
pub const CMAP_SIZE: usize = 8 + 4 + 4 + 2 + 4 + 4;
pub const MAX_CHUNK_SIZE: u32 = 1 << 20;

// -------- CFM sidecar --------
pub const CFM_EXT: &str = "cfm";
pub const CFM_MAGIC: &[u8; 8] = b"CFSCFM01";
pub const CFM_VERSION: u32 = 1;
// [magic8][version u32][flags u32][chunk_size u32][logical_size u64][chunk_count u32]
pub const CFM_HDR_SIZE: usize = 8 + 4 + 4 + 4 + 8 + 4;
// [logical_offset u64][physical_offset u64][compressed_len u32][uncompressed_len u32][checksum u32]
pub const CFM_REC_SIZE: usize = 8 + 8 + 4 + 4 + 4;
pub const CFM_TRAILER_SIZE: usize = 4;
/// Map lists only a subset of chunks (incremental backup copy).
pub const CFM_FLAG_SPARSE: u32 = 0x1;

// -------- Ptrack bitmap sidecar --------
pub const PTRACK_SUFFIX: &str = "_ptrack";
pub const PTRACK_MAGIC: &[u8; 8] = b"CFSPTRK1";
// [magic8][nblocks u32] + bitmap + [crc32 u32]
pub const PTRACK_HDR_SIZE: usize = 8 + 4;

// -------- Source instance --------
pub const INSTANCE_FILE: &str = "instance.json";
pub const INSTANCE_LOCK_FILE: &str = "instance.lock";
pub const TABLESPACES_DIR: &str = "tablespaces";

// -------- Backup catalog --------
pub const BACKUPS_DIR: &str = "backups";
pub const LEASE_FILE: &str = "LOCK";
pub const RECORD_FILE: &str = "backup.json";
pub const CONTENT_FILE: &str = "files.json";
