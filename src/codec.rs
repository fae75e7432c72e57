//! codec: сжатие/распаковка отдельных чанков CFS.
//!
//! Алгоритм задаётся картой сжатия табличного пространства (pg_compression):
//! - 1 = zstd (zstd::bulk, уровень по умолчанию);
//! - 2 = zlib (flate2).
//!
//! Распаковка всегда ограничена ожидаемой длиной чанка: лишние или недостающие
//! байты означают повреждение, а не "best effort".

use anyhow::{anyhow, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::fmt;
use std::io::{Read, Write};

pub const ALGO_ZSTD: u16 = 1;
pub const ALGO_ZLIB: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Zstd,
    Zlib,
}

impl Algorithm {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            ALGO_ZSTD => Some(Algorithm::Zstd),
            ALGO_ZLIB => Some(Algorithm::Zlib),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Algorithm::Zstd => ALGO_ZSTD,
            Algorithm::Zlib => ALGO_ZLIB,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Zstd => write!(f, "zstd"),
            Algorithm::Zlib => write!(f, "zlib"),
        }
    }
}

pub fn compress_chunk(algo: Algorithm, raw: &[u8]) -> Result<Vec<u8>> {
    match algo {
        Algorithm::Zstd => Ok(zstd::bulk::compress(raw, 0)?),
        Algorithm::Zlib => {
            let mut enc = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(raw)?;
            Ok(enc.finish()?)
        }
    }
}

/// Распаковать чанк, ожидая ровно `expected_len` байт.
pub fn decompress_chunk(algo: Algorithm, stored: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let out = match algo {
        // bulk::decompress отказывает, если результат больше capacity
        Algorithm::Zstd => zstd::bulk::decompress(stored, expected_len)
            .map_err(|e| anyhow!("zstd decode: {}", e))?,
        Algorithm::Zlib => {
            let mut out = Vec::with_capacity(expected_len);
            // +1 чтобы заметить "лишний" хвост
            ZlibDecoder::new(stored)
                .take(expected_len as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|e| anyhow!("zlib decode: {}", e))?;
            out
        }
    };
    if out.len() != expected_len {
        return Err(anyhow!(
            "decoded length {} != expected {}",
            out.len(),
            expected_len
        ));
    }
    Ok(out)
}
