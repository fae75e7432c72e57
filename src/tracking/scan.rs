//! tracking/scan (PAGE): сравнение встроенного LSN каждого блока с точкой отсчёта.
//!
//! Всегда доступен, но стоит полного чтения (и распаковки) каждого чанка.
//! Блок изменён, если block_lsn > parent.start_lsn.

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};

use super::{BlockChangeSet, ChangeTracking, ChangeTrackingProvider, ReferencePoint, RelationView};
use crate::cfm::validate_chunk;
use crate::consts::{BLOCK_LSN_LEN, BLOCK_LSN_OFF, BLOCK_SIZE};

#[derive(Debug, Default)]
pub struct ScanTracker;

impl ScanTracker {
    pub fn new() -> Self {
        ScanTracker
    }
}

/// LSN embedded in a block image (None for a short tail).
pub fn block_lsn(block: &[u8]) -> Option<u64> {
    if block.len() < BLOCK_LSN_OFF + BLOCK_LSN_LEN {
        return None;
    }
    Some(LittleEndian::read_u64(
        &block[BLOCK_LSN_OFF..BLOCK_LSN_OFF + BLOCK_LSN_LEN],
    ))
}

impl ChangeTrackingProvider for ScanTracker {
    fn kind(&self) -> ChangeTracking {
        ChangeTracking::Scan
    }

    fn compute_change_set(
        &self,
        rel: &RelationView<'_>,
        reference: &ReferencePoint,
    ) -> Result<BlockChangeSet> {
        let mut set = BlockChangeSet::default();
        for (i, c) in rel.map.chunks.iter().enumerate() {
            // validate_chunk даёт распакованные байты и заодно проверяет CRC/длину
            let raw = validate_chunk(rel.map, i, rel.algorithm, rel.data)?;
            let first_block = c.logical_offset / BLOCK_SIZE as u64;
            for (j, block) in raw.chunks(BLOCK_SIZE).enumerate() {
                match block_lsn(block) {
                    Some(lsn) if lsn > reference.start_lsn => {
                        set.blocks.insert(first_block + j as u64);
                    }
                    Some(_) => {}
                    // хвост короче заголовка, считаем изменённым
                    None => {
                        set.blocks.insert(first_block + j as u64);
                    }
                }
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfm::{chunk_checksum, ChunkDescriptor, CompressedFileMap};
    use crate::codec::{compress_chunk, Algorithm};
    use std::path::Path;

    fn block_with_lsn(lsn: u64) -> Vec<u8> {
        let mut b = vec![0xEEu8; BLOCK_SIZE];
        LittleEndian::write_u64(&mut b[0..8], lsn);
        b
    }

    #[test]
    fn only_blocks_past_reference_are_changed() {
        // два блока на чанк: lsn 10, 20 | 30, 5
        let lsns = [10u64, 20, 30, 5];
        let mut map = CompressedFileMap::new(Path::new("/ts/1"), (BLOCK_SIZE * 2) as u32);
        let mut data = Vec::new();
        for (ci, pair) in lsns.chunks(2).enumerate() {
            let mut raw = block_with_lsn(pair[0]);
            raw.extend_from_slice(&block_with_lsn(pair[1]));
            let stored = compress_chunk(Algorithm::Zstd, &raw).unwrap();
            map.chunks.push(ChunkDescriptor {
                logical_offset: (ci * BLOCK_SIZE * 2) as u64,
                physical_offset: data.len() as u64,
                compressed_length: stored.len() as u32,
                uncompressed_length: raw.len() as u32,
                checksum: chunk_checksum(&stored),
            });
            data.extend_from_slice(&stored);
        }
        map.logical_size = (BLOCK_SIZE * 4) as u64;

        let view = RelationView {
            key: "1/1",
            path: Path::new("/ts/1"),
            map: &map,
            data: &data,
            algorithm: Algorithm::Zstd,
        };
        let reference = ReferencePoint { start_lsn: 15, stop_lsn: 16 };
        let set = ScanTracker::new().compute_change_set(&view, &reference).unwrap();
        assert_eq!(set.blocks.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }
}
