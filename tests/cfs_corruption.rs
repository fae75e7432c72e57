// tests/cfs_corruption.rs
//
// Запуск только этого файла:
//   cargo test --test cfs_corruption -- --nocapture
//
// Повреждения источника перед FULL: бэкап обязан упасть, запись ERROR/CORRUPT
// сохраняется, новых OK-записей нет.
//
// Покрываем:
// 1) Удалён чанк, на который ссылается CFM (файл данных обрезан).
// 2) Удалён CFM / испорчен CFM / удалён файл данных (осиротевший CFM).
// 3) Удалена / испорчена / продублирована карта сжатия.
// 4) Испорчен случайный чанк (oorandom): ошибка называет файл и номер чанка.
// 5) fail_fast=false собирает все находки.
// 6) Плотная карта с дырой: FULL падает CORRUPT, чтение блока даёт ошибку, а не панику.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use cfsbackup::cfm::{cfm_path, chunk_checksum, read_cfm, write_cfm, ChunkDescriptor, CompressedFileMap};
use cfsbackup::codec::compress_chunk;
use cfsbackup::cmap::cmap_path;
use cfsbackup::{
    classify, run_backup, Algorithm, BackupCatalog, BackupConfig, BackupError, BackupRecord,
    BackupRequest, BackupStatus, BackupType, LocalInstance,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("cfstest-corrupt-{prefix}-{pid}-{t}-{id}"))
}

struct Fixture {
    inst: LocalInstance,
    catalog: BackupCatalog,
    ts: u32,
    ts_root: PathBuf,
}

/// Сжатое табличное пространство с двумя таблицами и успешным FULL.
fn setup(prefix: &str) -> Result<Fixture> {
    let root = unique_root(prefix);
    let inst = LocalInstance::init(&root.join("pgdata"), "main")?;
    let catalog = BackupCatalog::open(&root.join("catalog"))?;
    let ts = inst.create_tablespace("cfs_ts", Some((Algorithm::Zstd, 16384)))?;
    inst.append_blocks(ts.id, "16385", &rows(8, "a"))?;
    inst.append_blocks(ts.id, "16386", &rows(5, "b"))?;
    let first = full(&inst, &catalog, &BackupConfig::default())?;
    assert_eq!(first.status, BackupStatus::Ok);
    Ok(Fixture {
        ts_root: ts.root.clone(),
        ts: ts.id,
        inst,
        catalog,
    })
}

fn rows(n: usize, tag: &str) -> Vec<Vec<u8>> {
    (0..n)
        .map(|i| format!("{tag}: row {i};").repeat(40).into_bytes())
        .collect()
}

fn full(inst: &LocalInstance, catalog: &BackupCatalog, cfg: &BackupConfig) -> Result<BackupRecord> {
    run_backup(catalog, inst, &BackupRequest::new(BackupType::Full), cfg)
}

fn ok_count(catalog: &BackupCatalog) -> Result<usize> {
    Ok(catalog
        .list("main")?
        .iter()
        .filter(|r| r.status == BackupStatus::Ok)
        .count())
}

/// Бэкап должен упасть; возвращает ошибку и сохранённую запись.
fn expect_failure(f: &Fixture) -> Result<(anyhow::Error, BackupRecord)> {
    let oks = ok_count(&f.catalog)?;
    let err = full(&f.inst, &f.catalog, &BackupConfig::default())
        .err()
        .expect("backup must fail");
    let rec = f.catalog.list("main")?.pop().expect("failed record persisted");
    assert_ne!(rec.status, BackupStatus::Ok);
    assert_ne!(rec.status, BackupStatus::Running);
    assert!(rec.finished_at.is_some());
    assert!(rec.error.is_some());
    assert_eq!(ok_count(&f.catalog)?, oks, "no new OK record");
    Ok((err, rec))
}

fn flip_byte(path: &Path, off: u64) -> Result<()> {
    let mut bytes = fs::read(path)?;
    bytes[off as usize] ^= 0xFF;
    fs::write(path, bytes)?;
    Ok(())
}

#[test]
fn deleted_chunk_fails_with_corruption_naming_the_relation() -> Result<()> {
    let f = setup("chunk")?;
    let rel = f.inst.relation_path(f.ts, "16385");
    let map = read_cfm(&rel)?;
    let last = map.chunks.last().expect("chunks");
    // отрезаем последний чанк целиком
    let file = OpenOptions::new().write(true).open(&rel)?;
    file.set_len(last.physical_offset)?;
    drop(file);

    let (err, rec) = expect_failure(&f)?;
    match classify(&err) {
        Some(BackupError::Corruption { file, chunk, .. }) => {
            assert_eq!(file, &rel);
            assert_eq!(*chunk, Some(map.chunks.len() - 1));
        }
        other => panic!("unexpected classification {:?}: {:#}", other, err),
    }
    assert_eq!(rec.status, BackupStatus::Corrupt);
    assert!(rec.error.as_deref().unwrap_or("").contains("16385"));
    Ok(())
}

#[test]
fn removed_cfm_fails() -> Result<()> {
    let f = setup("nocfm")?;
    fs::remove_file(cfm_path(&f.inst.relation_path(f.ts, "16386")))?;

    let (err, rec) = expect_failure(&f)?;
    assert!(classify(&err).map(|e| e.is_corruption()).unwrap_or(false));
    assert!(format!("{:#}", err).contains("no CFM sidecar"));
    assert_eq!(rec.status, BackupStatus::Corrupt);
    Ok(())
}

#[test]
fn damaged_cfm_is_malformed() -> Result<()> {
    let f = setup("badcfm")?;
    let cfm = cfm_path(&f.inst.relation_path(f.ts, "16385"));
    // запись первого чанка, поле logical_offset
    flip_byte(&cfm, 32 + 2)?;

    let (err, rec) = expect_failure(&f)?;
    assert!(matches!(classify(&err), Some(BackupError::MalformedCfm { .. })));
    assert_eq!(rec.status, BackupStatus::Corrupt);
    Ok(())
}

#[test]
fn orphan_cfm_fails() -> Result<()> {
    let f = setup("orphan")?;
    fs::remove_file(f.inst.relation_path(f.ts, "16386"))?;

    let (err, _rec) = expect_failure(&f)?;
    assert!(format!("{:#}", err).contains("has no data file"));
    Ok(())
}

#[test]
fn removed_compression_map_is_missing_metadata() -> Result<()> {
    let f = setup("nomap")?;
    fs::remove_file(cmap_path(&f.ts_root))?;

    let (err, rec) = expect_failure(&f)?;
    assert!(matches!(
        classify(&err),
        Some(BackupError::MissingMetadata { .. })
    ));
    assert_eq!(rec.status, BackupStatus::Error);
    assert!(rec.error.as_deref().unwrap_or("").contains("pg_compression"));
    Ok(())
}

#[test]
fn damaged_compression_map_is_corruption() -> Result<()> {
    let f = setup("badmap")?;
    flip_byte(&cmap_path(&f.ts_root), 13)?;

    let (err, rec) = expect_failure(&f)?;
    assert!(classify(&err).map(|e| e.is_corruption()).unwrap_or(false));
    assert_eq!(rec.status, BackupStatus::Corrupt);
    Ok(())
}

#[test]
fn nested_compression_map_is_corruption() -> Result<()> {
    let f = setup("nested")?;
    let nested = f.ts_root.join("sub");
    fs::create_dir_all(&nested)?;
    fs::copy(cmap_path(&f.ts_root), nested.join("pg_compression"))?;

    let (err, rec) = expect_failure(&f)?;
    assert!(format!("{:#}", err).contains("second compression map"));
    assert_eq!(rec.status, BackupStatus::Corrupt);
    Ok(())
}

#[test]
fn random_chunk_corruption_names_the_chunk() -> Result<()> {
    let f = setup("random")?;
    let mut rng = oorandom::Rand32::new(0xC0FFEE);
    let rel = f.inst.relation_path(f.ts, "16385");
    let map = read_cfm(&rel)?;
    let victim = rng.rand_range(0..map.chunks.len() as u32) as usize;
    let c = map.chunks[victim];
    let off = c.physical_offset + rng.rand_range(0..c.compressed_length) as u64;
    flip_byte(&rel, off)?;

    let (err, rec) = expect_failure(&f)?;
    match classify(&err) {
        Some(BackupError::Corruption { chunk, .. }) => assert_eq!(*chunk, Some(victim)),
        other => panic!("unexpected classification {:?}: {:#}", other, err),
    }
    assert!(format!("{:#}", err).contains(&format!("chunk {}", victim)));
    assert_eq!(rec.status, BackupStatus::Corrupt);
    Ok(())
}

#[test]
fn keep_going_collects_every_finding() -> Result<()> {
    let f = setup("keepgoing")?;
    for rel in ["16385", "16386"] {
        let p = f.inst.relation_path(f.ts, rel);
        let map = read_cfm(&p)?;
        flip_byte(&p, map.chunks[0].physical_offset + 1)?;
    }

    let cfg = BackupConfig::default().with_fail_fast(false).with_workers(2);
    let err = full(&f.inst, &f.catalog, &cfg).err().expect("backup must fail");
    assert!(format!("{:#}", err).contains("2 detector finding(s)"), "{:#}", err);
    let rec = f.catalog.list("main")?.pop().expect("record");
    assert_eq!(rec.status, BackupStatus::Corrupt);

    // с fail_fast находка одна
    let err = full(&f.inst, &f.catalog, &BackupConfig::default().with_workers(1))
        .err()
        .expect("backup must fail");
    assert!(!format!("{:#}", err).contains("detector finding(s)"));
    Ok(())
}

#[test]
fn appended_garbage_in_cfm_is_malformed() -> Result<()> {
    let f = setup("garbage")?;
    let cfm = cfm_path(&f.inst.relation_path(f.ts, "16386"));
    let mut file = OpenOptions::new().append(true).open(&cfm)?;
    file.write_all(b"junk")?;
    drop(file);

    let (err, _rec) = expect_failure(&f)?;
    assert!(matches!(classify(&err), Some(BackupError::MalformedCfm { .. })));
    Ok(())
}

#[test]
fn dense_map_with_a_hole_is_corruption() -> Result<()> {
    let f = setup("hole")?;
    let rel = f.inst.relation_path(f.ts, "16385");

    // чанк 0 на 8192 байта, чанк 1 на 16384 байта с 16384: [8192, 16384) не покрыт,
    // а конец второго (32768) за logical_size
    let mut map = CompressedFileMap::new(&rel, 16384);
    let mut data = Vec::new();
    for (logical_offset, len) in [(0u64, 8192usize), (16384, 16384)] {
        let stored = compress_chunk(Algorithm::Zstd, &vec![0x11; len])?;
        map.chunks.push(ChunkDescriptor {
            logical_offset,
            physical_offset: data.len() as u64,
            compressed_length: stored.len() as u32,
            uncompressed_length: len as u32,
            checksum: chunk_checksum(&stored),
        });
        data.extend_from_slice(&stored);
    }
    map.logical_size = 24576;
    fs::write(&rel, &data)?;
    write_cfm(&map)?;

    let (err, rec) = expect_failure(&f)?;
    assert!(classify(&err).map(|e| e.is_corruption()).unwrap_or(false), "{:#}", err);
    assert_eq!(rec.status, BackupStatus::Corrupt);

    let err = f.inst.read_block(f.ts, "16385", 0).unwrap_err();
    assert!(matches!(classify(&err), Some(BackupError::Corruption { .. })), "{:#}", err);
    Ok(())
}
