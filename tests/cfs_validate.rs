// tests/cfs_validate.rs
//
// Запуск только этого файла:
//   cargo test --test cfs_validate -- --nocapture
//
// Validator работает только по дереву бэкапа, источник не нужен.
// Покрываем:
// 1) Чистый бэкап проходит, запись каталога не меняется.
// 2) Испорченный после записи CFM / чанк / удалённая карта сжатия → ошибка, статус остаётся OK.
// 3) Лишний файл в дереве бэкапа.
// 4) Цепочка: пропавший родитель → NotFound.
// 5) validate_instance: пропуск не-OK, сбор ошибок.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use cfsbackup::catalog::tablespace_dir;
use cfsbackup::cfm::{cfm_path, read_cfm};
use cfsbackup::cmap::cmap_path;
use cfsbackup::{
    classify, run_backup, validate_backup, validate_instance, Algorithm, BackupCatalog,
    BackupConfig, BackupError, BackupRecord, BackupRequest, BackupStatus, BackupType,
    LocalInstance,
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
    base.join(format!("cfstest-validate-{prefix}-{pid}-{t}-{id}"))
}

fn rows(n: usize, tag: &str) -> Vec<Vec<u8>> {
    (0..n)
        .map(|i| format!("{tag}: row {i};").repeat(48).into_bytes())
        .collect()
}

fn setup(prefix: &str) -> Result<(LocalInstance, BackupCatalog, u32)> {
    let root = unique_root(prefix);
    let inst = LocalInstance::init(&root.join("pgdata"), "main")?;
    let catalog = BackupCatalog::open(&root.join("catalog"))?;
    let ts = inst.create_tablespace("cfs_ts", Some((Algorithm::Zstd, 16384)))?;
    inst.append_blocks(ts.id, "16385", &rows(9, "v"))?;
    Ok((inst, catalog, ts.id))
}

fn backup(inst: &LocalInstance, catalog: &BackupCatalog, t: BackupType) -> Result<BackupRecord> {
    run_backup(catalog, inst, &BackupRequest::new(t), &BackupConfig::default())
}

fn rel_in_backup(catalog: &BackupCatalog, rec: &BackupRecord, ts: u32, rel: &str) -> PathBuf {
    tablespace_dir(&catalog.backup_dir("main", &rec.id), ts).join(rel)
}

fn flip_byte(path: &Path, off: u64) -> Result<()> {
    let mut bytes = fs::read(path)?;
    bytes[off as usize] ^= 0x5A;
    fs::write(path, bytes)?;
    Ok(())
}

/// Проверка не должна трогать запись.
fn assert_unchanged(catalog: &BackupCatalog, rec: &BackupRecord) -> Result<()> {
    assert_eq!(&catalog.get("main", &rec.id)?, rec);
    Ok(())
}

#[test]
fn clean_backup_validates() -> Result<()> {
    let (inst, catalog, _ts) = setup("clean")?;
    let rec = backup(&inst, &catalog, BackupType::Full)?;

    let report = validate_backup(&catalog, "main", &rec.id, true)?;
    assert_eq!(report.id, rec.id);
    assert!(report.files_checked >= 2);
    // 9 блоков по 2 на чанк → 5 чанков
    assert_eq!(report.chunks_checked, 5);
    assert_unchanged(&catalog, &rec)?;
    Ok(())
}

#[test]
fn corrupted_cfm_in_backup_fails_validation() -> Result<()> {
    let (inst, catalog, ts) = setup("cfm")?;
    let rec = backup(&inst, &catalog, BackupType::Full)?;
    flip_byte(&cfm_path(&rel_in_backup(&catalog, &rec, ts, "16385")), 40)?;

    let err = validate_backup(&catalog, "main", &rec.id, true).unwrap_err();
    assert!(matches!(classify(&err), Some(BackupError::MalformedCfm { .. })));
    assert_unchanged(&catalog, &rec)?;
    assert_eq!(catalog.get("main", &rec.id)?.status, BackupStatus::Ok);
    Ok(())
}

#[test]
fn corrupted_chunk_in_backup_names_the_chunk() -> Result<()> {
    let (inst, catalog, ts) = setup("chunk")?;
    let rec = backup(&inst, &catalog, BackupType::Full)?;
    let data = rel_in_backup(&catalog, &rec, ts, "16385");
    let map = read_cfm(&data)?;
    flip_byte(&data, map.chunks[3].physical_offset)?;

    let err = validate_backup(&catalog, "main", &rec.id, true).unwrap_err();
    match classify(&err) {
        Some(BackupError::Corruption { file, chunk, .. }) => {
            assert_eq!(file, &data);
            assert_eq!(*chunk, Some(3));
        }
        other => panic!("unexpected classification {:?}: {:#}", other, err),
    }
    assert_unchanged(&catalog, &rec)?;
    Ok(())
}

#[test]
fn missing_compression_map_in_backup() -> Result<()> {
    let (inst, catalog, ts) = setup("nomap")?;
    let rec = backup(&inst, &catalog, BackupType::Full)?;
    fs::remove_file(cmap_path(&tablespace_dir(&catalog.backup_dir("main", &rec.id), ts)))?;

    let err = validate_backup(&catalog, "main", &rec.id, true).unwrap_err();
    assert!(matches!(
        classify(&err),
        Some(BackupError::MissingMetadata { .. })
    ));
    assert_unchanged(&catalog, &rec)?;
    Ok(())
}

#[test]
fn stray_file_in_backup_is_flagged() -> Result<()> {
    let (inst, catalog, ts) = setup("stray")?;
    let rec = backup(&inst, &catalog, BackupType::Full)?;
    let stray = rel_in_backup(&catalog, &rec, ts, "99999");
    fs::write(&stray, b"not from the source")?;

    let err = validate_backup(&catalog, "main", &rec.id, true).unwrap_err();
    assert!(format!("{:#}", err).contains("not listed"), "{:#}", err);

    fs::remove_file(&stray)?;
    validate_backup(&catalog, "main", &rec.id, true)?;
    Ok(())
}

#[test]
fn incremental_with_missing_parent_fails() -> Result<()> {
    let (inst, catalog, ts) = setup("chain")?;
    let full = backup(&inst, &catalog, BackupType::Full)?;
    inst.write_blocks(ts, "16385", 4, &rows(1, "w"))?;
    let page = backup(&inst, &catalog, BackupType::Page)?;
    assert_eq!(page.parent_id.as_deref(), Some(full.id.as_str()));
    validate_backup(&catalog, "main", &page.id, true)?;

    // родитель пропал из каталога в обход delete
    fs::remove_dir_all(catalog.backup_dir("main", &full.id))?;
    let err = validate_backup(&catalog, "main", &page.id, true).unwrap_err();
    assert!(matches!(classify(&err), Some(BackupError::NotFound(_))), "{:#}", err);
    assert_unchanged(&catalog, &page)?;
    Ok(())
}

#[test]
fn only_ok_backups_are_validated() -> Result<()> {
    let (inst, catalog, _ts) = setup("status")?;
    // PAGE без родителя завершается ERROR
    let failed = backup(&inst, &catalog, BackupType::Page);
    assert!(failed.is_err());
    let rec = catalog.list("main")?.pop().expect("failed record");
    assert_eq!(rec.status, BackupStatus::Error);

    let err = validate_backup(&catalog, "main", &rec.id, true).unwrap_err();
    assert!(format!("{:#}", err).contains("only OK backups"));

    let err = validate_backup(&catalog, "main", "NOSUCHID", true).unwrap_err();
    assert!(matches!(classify(&err), Some(BackupError::NotFound(_))));
    Ok(())
}

#[test]
fn validate_instance_collects_failures() -> Result<()> {
    let (inst, catalog, ts) = setup("instance")?;
    let _ = backup(&inst, &catalog, BackupType::Page); // ERROR, пропускается
    let good = backup(&inst, &catalog, BackupType::Full)?;
    inst.write_blocks(ts, "16385", 0, &rows(2, "x"))?;
    let bad = backup(&inst, &catalog, BackupType::Full)?;
    let data = rel_in_backup(&catalog, &bad, ts, "16385");
    let map = read_cfm(&data)?;
    flip_byte(&data, map.chunks[0].physical_offset + 2)?;

    let out = validate_instance(&catalog, "main", false)?;
    assert!(!out.is_ok());
    assert_eq!(out.validated, vec![good.id.clone()]);
    assert_eq!(out.skipped.len(), 1);
    assert_eq!(out.failures.len(), 1);
    assert_eq!(out.failures[0].0, bad.id);

    let err = out.into_result().unwrap_err();
    assert!(format!("{:#}", err).contains(&bad.id));
    assert_unchanged(&catalog, &bad)?;
    Ok(())
}
