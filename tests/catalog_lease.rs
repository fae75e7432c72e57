// tests/catalog_lease.rs
//
// Запуск только этого файла:
//   cargo test --test catalog_lease -- --nocapture
//
// Покрываем:
// 1) Аренда экземпляра: второй бэкап при занятой аренде → InstanceBusy, новой записи нет.
// 2) Зависшая RUNNING-запись закрывается как ERROR при следующем захвате аренды.
// 3) finalize не переписывает завершённую запись.
// 4) Отмена и потеря STREAM-соединения → ERROR, аренда освобождается.
// 5) list/get/delete и порядок идентификаторов.
// 6) Испорченный backup.json пропускается, остальной каталог работает.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use cfsbackup::catalog::id_seconds;
use cfsbackup::consts::RECORD_FILE;
use cfsbackup::{
    classify, run_backup, validate_instance, Algorithm, BackupCatalog, BackupConfig, BackupError, BackupRequest,
    BackupStatus, BackupType, CancelToken, LocalInstance, Orchestrator, TransferMode,
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
    base.join(format!("cfstest-catalog-{prefix}-{pid}-{t}-{id}"))
}

fn setup(prefix: &str) -> Result<(PathBuf, LocalInstance, BackupCatalog, u32)> {
    let root = unique_root(prefix);
    let inst = LocalInstance::init(&root.join("pgdata"), "main")?;
    let catalog = BackupCatalog::open(&root.join("catalog"))?;
    let ts = inst.create_tablespace("cfs_ts", Some((Algorithm::Zlib, 16384)))?;
    let rows: Vec<Vec<u8>> = (0..4)
        .map(|i| format!("lease row {i};").repeat(30).into_bytes())
        .collect();
    inst.append_blocks(ts.id, "16385", &rows)?;
    Ok((root, inst, catalog, ts.id))
}

fn full() -> BackupRequest {
    BackupRequest::new(BackupType::Full)
}

#[test]
fn busy_instance_rejects_second_backup() -> Result<()> {
    let (_root, inst, catalog, _ts) = setup("busy")?;
    let lease = catalog.acquire_lease("main")?;
    assert_eq!(lease.instance(), "main");

    let err = run_backup(&catalog, &inst, &full(), &BackupConfig::default()).unwrap_err();
    assert!(matches!(classify(&err), Some(BackupError::InstanceBusy(_))), "{:#}", err);
    assert!(catalog.list("main")?.is_empty(), "no record for a rejected attempt");

    // второй захват тоже отказывает, пока первая аренда жива
    assert!(catalog.acquire_lease("main").is_err());
    drop(lease);

    let rec = run_backup(&catalog, &inst, &full(), &BackupConfig::default())?;
    assert_eq!(rec.status, BackupStatus::Ok);
    Ok(())
}

#[test]
fn stale_running_record_is_closed_on_next_lease() -> Result<()> {
    let (_root, _inst, catalog, _ts) = setup("stale")?;
    let lease = catalog.acquire_lease("main")?;
    let rec = catalog.create(&lease, BackupType::Full, TransferMode::Archive)?;
    assert_eq!(rec.status, BackupStatus::Running);
    // процесс «упал», не завершив запись
    drop(lease);

    let _lease = catalog.acquire_lease("main")?;
    let closed = catalog.get("main", &rec.id)?;
    assert_eq!(closed.status, BackupStatus::Error);
    assert!(closed.finished_at.is_some());
    assert!(closed.error.as_deref().unwrap_or("").contains("interrupted"));
    Ok(())
}

#[test]
fn finalize_refuses_terminal_record() -> Result<()> {
    let (_root, _inst, catalog, _ts) = setup("finalize")?;
    let lease = catalog.acquire_lease("main")?;
    let mut rec = catalog.create(&lease, BackupType::Full, TransferMode::Stream)?;

    assert!(catalog.finalize(&lease, &mut rec, BackupStatus::Running).is_err());
    catalog.finalize(&lease, &mut rec, BackupStatus::Error)?;

    let mut again = catalog.get("main", &rec.id)?;
    let err = catalog.finalize(&lease, &mut again, BackupStatus::Ok).unwrap_err();
    assert!(format!("{:#}", err).contains("already finalized"));
    assert_eq!(catalog.get("main", &rec.id)?.status, BackupStatus::Error);
    Ok(())
}

#[test]
fn cancelled_backup_ends_as_error_and_releases_lease() -> Result<()> {
    let (_root, inst, catalog, _ts) = setup("cancel")?;
    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(cancel.is_cancelled());

    let err = Orchestrator::new(&catalog, &inst, BackupConfig::default())
        .with_cancel(cancel)
        .run(&full())
        .unwrap_err();
    assert!(matches!(classify(&err), Some(BackupError::Cancelled)), "{:#}", err);
    let rec = catalog.list("main")?.pop().expect("record");
    assert_eq!(rec.status, BackupStatus::Error);

    let next = run_backup(&catalog, &inst, &full(), &BackupConfig::default())?;
    assert_eq!(next.status, BackupStatus::Ok);
    Ok(())
}

#[test]
fn lost_stream_connection_ends_as_error() -> Result<()> {
    let (root, _inst, catalog, _ts) = setup("lost")?;
    // соединение рвётся после первого полученного файла
    let flaky = LocalInstance::open(&root.join("pgdata"))?.with_stream_fetch_limit(Some(1));
    let req = full().with_mode(TransferMode::Stream);

    let err = run_backup(&catalog, &flaky, &req, &BackupConfig::default().with_workers(1)).unwrap_err();
    assert!(matches!(classify(&err), Some(BackupError::Transfer(_))), "{:#}", err);
    let rec = catalog.list("main")?.pop().expect("record");
    assert_eq!(rec.status, BackupStatus::Error);
    assert!(rec.error.as_deref().unwrap_or("").contains("connection"));
    assert!(rec.stop_lsn.is_some(), "backup mode is left on failure");
    Ok(())
}

#[test]
fn list_get_delete() -> Result<()> {
    let (_root, inst, catalog, ts) = setup("delete")?;
    let first = run_backup(&catalog, &inst, &full(), &BackupConfig::default())?;
    inst.write_blocks(ts, "16385", 1, &[b"changed".to_vec()])?;
    let page = run_backup(&catalog, &inst, &BackupRequest::new(BackupType::Page), &BackupConfig::default())?;
    assert_eq!(page.parent_id.as_deref(), Some(first.id.as_str()));

    let ids: Vec<String> = catalog.list("main")?.into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![first.id.clone(), page.id.clone()]);
    assert_eq!(catalog.find(&page.id)?.instance, "main");
    assert!(matches!(
        classify(&catalog.get("main", "ZZZZZZ").unwrap_err()),
        Some(BackupError::NotFound(_))
    ));

    let lease = catalog.acquire_lease("main")?;
    let err = catalog.delete(&lease, &first.id).unwrap_err();
    assert!(format!("{:#}", err).contains(&page.id));

    let gone = catalog.delete(&lease, &page.id)?;
    assert_eq!(gone.id, page.id);
    assert!(!catalog.backup_dir("main", &page.id).exists());
    catalog.delete(&lease, &first.id)?;
    assert!(catalog.list("main")?.is_empty());
    Ok(())
}

#[test]
fn ids_are_unique_and_increasing() -> Result<()> {
    let (_root, _inst, catalog, _ts) = setup("ids")?;
    let lease = catalog.acquire_lease("main")?;
    let mut seen = HashSet::new();
    let mut last = 0u64;
    for _ in 0..5 {
        let mut rec = catalog.create(&lease, BackupType::Full, TransferMode::Archive)?;
        let secs = id_seconds(&rec.id).expect("base36 id");
        assert!(secs > last, "{} after {}", secs, last);
        last = secs;
        assert!(seen.insert(rec.id.clone()));
        catalog.finalize(&lease, &mut rec, BackupStatus::Error)?;
    }
    let listed: Vec<String> = catalog.list("main")?.into_iter().map(|r| r.id).collect();
    assert_eq!(listed.len(), 5);
    assert!(listed.iter().all(|id| seen.contains(id)));
    Ok(())
}

#[test]
fn damaged_record_does_not_break_the_catalog() -> Result<()> {
    let (_root, inst, catalog, _ts) = setup("damaged")?;
    let first = run_backup(&catalog, &inst, &full(), &BackupConfig::default())?;
    let second = run_backup(&catalog, &inst, &full(), &BackupConfig::default())?;
    std::fs::write(catalog.backup_dir("main", &second.id).join(RECORD_FILE), b"{ not json")?;

    let ids: Vec<String> = catalog.list("main")?.into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![first.id.clone()]);
    assert!(catalog.get("main", &second.id).is_err());

    // id испорченной записи не переиспользуется
    let third = run_backup(&catalog, &inst, &full(), &BackupConfig::default())?;
    assert!(id_seconds(&third.id) > id_seconds(&second.id));
    assert_eq!(catalog.latest_ok("main")?.map(|r| r.id), Some(third.id.clone()));

    let out = validate_instance(&catalog, "main", true)?;
    assert!(out.is_ok());
    assert_eq!(out.validated, vec![first.id, third.id]);
    Ok(())
}
