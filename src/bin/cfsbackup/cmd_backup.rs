use anyhow::{anyhow, Result};
use std::path::PathBuf;

use cfsbackup::metrics::metrics_snapshot;
use cfsbackup::{
    run_backup, BackupCatalog, BackupConfig, BackupRequest, BackupType, ChangeTracking,
    LocalInstance, TransferMode,
};

pub struct Args {
    pub catalog: PathBuf,
    pub instance_root: PathBuf,
    pub backup_type: String,
    pub mode: String,
    pub workers: Option<usize>,
    pub keep_going: bool,
    pub tracking: Option<String>,
    pub json: bool,
}

pub fn exec(args: Args) -> Result<()> {
    let backup_type = BackupType::parse(&args.backup_type)
        .ok_or_else(|| anyhow!("unknown backup type '{}' (full|page|ptrack)", args.backup_type))?;
    let mode = TransferMode::parse(&args.mode)
        .ok_or_else(|| anyhow!("unknown transfer mode '{}' (archive|stream)", args.mode))?;

    let mut cfg = BackupConfig::from_env();
    if let Some(n) = args.workers {
        cfg = cfg.with_workers(n);
    }
    if args.keep_going {
        cfg = cfg.with_fail_fast(false);
    }
    if let Some(t) = args.tracking.as_deref() {
        let t = ChangeTracking::parse(t).ok_or_else(|| anyhow!("unknown tracking '{}' (bitmap|scan)", t))?;
        cfg = cfg.with_tracking(Some(t));
    }

    let catalog = BackupCatalog::open(&args.catalog)?;
    let instance = LocalInstance::open(&args.instance_root)?;
    let rec = run_backup(&catalog, &instance, &BackupRequest::new(backup_type).with_mode(mode), &cfg)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rec)?);
    } else {
        let m = metrics_snapshot();
        println!("backup id:     {}", rec.id);
        println!("status:        {}", rec.status);
        println!("type/mode:     {}/{}", rec.backup_type, rec.transfer_mode);
        println!("parent:        {}", rec.parent_id.as_deref().unwrap_or("-"));
        println!("data_bytes:    {}", rec.data_bytes);
        println!(
            "chunks:        copied={}, skipped={} ({:.1}% skipped)",
            m.chunks_copied,
            m.chunks_skipped,
            m.skip_ratio() * 100.0
        );
    }
    Ok(())
}
