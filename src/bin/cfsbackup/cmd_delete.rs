use anyhow::Result;
use std::path::PathBuf;

use cfsbackup::BackupCatalog;

pub fn exec(catalog: PathBuf, instance: String, id: String) -> Result<()> {
    let catalog = BackupCatalog::open(&catalog)?;
    let lease = catalog.acquire_lease(&instance)?;
    let rec = catalog.delete(&lease, &id)?;
    println!("deleted backup {} ({}, {})", rec.id, rec.backup_type, rec.status);
    Ok(())
}
