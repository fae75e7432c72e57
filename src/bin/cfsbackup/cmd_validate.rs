use anyhow::Result;
use std::path::PathBuf;

use cfsbackup::{validate_backup, validate_instance, BackupCatalog};

pub fn exec(catalog: PathBuf, instance: String, id: Option<String>, keep_going: bool) -> Result<()> {
    let catalog = BackupCatalog::open(&catalog)?;
    let fail_fast = !keep_going;
    match id {
        Some(id) => {
            let r = validate_backup(&catalog, &instance, &id, fail_fast)?;
            println!(
                "backup {} is valid (files={}, chunks={})",
                r.id, r.files_checked, r.chunks_checked
            );
        }
        None => {
            let v = validate_instance(&catalog, &instance, fail_fast)?;
            for id in &v.validated {
                println!("{}  OK", id);
            }
            for id in &v.skipped {
                println!("{}  skipped (not OK)", id);
            }
            for (id, e) in &v.failures {
                println!("{}  FAILED: {:#}", id, e);
            }
            v.into_result()?;
        }
    }
    Ok(())
}
