use anyhow::Result;
use std::path::PathBuf;

use cfsbackup::{BackupCatalog, BackupRecord};

pub fn exec(catalog: PathBuf, instance: Option<String>, id: Option<String>, json: bool) -> Result<()> {
    let catalog = BackupCatalog::open(&catalog)?;

    let records: Vec<BackupRecord> = match (instance, id) {
        (Some(inst), Some(id)) => vec![catalog.get(&inst, &id)?],
        (None, Some(id)) => vec![catalog.find(&id)?],
        (Some(inst), None) => catalog.list(&inst)?,
        (None, None) => {
            let mut all = Vec::new();
            for inst in catalog.instances()? {
                all.extend(catalog.list(&inst)?);
            }
            all
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!(
        "{:<10} {:<12} {:<7} {:<8} {:<8} {:>12} {:<10}",
        "ID", "INSTANCE", "TYPE", "MODE", "STATUS", "DATA_BYTES", "PARENT"
    );
    for r in &records {
        println!(
            "{:<10} {:<12} {:<7} {:<8} {:<8} {:>12} {:<10}",
            r.id,
            r.instance,
            r.backup_type.to_string(),
            r.transfer_mode.to_string(),
            r.status.to_string(),
            r.data_bytes,
            r.parent_id.as_deref().unwrap_or("-")
        );
        if let Some(err) = &r.error {
            println!("    error: {}", err);
        }
    }
    Ok(())
}
