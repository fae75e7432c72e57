//! validate: the Validator re-runs post-write checks on stored backups.
//!
//! Работает только по дереву бэкапа и files.json, источник не нужен.
//! Записи каталога не меняются ни при каком исходе.
//! Инкремент без родителя в каталоге (или с неуспешным родителем) считается ошибкой:
//! восстановить из такой цепочки нельзя.

use anyhow::{anyhow, Result};
use log::{info, warn};

use crate::catalog::{read_content, BackupCatalog, BackupRecord, BackupStatus};
use crate::detect::{check_backup_tree, DetectReport};
use crate::error::BackupError;
use crate::metrics::record_validation_run;

#[derive(Debug)]
pub struct ValidationReport {
    pub id: String,
    pub files_checked: u64,
    pub chunks_checked: u64,
}

/// Validate one backup (and the existence of its parent chain).
pub fn validate_backup(
    catalog: &BackupCatalog,
    instance: &str,
    id: &str,
    fail_fast: bool,
) -> Result<ValidationReport> {
    record_validation_run();
    let rec = catalog.get(instance, id)?;
    if rec.status != BackupStatus::Ok {
        return Err(anyhow!(
            "backup {} has status {}, only OK backups can be validated",
            rec.id,
            rec.status
        ));
    }
    check_chain(catalog, &rec)?;

    let dir = catalog.backup_dir(instance, id);
    let content = read_content(&dir)?;
    let report: DetectReport = check_backup_tree(&dir, &content, fail_fast);
    let (files_checked, chunks_checked) = (report.files_checked, report.chunks_checked);
    report.into_result()?;
    info!(
        "validate: backup id={} OK, files={}, chunks={}",
        id, files_checked, chunks_checked
    );
    Ok(ValidationReport {
        id: id.to_string(),
        files_checked,
        chunks_checked,
    })
}

fn check_chain(catalog: &BackupCatalog, rec: &BackupRecord) -> Result<()> {
    let mut cur = rec.clone();
    while let Some(pid) = cur.parent_id.clone() {
        let parent = match catalog.get(&cur.instance, &pid) {
            Ok(p) => p,
            Err(_) => {
                return Err(BackupError::NotFound(format!(
                    "parent {} of backup {} is missing from the catalog",
                    pid, cur.id
                ))
                .into())
            }
        };
        if parent.status != BackupStatus::Ok {
            return Err(anyhow!(
                "parent {} of backup {} has status {}",
                parent.id,
                cur.id,
                parent.status
            ));
        }
        cur = parent;
    }
    Ok(())
}

/// Outcome of validating every OK backup of an instance.
#[derive(Debug, Default)]
pub struct InstanceValidation {
    pub validated: Vec<String>,
    pub skipped: Vec<String>,
    pub failures: Vec<(String, anyhow::Error)>,
}

impl InstanceValidation {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// Ok if every backup validated, otherwise the first failure.
    pub fn into_result(mut self) -> Result<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        let n = self.failures.len();
        let (id, err) = self.failures.remove(0);
        Err(err.context(format!("backup {} failed validation ({} failing backup(s))", id, n)))
    }
}

/// Validate every OK backup of the instance. Non-OK records are skipped.
pub fn validate_instance(
    catalog: &BackupCatalog,
    instance: &str,
    fail_fast: bool,
) -> Result<InstanceValidation> {
    let mut out = InstanceValidation::default();
    for rec in catalog.list(instance)? {
        if rec.status != BackupStatus::Ok {
            out.skipped.push(rec.id);
            continue;
        }
        match validate_backup(catalog, instance, &rec.id, fail_fast) {
            Ok(_) => out.validated.push(rec.id),
            Err(e) => {
                warn!("validate: backup id={} failed: {:#}", rec.id, e);
                out.failures.push((rec.id, e));
            }
        }
    }
    info!(
        "validate: instance={} validated={}, skipped={}, failed={}",
        instance,
        out.validated.len(),
        out.skipped.len(),
        out.failures.len()
    );
    Ok(out)
}
