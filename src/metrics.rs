//! Lightweight global metrics for the backup engine.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Backup runs (started / ok / failed)
//! - Copy (files, chunks, bytes)
//! - Detector / Validator

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Backup runs -----
static BACKUPS_STARTED: AtomicU64 = AtomicU64::new(0);
static BACKUPS_OK: AtomicU64 = AtomicU64::new(0);
static BACKUPS_FAILED: AtomicU64 = AtomicU64::new(0);

// ----- Copy -----
static FILES_COPIED: AtomicU64 = AtomicU64::new(0);
static CHUNKS_COPIED: AtomicU64 = AtomicU64::new(0);
static CHUNKS_SKIPPED: AtomicU64 = AtomicU64::new(0);
static BYTES_COPIED: AtomicU64 = AtomicU64::new(0);

// ----- Detector / Validator -----
static CHUNKS_VERIFIED: AtomicU64 = AtomicU64::new(0);
static CORRUPTION_FINDINGS: AtomicU64 = AtomicU64::new(0);
static VALIDATIONS_RUN: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub backups_started: u64,
    pub backups_ok: u64,
    pub backups_failed: u64,

    pub files_copied: u64,
    pub chunks_copied: u64,
    pub chunks_skipped: u64,
    pub bytes_copied: u64,

    pub chunks_verified: u64,
    pub corruption_findings: u64,
    pub validations_run: u64,
}

impl MetricsSnapshot {
    /// Fraction of chunks left behind by change tracking.
    pub fn skip_ratio(&self) -> f64 {
        let total = self.chunks_copied + self.chunks_skipped;
        if total == 0 {
            0.0
        } else {
            self.chunks_skipped as f64 / total as f64
        }
    }
}

// ----- Recorders (backup runs) -----
pub fn record_backup_started() {
    BACKUPS_STARTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_backup_finished(ok: bool) {
    if ok {
        BACKUPS_OK.fetch_add(1, Ordering::Relaxed);
    } else {
        BACKUPS_FAILED.fetch_add(1, Ordering::Relaxed);
    }
}

// ----- Recorders (copy) -----
pub fn record_file_copied(chunks_copied: u64, chunks_skipped: u64, bytes: u64) {
    FILES_COPIED.fetch_add(1, Ordering::Relaxed);
    CHUNKS_COPIED.fetch_add(chunks_copied, Ordering::Relaxed);
    CHUNKS_SKIPPED.fetch_add(chunks_skipped, Ordering::Relaxed);
    BYTES_COPIED.fetch_add(bytes, Ordering::Relaxed);
}

// ----- Recorders (detector / validator) -----
pub fn record_chunks_verified(n: u64) {
    CHUNKS_VERIFIED.fetch_add(n, Ordering::Relaxed);
}

pub fn record_corruption_finding() {
    CORRUPTION_FINDINGS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_validation_run() {
    VALIDATIONS_RUN.fetch_add(1, Ordering::Relaxed);
}

pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        backups_started: BACKUPS_STARTED.load(Ordering::Relaxed),
        backups_ok: BACKUPS_OK.load(Ordering::Relaxed),
        backups_failed: BACKUPS_FAILED.load(Ordering::Relaxed),

        files_copied: FILES_COPIED.load(Ordering::Relaxed),
        chunks_copied: CHUNKS_COPIED.load(Ordering::Relaxed),
        chunks_skipped: CHUNKS_SKIPPED.load(Ordering::Relaxed),
        bytes_copied: BYTES_COPIED.load(Ordering::Relaxed),

        chunks_verified: CHUNKS_VERIFIED.load(Ordering::Relaxed),
        corruption_findings: CORRUPTION_FINDINGS.load(Ordering::Relaxed),
        validations_run: VALIDATIONS_RUN.load(Ordering::Relaxed),
    }
}
