use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI для cfsbackup: бэкапы табличных пространств CFS
#[derive(Parser, Debug)]
#[command(name = "cfsbackup", version, about = "Compression-aware backups of CFS instances")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Take a backup of a local instance
    Backup {
        /// Catalog root (backups/<instance>/... lives under it)
        #[arg(long)]
        catalog: PathBuf,
        /// Instance root (contains instance.json)
        #[arg(long)]
        instance_root: PathBuf,
        /// full | page | ptrack
        #[arg(long = "type", default_value = "full")]
        backup_type: String,
        /// archive | stream
        #[arg(long, default_value = "archive")]
        mode: String,
        /// Copy workers (overrides CFS_BACKUP_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Collect all corruption findings instead of stopping at the first
        #[arg(long)]
        keep_going: bool,
        /// bitmap | scan (overrides the default for the backup type)
        #[arg(long)]
        tracking: Option<String>,
        /// Print the resulting record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate one backup (--id) or every OK backup of an instance
    Validate {
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        instance: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        keep_going: bool,
    },
    /// Show catalog records
    Show {
        #[arg(long)]
        catalog: PathBuf,
        /// Limit to one instance (default: all)
        #[arg(long)]
        instance: Option<String>,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Delete a backup (refused while other backups depend on it)
    Delete {
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        instance: String,
        #[arg(long)]
        id: String,
    },
}
