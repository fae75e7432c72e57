use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env};

mod cli;
mod cmd_backup;
mod cmd_delete;
mod cmd_show;
mod cmd_validate;

fn init_logger() {
    // Уровень берём из RUST_LOG, иначе info.
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    match cli.cmd {
        cli::Cmd::Backup {
            catalog,
            instance_root,
            backup_type,
            mode,
            workers,
            keep_going,
            tracking,
            json,
        } => cmd_backup::exec(cmd_backup::Args {
            catalog,
            instance_root,
            backup_type,
            mode,
            workers,
            keep_going,
            tracking,
            json,
        }),

        cli::Cmd::Validate {
            catalog,
            instance,
            id,
            keep_going,
        } => cmd_validate::exec(catalog, instance, id, keep_going),

        cli::Cmd::Show {
            catalog,
            instance,
            id,
            json,
        } => cmd_show::exec(catalog, instance, id, json),

        cli::Cmd::Delete { catalog, instance, id } => cmd_delete::exec(catalog, instance, id),
    }
}
