use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::Parser;
use log::LevelFilter;
use pg_backup_lib::backup::{Orchestrator, PgCatalog, PgDump};
use pg_backup_lib::cli::{Action, Cli};
use pg_backup_lib::config::BackupConfig;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger, RUST_LOG overrides the default level
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = match BackupConfig::from_path(&cli.config_file) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if config.backup_root().is_relative() {
        log::warn!("backup_root is relative: {}", config.backup_root().display());
    }

    match cli.action {
        Action::Backup => backup(&config),
    }
}

fn backup(config: &BackupConfig) -> ExitCode {
    let orchestrator = Orchestrator::new(PgCatalog, PgDump);

    let cancelled = orchestrator.cancellation();
    if let Err(e) = ctrlc::set_handler(move || {
        log::warn!("Received termination signal, cancelling remaining backups");
        cancelled.store(true, Ordering::SeqCst);
    }) {
        log::warn!("Installing the termination handler failed: {e}");
    }

    match orchestrator.run(config) {
        Ok(report) if report.all_succeeded() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("Backup aborted: {e}");
            ExitCode::FAILURE
        }
    }
}
