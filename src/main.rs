mod cli;
mod commands;
mod config;
mod error;
mod model;
mod technology;
mod util;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::{EtlConfig, LogRotation};

fn main() {
    let cli = Cli::parse();

    // A broken config is reported by the command itself once logging is up.
    let config = EtlConfig::from_yaml_file(cli.config_path()).ok();
    let log_level = cli
        .log_level()
        .map(ToOwned::to_owned)
        .or_else(|| config.as_ref().map(|config| config.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());

    if let Err(err) = init_tracing(&log_level, config.as_ref()) {
        eprintln!("failed to initialize logging: {err:#}");
        std::process::exit(1);
    }

    if let Err(err) = run(cli) {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run(args) => commands::run::run(args),
        Commands::Discover(args) => commands::discover::run(args),
        Commands::Status(args) => commands::status::run(args),
    }
}

fn init_tracing(log_level: &str, config: Option<&EtlConfig>) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match config.and_then(|config| config.log_file.as_deref().map(|path| (config, path))) {
        Some((config, path)) => {
            let appender =
                log_file_appender(path, config.log_rotation, config.log_backup_count)?;

            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(appender)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    Ok(())
}

/// Appender for `path`. Rolled files get a date suffix; at most
/// `backup_count` of them are kept beside the active file.
fn log_file_appender(
    path: &Path,
    rotation: LogRotation,
    backup_count: usize,
) -> Result<RollingFileAppender> {
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("log file {} has no file name", path.display()))?;
    util::ensure_directory(directory)?;

    let rotation = match rotation {
        LogRotation::Never => Rotation::NEVER,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
    };

    RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(prefix)
        .max_log_files(backup_count.saturating_add(1))
        .build(directory)
        .with_context(|| format!("failed to open log file {}", path.display()))
}
