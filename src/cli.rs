use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "expression-etl",
    version,
    about = "Gene expression matrix ETL into a dimensional SQLite warehouse"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn config_path(&self) -> &PathBuf {
        match &self.command {
            Commands::Run(args) => &args.config,
            Commands::Discover(args) => &args.config,
            Commands::Status(args) => &args.config,
        }
    }

    pub fn log_level(&self) -> Option<&str> {
        match &self.command {
            Commands::Run(args) => args.log_level.as_deref(),
            Commands::Discover(_) | Commands::Status(_) => None,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract, transform and load studies into the warehouse.
    Run(RunArgs),
    /// List the studies found under the configured base path.
    Discover(DiscoverArgs),
    /// Show warehouse schema version and table row counts.
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = "config/etl.yaml")]
    pub config: PathBuf,

    /// Study to process; repeatable. All discovered studies when omitted.
    #[arg(long = "study")]
    pub studies: Vec<String>,

    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DiscoverArgs {
    #[arg(long, default_value = "config/etl.yaml")]
    pub config: PathBuf,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = "config/etl.yaml")]
    pub config: PathBuf,
}
