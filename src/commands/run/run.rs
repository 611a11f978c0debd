use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::RunArgs;
use crate::config::EtlConfig;
use crate::util::write_json_pretty;

use super::EtlOrchestrator;

pub fn run(args: RunArgs) -> Result<()> {
    let config = EtlConfig::from_yaml_file(&args.config)?;
    info!(config = %args.config.display(), "loaded configuration");

    let orchestrator = EtlOrchestrator::new(config).context("failed to initialize pipeline")?;
    let requested = (!args.studies.is_empty()).then(|| args.studies.clone());
    let report = orchestrator.execute_batch(requested)?;

    if let Some(report_path) = &orchestrator.config().report_path {
        write_json_pretty(report_path, &report)?;
        info!(path = %report_path.display(), "wrote run report");
    }

    if !report.succeeded() {
        bail!(
            "{} of {} studies failed: {}",
            report.studies_failed,
            report.studies_requested,
            report.errors.join("; ")
        );
    }

    info!(
        studies = report.studies_processed,
        records = report.total_records_processed,
        "run completed"
    );
    Ok(())
}
