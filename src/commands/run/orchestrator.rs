use std::time::Instant;

use anyhow::Result;
use tracing::{error, info};

use crate::commands::discover::discover_study_codes;
use crate::config::EtlConfig;
use crate::error::EtlError;
use crate::model::{PipelineReport, StudyReport};
use crate::util::now_utc_string;

use super::{Transformer, WarehouseLoader, extract_study};

const REPORT_VERSION: u32 = 1;

/// Drives extract → transform → load, one study at a time. A failing study is
/// recorded and skipped; it never stops the batch.
pub(crate) struct EtlOrchestrator {
    config: EtlConfig,
    transformer: Transformer,
}

impl EtlOrchestrator {
    pub(crate) fn new(config: EtlConfig) -> Result<Self> {
        let transformer = Transformer::from_config(&config)?;

        info!(
            warehouse = %config.warehouse_path.display(),
            base_path = %config.base_path.display(),
            chunk_size = config.chunk_size,
            rules = config.illness_inference_rules.len(),
            overrides = config.illness_overrides.len(),
            "pipeline configured"
        );
        info!(
            timeout_seconds = config.timeout_seconds,
            "stage timeout is advisory and not enforced"
        );
        info!(
            max_null_percentage = config.qc_thresholds.max_null_percentage,
            max_duplicate_percentage = config.qc_thresholds.max_duplicate_percentage,
            min_genes_per_sample = config.qc_thresholds.min_genes_per_sample,
            min_samples_per_study = config.qc_thresholds.min_samples_per_study,
            "qc thresholds (validation layer only)"
        );

        Ok(Self {
            config,
            transformer,
        })
    }

    pub(crate) fn config(&self) -> &EtlConfig {
        &self.config
    }

    pub(crate) fn execute_study(&self, study_code: &str) -> StudyReport {
        info!(study = %study_code, "=== starting study pipeline ===");
        let started = Instant::now();
        let mut report = StudyReport {
            study_code: study_code.to_string(),
            batch_id: None,
            success: false,
            failed_stage: None,
            error: None,
            trace: Vec::new(),
            started_at: now_utc_string(),
            ended_at: String::new(),
            duration_seconds: 0.0,
            extraction_stats: None,
            transformation_stats: None,
            load_stats: None,
        };

        match self.run_stages(study_code, &mut report) {
            Ok(()) => {
                report.success = true;
                info!(study = %study_code, "=== study pipeline completed ===");
            }
            Err(err) => {
                report.failed_stage = Some(err.stage().to_string());
                report.error = Some(err.to_string());
                report.trace = err.trace();
                error!(study = %study_code, stage = err.stage(), error = %err, "study pipeline failed");
                for cause in &report.trace {
                    error!(study = %study_code, cause = %cause, "caused by");
                }
            }
        }

        report.ended_at = now_utc_string();
        report.duration_seconds = started.elapsed().as_secs_f64().max(1e-6);
        report
    }

    fn run_stages(&self, study_code: &str, report: &mut StudyReport) -> Result<(), EtlError> {
        info!(study = %study_code, "step 1: extracting source files");
        let extracted = extract_study(&self.config, study_code)?;
        report.extraction_stats = Some(extracted.stats.clone());

        info!(study = %study_code, "step 2: transforming");
        let transformed = self.transformer.transform(extracted)?;
        report.transformation_stats = Some(transformed.stats.clone());
        report.batch_id = Some(transformed.batch_id.clone());

        info!(study = %study_code, "step 3: loading warehouse");
        let mut loader = WarehouseLoader::connect(&self.config.warehouse_path, study_code)?;
        let load = loader.load_all(transformed);
        if let Some(keys) = &load.dimension_keys {
            info!(
                study = %study_code,
                study_key = keys.study_key,
                platform_key = keys.platform_key,
                samples = keys.sample_keys.len(),
                "dimension keys resolved"
            );
        }
        report.load_stats = Some(load.stats);

        match load.failure {
            Some(err) => Err(EtlError::load(study_code, err)),
            None => Ok(()),
        }
    }

    /// Runs `study_codes`, or every discovered study when none are given.
    pub(crate) fn execute_batch(&self, study_codes: Option<Vec<String>>) -> Result<PipelineReport> {
        let started = Instant::now();
        let started_at = now_utc_string();

        let study_codes = match study_codes.filter(|codes| !codes.is_empty()) {
            Some(codes) => codes,
            None => discover_study_codes(&self.config.base_path, &self.config.study_code_pattern)?,
        };

        info!(studies = study_codes.len(), "pipeline started");

        let mut study_results = Vec::with_capacity(study_codes.len());
        for (index, study_code) in study_codes.iter().enumerate() {
            info!(
                study = %study_code,
                position = index + 1,
                total = study_codes.len(),
                "processing study"
            );
            study_results.push(self.execute_study(study_code));

            let failed = study_results.iter().filter(|result| !result.success).count();
            info!(
                processed = index + 1,
                total = study_codes.len(),
                succeeded = study_results.len() - failed,
                failed,
                "progress"
            );
        }

        let report = merge_study_reports(
            study_results,
            started_at,
            now_utc_string(),
            started.elapsed().as_secs_f64(),
        );

        info!(
            duration_seconds = report.total_duration_seconds,
            processed = report.studies_processed,
            failed = report.studies_failed,
            records = report.total_records_processed,
            unmapped = report.total_records_unmapped,
            "pipeline completed"
        );

        Ok(report)
    }
}

/// Folds per-study results into the run-level report.
pub(crate) fn merge_study_reports(
    study_results: Vec<StudyReport>,
    started_at: String,
    ended_at: String,
    total_duration_seconds: f64,
) -> PipelineReport {
    let mut report = PipelineReport {
        report_version: REPORT_VERSION,
        started_at,
        ended_at,
        total_duration_seconds,
        studies_requested: study_results.len(),
        studies_processed: 0,
        studies_failed: 0,
        total_records_processed: 0,
        total_records_unmapped: 0,
        study_results: Vec::new(),
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    for result in &study_results {
        if result.success {
            report.studies_processed += 1;
        } else {
            report.studies_failed += 1;
            report.errors.push(format!(
                "study {}: {}",
                result.study_code,
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }

        let extraction_warnings = result
            .extraction_stats
            .iter()
            .flat_map(|stats| stats.warnings.iter());
        let transformation_warnings = result
            .transformation_stats
            .iter()
            .flat_map(|stats| stats.warnings.iter());
        let load_warnings = result.load_stats.iter().flat_map(|stats| stats.warnings.iter());

        for warning in extraction_warnings
            .chain(transformation_warnings)
            .chain(load_warnings)
        {
            report
                .warnings
                .push(format!("study {}: {warning}", result.study_code));
        }

        if let Some(load) = &result.load_stats {
            report.total_records_unmapped += load.records_unmapped;
            if result.success {
                report.total_records_processed += load.records_inserted;
            }
        }
    }

    report.study_results = study_results;
    report
}
