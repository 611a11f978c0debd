use tracing::{info, warn};

use crate::config::EtlConfig;
use crate::error::EtlError;
use crate::model::ExtractionStats;

use super::{
    ExpressionBatches, StudyMetadata, extract_metadata, sample_count_warning,
    unknown_matrix_samples,
};

pub(crate) struct ExtractedStudy {
    pub(crate) study_code: String,
    pub(crate) metadata: StudyMetadata,
    pub(crate) expression: ExpressionBatches,
    pub(crate) stats: ExtractionStats,
}

/// Reads the study's metadata and opens its matrix stream. Records are not
/// read here; the loader pulls them batch by batch.
pub(crate) fn extract_study(config: &EtlConfig, study_code: &str) -> Result<ExtractedStudy, EtlError> {
    info!(study = %study_code, "starting extraction");
    let paths = config.study_file_paths(study_code);

    let metadata = extract_metadata(&paths.metadata, study_code)
        .map_err(|err| EtlError::extraction(study_code, err))?;

    let expression = ExpressionBatches::open(&paths.expression, study_code, config.chunk_size)
        .map_err(|err| EtlError::extraction(study_code, err))?;

    let mut stats = ExtractionStats {
        files_processed: 2,
        declared_sample_count: metadata.experiment.declared_sample_count(),
        metadata_sample_count: metadata.samples.len(),
        matrix_sample_count: expression.sample_codes().len(),
        matrix_file_hash: expression.file_hash().to_string(),
        warnings: Vec::new(),
    };

    if let Some(warning) = sample_count_warning(&metadata, study_code) {
        warn!(study = %study_code, warning = %warning, "metadata consistency warning");
        stats.warnings.push(warning);
    }

    let unknown = unknown_matrix_samples(&metadata, expression.sample_codes());
    if !unknown.is_empty() {
        let warning = format!(
            "{} matrix sample columns have no metadata entry and will not load: {}",
            unknown.len(),
            unknown.join(", ")
        );
        warn!(study = %study_code, warning = %warning, "matrix consistency warning");
        stats.warnings.push(warning);
    }

    info!(
        study = %study_code,
        samples = stats.metadata_sample_count,
        matrix_samples = stats.matrix_sample_count,
        file = %expression.file_name(),
        "extraction completed"
    );

    Ok(ExtractedStudy {
        study_code: study_code.to_string(),
        metadata,
        expression,
        stats,
    })
}
