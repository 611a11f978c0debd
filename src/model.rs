use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::technology::MeasurementTechnology;

pub const UNKNOWN_ILLNESS: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceMethod {
    Override,
    Regex,
    Default,
}

impl InferenceMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Override => "override",
            Self::Regex => "regex",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for InferenceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudyRecord {
    pub accession_code: String,
    pub title: Option<String>,
    pub pubmed_id: Option<String>,
    pub technology: Option<String>,
    pub organism: Option<String>,
    pub description: Option<String>,
    pub first_published: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformRecord {
    pub accession: String,
    pub name: String,
    pub manufacturer: String,
    pub measurement_technology: MeasurementTechnology,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRecord {
    pub accession_code: String,
    pub title: Option<String>,
    pub organism: Option<String>,
    pub platform: Option<String>,
    pub treatment: Option<String>,
    pub cell_line: Option<String>,
    pub tissue: Option<String>,
    pub is_processed: bool,
    pub processor_name: Option<String>,
    pub processor_version: Option<String>,
    pub illness_label: String,
    pub illness_inference_method: InferenceMethod,
    pub study_accession_code: String,
}

/// One (gene, sample) cell of a wide matrix in long format.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionRecord {
    pub gene_id: String,
    pub sample_accession_code: String,
    pub expression_value: Option<f64>,
    pub study_accession_code: String,
    pub file_hash: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QcMetrics {
    pub ks_statistic: Option<f64>,
    pub ks_pvalue: Option<f64>,
    pub ks_warning: Option<String>,
    pub quantile_normalized: bool,
    pub quant_sf_only: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionStats {
    pub files_processed: usize,
    pub declared_sample_count: usize,
    pub metadata_sample_count: usize,
    pub matrix_sample_count: usize,
    pub matrix_file_hash: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransformationStats {
    pub samples_processed: usize,
    pub illness_by_method: BTreeMap<InferenceMethod, usize>,
    pub illness_by_label: BTreeMap<String, usize>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadStats {
    pub tables_loaded: usize,
    pub samples_upserted: usize,
    pub batches_committed: usize,
    pub records_read: usize,
    pub records_inserted: usize,
    pub records_unmapped: usize,
    pub unmapped_sample_codes: Vec<String>,
    pub qc_rows_inserted: usize,
    pub illness_key_source: String,
    pub load_duration_seconds: f64,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DimensionKeys {
    pub study_key: i64,
    pub platform_key: i64,
    pub sample_keys: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudyReport {
    pub study_code: String,
    pub batch_id: Option<String>,
    pub success: bool,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
    pub trace: Vec<String>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_seconds: f64,
    pub extraction_stats: Option<ExtractionStats>,
    pub transformation_stats: Option<TransformationStats>,
    pub load_stats: Option<LoadStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub report_version: u32,
    pub started_at: String,
    pub ended_at: String,
    pub total_duration_seconds: f64,
    pub studies_requested: usize,
    pub studies_processed: usize,
    pub studies_failed: usize,
    pub total_records_processed: usize,
    pub total_records_unmapped: usize,
    pub study_results: Vec<StudyReport>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.studies_failed == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredStudy {
    pub study_code: String,
    pub expression_path: String,
    pub expression_present: bool,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudyInventory {
    pub manifest_version: u32,
    pub generated_at: String,
    pub base_path: String,
    pub study_count: usize,
    pub studies: Vec<DiscoveredStudy>,
}
