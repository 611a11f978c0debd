use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::model::QcMetrics;

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ExperimentMetadata {
    #[serde(default)]
    pub(crate) accession_code: Option<String>,
    #[serde(default)]
    pub(crate) title: Option<String>,
    #[serde(default)]
    pub(crate) technology: Option<String>,
    #[serde(default)]
    pub(crate) organisms: Option<Vec<String>>,
    #[serde(default)]
    pub(crate) sample_accession_codes: Option<Vec<String>>,
    #[serde(default)]
    pub(crate) platform: Option<String>,
    #[serde(default)]
    pub(crate) pubmed_id: Option<Value>,
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(default)]
    pub(crate) source_first_published: Option<String>,
    #[serde(default)]
    pub(crate) source_last_modified: Option<String>,
}

impl ExperimentMetadata {
    pub(crate) fn declared_sample_count(&self) -> usize {
        self.sample_accession_codes.as_ref().map_or(0, Vec::len)
    }
}

/// Metadata for one study: the experiment entry, every sample entry of the
/// document (document order), and the document-level QC fields.
#[derive(Debug, Clone)]
pub(crate) struct StudyMetadata {
    pub(crate) experiment: ExperimentMetadata,
    pub(crate) samples: Map<String, Value>,
    pub(crate) qc_metrics: QcMetrics,
}

pub(crate) fn extract_metadata(metadata_path: &Path, study_code: &str) -> Result<StudyMetadata> {
    let raw = fs::read(metadata_path)
        .with_context(|| format!("failed to read {}", metadata_path.display()))?;
    let document: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", metadata_path.display()))?;

    parse_metadata_document(&document, study_code)
        .with_context(|| format!("invalid metadata in {}", metadata_path.display()))
}

pub(crate) fn parse_metadata_document(document: &Value, study_code: &str) -> Result<StudyMetadata> {
    let experiment_value = document
        .get("experiments")
        .and_then(|experiments| experiments.get(study_code))
        .ok_or_else(|| anyhow!("study code {study_code} not found in metadata experiments"))?;

    let experiment: ExperimentMetadata = serde_json::from_value(experiment_value.clone())
        .with_context(|| format!("malformed experiment entry for {study_code}"))?;

    let samples = document
        .get("samples")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    Ok(StudyMetadata {
        experiment,
        samples,
        qc_metrics: extract_qc_metrics(document),
    })
}

fn extract_qc_metrics(document: &Value) -> QcMetrics {
    QcMetrics {
        ks_statistic: document.get("ks_statistic").and_then(Value::as_f64),
        ks_pvalue: document.get("ks_pvalue").and_then(Value::as_f64),
        ks_warning: document.get("ks_warning").and_then(value_as_text),
        quantile_normalized: document
            .get("quantile_normalized")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        quant_sf_only: document
            .get("quant_sf_only")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// Strings pass through, numbers and booleans are rendered, null and
/// containers are treated as absent.
pub(crate) fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

pub(crate) fn sample_count_warning(metadata: &StudyMetadata, study_code: &str) -> Option<String> {
    let declared = metadata.experiment.declared_sample_count();
    let found = metadata.samples.len();
    if declared == found {
        return None;
    }

    Some(format!(
        "sample count mismatch in {study_code}: experiment declares {declared}, metadata has {found}"
    ))
}

pub(crate) fn unknown_matrix_samples(metadata: &StudyMetadata, matrix_samples: &[String]) -> Vec<String> {
    matrix_samples
        .iter()
        .filter(|code| !metadata.samples.contains_key(code.as_str()))
        .cloned()
        .collect()
}
