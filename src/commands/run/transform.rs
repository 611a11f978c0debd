use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::info;

use crate::config::EtlConfig;
use crate::error::EtlError;
use crate::model::{
    PlatformRecord, QcMetrics, SampleRecord, StudyRecord, TransformationStats,
};
use crate::util::{sha256_text, utc_string};

use super::{
    ExperimentMetadata, ExpressionBatches, ExtractedStudy, IllnessInferenceEngine,
    PlatformNormalizer, value_as_text,
};

const BATCH_ID_LEN: usize = 32;

pub(crate) struct TransformedStudy {
    pub(crate) study_code: String,
    pub(crate) batch_id: String,
    pub(crate) study: StudyRecord,
    pub(crate) platform: PlatformRecord,
    pub(crate) samples: Vec<SampleRecord>,
    pub(crate) expression: ExpressionBatches,
    pub(crate) qc_metrics: QcMetrics,
    pub(crate) stats: TransformationStats,
}

pub(crate) struct Transformer {
    illness: IllnessInferenceEngine,
    platform: PlatformNormalizer,
}

impl Transformer {
    pub(crate) fn new(illness: IllnessInferenceEngine, platform: PlatformNormalizer) -> Self {
        Self { illness, platform }
    }

    pub(crate) fn from_config(config: &EtlConfig) -> Result<Self> {
        Ok(Self::new(
            IllnessInferenceEngine::from_config(config)?,
            PlatformNormalizer::from_config(config)?,
        ))
    }

    pub(crate) fn transform(&self, extracted: ExtractedStudy) -> Result<TransformedStudy, EtlError> {
        let ExtractedStudy {
            study_code,
            metadata,
            expression,
            ..
        } = extracted;
        info!(study = %study_code, "starting transformation");

        let study = transform_study(&metadata.experiment)
            .map_err(|err| EtlError::transformation(&study_code, err))?;
        let platform = self.transform_platform(&metadata.experiment);
        let (samples, stats) = self.transform_samples(&metadata.samples, &study_code);
        let batch_id = generate_batch_id(&study_code, Utc::now());

        info!(
            study = %study_code,
            batch_id = %batch_id,
            samples = samples.len(),
            platform = %platform.accession,
            technology = %platform.measurement_technology,
            "transformation completed"
        );

        Ok(TransformedStudy {
            study_code,
            batch_id,
            study,
            platform,
            samples,
            expression,
            qc_metrics: metadata.qc_metrics,
            stats,
        })
    }

    /// One record per metadata sample, in metadata order; illness inference
    /// runs once per sample.
    pub(crate) fn transform_samples(
        &self,
        samples: &Map<String, Value>,
        study_code: &str,
    ) -> (Vec<SampleRecord>, TransformationStats) {
        let mut stats = TransformationStats::default();
        let mut records = Vec::with_capacity(samples.len());

        for (accession, attributes) in samples {
            let title = text_attribute(attributes, "refinebio_title");
            let (illness_label, method) = self
                .illness
                .infer(title.as_deref().unwrap_or_default(), accession);

            *stats.illness_by_method.entry(method).or_default() += 1;
            *stats.illness_by_label.entry(illness_label.clone()).or_default() += 1;

            records.push(SampleRecord {
                accession_code: accession.clone(),
                title,
                organism: text_attribute(attributes, "refinebio_organism"),
                platform: text_attribute(attributes, "refinebio_platform"),
                treatment: text_attribute(attributes, "refinebio_treatment"),
                cell_line: text_attribute(attributes, "refinebio_cell_line"),
                tissue: text_attribute(attributes, "refinebio_tissue"),
                is_processed: attributes
                    .get("refinebio_processed")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                processor_name: text_attribute(attributes, "refinebio_processor_name"),
                processor_version: text_attribute(attributes, "refinebio_processor_version"),
                illness_label,
                illness_inference_method: method,
                study_accession_code: study_code.to_string(),
            });
            stats.samples_processed += 1;
        }

        (records, stats)
    }

    pub(crate) fn transform_platform(&self, experiment: &ExperimentMetadata) -> PlatformRecord {
        self.platform.normalize(
            experiment.platform.as_deref().unwrap_or_default(),
            experiment.technology.as_deref(),
        )
    }
}

pub(crate) fn transform_study(experiment: &ExperimentMetadata) -> Result<StudyRecord> {
    let accession_code = experiment
        .accession_code
        .clone()
        .context("experiment entry has no accession_code")?;

    Ok(StudyRecord {
        accession_code,
        title: experiment.title.clone(),
        pubmed_id: experiment.pubmed_id.as_ref().and_then(value_as_text),
        technology: experiment.technology.clone(),
        organism: experiment
            .organisms
            .as_ref()
            .and_then(|organisms| organisms.first().cloned()),
        description: experiment.description.clone(),
        first_published: experiment.source_first_published.clone(),
        last_modified: experiment.source_last_modified.clone(),
    })
}

/// Salted with the run timestamp, so reruns of one study get distinct ids.
pub(crate) fn generate_batch_id(study_code: &str, ts: DateTime<Utc>) -> String {
    let digest = sha256_text(&format!("{study_code}||{}", utc_string(ts)));
    digest[..BATCH_ID_LEN].to_string()
}

fn text_attribute(attributes: &Value, key: &str) -> Option<String> {
    attributes.get(key).and_then(value_as_text)
}
