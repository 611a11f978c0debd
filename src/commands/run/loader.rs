use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use tracing::{debug, info, warn};

use crate::error::EtlError;
use crate::model::{
    DimensionKeys, ExpressionRecord, LoadStats, PlatformRecord, QcMetrics, SampleRecord,
    StudyRecord,
};
use crate::util::now_utc_string;

use super::{
    IllnessKey, IllnessKeySource, ResolvedIllnessKeys, TransformedStudy, configure_connection,
    ensure_schema, resolve_illness_keys,
};

const TABLES_PER_STUDY: usize = 5;

/// Outcome of one study load. Failures are reported here instead of being
/// propagated; committed fact batches stay committed either way.
#[derive(Debug)]
pub(crate) struct LoadReport {
    pub(crate) stats: LoadStats,
    pub(crate) dimension_keys: Option<DimensionKeys>,
    pub(crate) failure: Option<anyhow::Error>,
}

impl LoadReport {
    #[cfg(test)]
    pub(crate) fn success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Owns the warehouse connection for the duration of one study load. The
/// connection is released when the loader is dropped.
pub(crate) struct WarehouseLoader {
    connection: Connection,
    path: PathBuf,
}

impl WarehouseLoader {
    pub(crate) fn connect(path: &Path, study_code: &str) -> Result<Self, EtlError> {
        let open = || -> Result<Connection> {
            let connection = Connection::open(path)
                .with_context(|| format!("failed to open warehouse {}", path.display()))?;
            configure_connection(&connection)?;
            ensure_schema(&connection)?;
            Ok(connection)
        };

        let connection = open().map_err(|err| EtlError::load(study_code, err))?;
        info!(path = %path.display(), "warehouse connection established");

        Ok(Self {
            connection,
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    pub(crate) fn load_all(&mut self, transformed: TransformedStudy) -> LoadReport {
        let started = Instant::now();
        let mut stats = LoadStats::default();
        info!(study = %transformed.study_code, "starting load");

        let outcome = self.load_study(transformed, &mut stats);
        stats.load_duration_seconds = started.elapsed().as_secs_f64();

        match outcome {
            Ok(dimension_keys) => {
                stats.tables_loaded = TABLES_PER_STUDY;
                info!(
                    records = stats.records_inserted,
                    unmapped = stats.records_unmapped,
                    batches = stats.batches_committed,
                    "load completed"
                );
                LoadReport {
                    stats,
                    dimension_keys: Some(dimension_keys),
                    failure: None,
                }
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "load failed");
                stats.errors.push(format!("{err:#}"));
                LoadReport {
                    stats,
                    dimension_keys: None,
                    failure: Some(err),
                }
            }
        }
    }

    fn load_study(&mut self, transformed: TransformedStudy, stats: &mut LoadStats) -> Result<DimensionKeys> {
        let TransformedStudy {
            batch_id,
            study,
            platform,
            samples,
            expression,
            qc_metrics,
            ..
        } = transformed;

        let study_key = self.upsert_study(&study)?;
        let platform_key = self.upsert_platform(&platform)?;

        let illness_keys = resolve_illness_keys(Some(&self.connection as &dyn IllnessKeySource));
        stats.illness_key_source = illness_keys.source_name().to_string();
        if let Some(reason) = &illness_keys.fallback_reason {
            stats
                .warnings
                .push(format!("built-in illness key map used: {reason}"));
        }

        let sample_keys = self.upsert_samples(&samples, study_key, platform_key, &illness_keys, stats)?;
        stats.samples_upserted = sample_keys.len();

        self.load_expression(expression, &sample_keys, &batch_id, stats)?;
        self.load_qc_metrics(study_key, &batch_id, &qc_metrics)?;
        stats.qc_rows_inserted = 1;

        Ok(DimensionKeys {
            study_key,
            platform_key,
            sample_keys,
        })
    }

    pub(crate) fn upsert_study(&self, study: &StudyRecord) -> Result<i64> {
        let now = now_utc_string();
        self.connection
            .query_row(
                "
                INSERT INTO dim_study(
                  study_accession_code, study_title, study_pubmed_id, study_technology,
                  study_organism, study_description, source_first_published, source_last_modified,
                  etl_created_at, etl_updated_at
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                ON CONFLICT(study_accession_code) DO UPDATE SET
                  study_title=excluded.study_title,
                  study_pubmed_id=excluded.study_pubmed_id,
                  study_technology=excluded.study_technology,
                  study_organism=excluded.study_organism,
                  study_description=excluded.study_description,
                  source_first_published=excluded.source_first_published,
                  source_last_modified=excluded.source_last_modified,
                  etl_updated_at=excluded.etl_updated_at
                RETURNING study_key
                ",
                params![
                    study.accession_code,
                    study.title,
                    study.pubmed_id,
                    study.technology,
                    study.organism,
                    study.description,
                    study.first_published,
                    study.last_modified,
                    now,
                ],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to upsert study {}", study.accession_code))
    }

    pub(crate) fn upsert_platform(&self, platform: &PlatformRecord) -> Result<i64> {
        let now = now_utc_string();
        self.connection
            .query_row(
                "
                INSERT INTO dim_platform(
                  platform_accession, platform_name, manufacturer, measurement_technology,
                  etl_created_at, etl_updated_at
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?5)
                ON CONFLICT(platform_accession) DO UPDATE SET
                  platform_name=excluded.platform_name,
                  manufacturer=excluded.manufacturer,
                  measurement_technology=excluded.measurement_technology,
                  etl_updated_at=excluded.etl_updated_at
                RETURNING platform_key
                ",
                params![
                    platform.accession,
                    platform.name,
                    platform.manufacturer,
                    platform.measurement_technology.as_str(),
                    now,
                ],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to upsert platform {}", platform.accession))
    }

    /// All samples of a study are upserted in one transaction.
    pub(crate) fn upsert_samples(
        &mut self,
        samples: &[SampleRecord],
        study_key: i64,
        platform_key: i64,
        illness_keys: &ResolvedIllnessKeys,
        stats: &mut LoadStats,
    ) -> Result<BTreeMap<String, i64>> {
        let now = now_utc_string();
        let mut sample_keys = BTreeMap::new();
        let tx = self.connection.transaction()?;

        {
            let mut statement = tx.prepare(
                "
                INSERT INTO dim_sample(
                  sample_accession_code, sample_title, sample_organism, sample_platform,
                  sample_treatment, sample_cell_line, sample_tissue, is_processed,
                  processor_name, processor_version, illness_label, illness_inference_method,
                  illness_key, study_key, platform_key, etl_created_at, etl_updated_at
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
                ON CONFLICT(sample_accession_code) DO UPDATE SET
                  sample_title=excluded.sample_title,
                  sample_organism=excluded.sample_organism,
                  sample_platform=excluded.sample_platform,
                  sample_treatment=excluded.sample_treatment,
                  sample_cell_line=excluded.sample_cell_line,
                  sample_tissue=excluded.sample_tissue,
                  is_processed=excluded.is_processed,
                  processor_name=excluded.processor_name,
                  processor_version=excluded.processor_version,
                  illness_label=excluded.illness_label,
                  illness_inference_method=excluded.illness_inference_method,
                  illness_key=excluded.illness_key,
                  study_key=excluded.study_key,
                  platform_key=excluded.platform_key,
                  etl_updated_at=excluded.etl_updated_at
                RETURNING sample_key
                ",
            )?;

            for sample in samples {
                let illness_key = match illness_keys.key_for(&sample.illness_label) {
                    Some(key) => key.clone(),
                    None => {
                        let warning = format!(
                            "no illness key for {} (label {}) and no UNKNOWN key; storing NULL",
                            sample.accession_code, sample.illness_label
                        );
                        warn!(warning = %warning, "illness key warning");
                        stats.warnings.push(warning);
                        IllnessKey::Null
                    }
                };

                let sample_key: i64 = statement
                    .query_row(
                        params![
                            sample.accession_code,
                            sample.title,
                            sample.organism,
                            sample.platform,
                            sample.treatment,
                            sample.cell_line,
                            sample.tissue,
                            sample.is_processed,
                            sample.processor_name,
                            sample.processor_version,
                            sample.illness_label,
                            sample.illness_inference_method.as_str(),
                            illness_key,
                            study_key,
                            platform_key,
                            now,
                        ],
                        |row| row.get(0),
                    )
                    .with_context(|| format!("failed to upsert sample {}", sample.accession_code))?;

                sample_keys.insert(sample.accession_code.clone(), sample_key);
            }
        }

        tx.commit()?;
        debug!(samples = sample_keys.len(), "upserted sample dimension");
        Ok(sample_keys)
    }

    /// Pulls one matrix batch at a time and commits after each one. Rows
    /// whose sample has no key are counted and skipped.
    pub(crate) fn load_expression<I>(
        &mut self,
        batches: I,
        sample_keys: &BTreeMap<String, i64>,
        batch_id: &str,
        stats: &mut LoadStats,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Result<Vec<ExpressionRecord>>>,
    {
        let mut unmapped_codes = BTreeSet::new();

        for (batch_index, batch) in batches.into_iter().enumerate() {
            let batch = batch.with_context(|| format!("failed to read matrix batch {batch_index}"))?;
            stats.records_read += batch.len();

            let mut mapped = Vec::with_capacity(batch.len());
            for record in batch {
                match sample_keys.get(&record.sample_accession_code) {
                    Some(sample_key) => mapped.push((*sample_key, record)),
                    None => {
                        stats.records_unmapped += 1;
                        if unmapped_codes.insert(record.sample_accession_code.clone()) {
                            warn!(
                                sample = %record.sample_accession_code,
                                "expression rows for sample without a sample key are skipped"
                            );
                        }
                    }
                }
            }

            if mapped.is_empty() {
                continue;
            }

            let loaded_at = now_utc_string();
            let tx = self.connection.transaction()?;
            {
                let mut statement = tx.prepare_cached(
                    "
                    INSERT INTO staging_expression_rows(
                      study_accession_code, batch_id, gene_id, sample_accession_code, sample_key,
                      expression_value, file_name, file_hash, loaded_at
                    )
                    VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    ",
                )?;

                for (sample_key, record) in &mapped {
                    statement.execute(params![
                        record.study_accession_code,
                        batch_id,
                        record.gene_id,
                        record.sample_accession_code,
                        sample_key,
                        record.expression_value,
                        record.file_name,
                        record.file_hash,
                        loaded_at,
                    ])?;
                }
            }
            tx.commit()
                .with_context(|| format!("failed to commit matrix batch {batch_index}"))?;

            stats.records_inserted += mapped.len();
            stats.batches_committed += 1;
            debug!(
                batch = batch_index,
                rows = mapped.len(),
                total = stats.records_inserted,
                "committed expression batch"
            );
        }

        if !unmapped_codes.is_empty() {
            let warning = format!(
                "{} expression rows dropped for {} unmapped samples",
                stats.records_unmapped,
                unmapped_codes.len()
            );
            warn!(warning = %warning, "unmapped expression rows");
            stats.warnings.push(warning);
        }
        stats.unmapped_sample_codes = unmapped_codes.into_iter().collect();

        Ok(())
    }

    /// Append-only: every run adds a QC row.
    pub(crate) fn load_qc_metrics(&self, study_key: i64, batch_id: &str, qc: &QcMetrics) -> Result<()> {
        self.connection
            .execute(
                "
                INSERT INTO meta_study_qc(
                  study_key, batch_id, ks_statistic, ks_pvalue, ks_warning,
                  quantile_normalized, quant_sf_only, loaded_at
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
                params![
                    study_key,
                    batch_id,
                    qc.ks_statistic,
                    qc.ks_pvalue,
                    qc.ks_warning,
                    qc.quantile_normalized,
                    qc.quant_sf_only,
                    now_utc_string(),
                ],
            )
            .context("failed to insert study QC metrics")?;
        Ok(())
    }
}

impl Drop for WarehouseLoader {
    fn drop(&mut self) {
        info!(path = %self.path.display(), "warehouse connection closed");
    }
}
