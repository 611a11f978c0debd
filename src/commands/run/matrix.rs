use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, bail};
use csv::{ReaderBuilder, StringRecordsIntoIter};
use tracing::debug;

use crate::model::ExpressionRecord;
use crate::util::sha256_file;

const MISSING_VALUE_TOKENS: &[&str] = &["", "na", "n/a", "nan", "null"];

// Upper bound on records reserved up front; larger batches grow on demand.
const MAX_BATCH_PREALLOC: usize = 64 * 1024;

/// Lazy wide-to-long reshaping of a tab-delimited gene × sample matrix.
///
/// Each item is one batch of long-format records built from at most
/// `rows_per_batch` gene rows. The file checksum is taken once, up front, and
/// stamped on every record. A format error is yielded once and ends the
/// stream.
pub(crate) struct ExpressionBatches {
    rows: StringRecordsIntoIter<File>,
    sample_codes: Vec<String>,
    study_code: String,
    file_hash: String,
    file_name: String,
    rows_per_batch: usize,
    rows_read: usize,
    finished: bool,
}

impl ExpressionBatches {
    /// `chunk_size` is the target number of long-format records per batch.
    pub(crate) fn open(path: &Path, study_code: &str, chunk_size: usize) -> Result<Self> {
        let file_hash = sha256_file(path)?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .flexible(true)
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("failed to open expression matrix {}", path.display()))?;

        let headers = reader
            .headers()
            .with_context(|| format!("failed to read matrix header in {}", path.display()))?
            .clone();

        let sample_codes: Vec<String> = headers
            .iter()
            .skip(1)
            .map(|code| code.trim().to_string())
            .collect();

        if sample_codes.is_empty() {
            bail!(
                "expression matrix {} has no sample columns after the gene column",
                path.display()
            );
        }

        let rows_per_batch = (chunk_size / sample_codes.len()).max(1);
        debug!(
            file = %file_name,
            samples = sample_codes.len(),
            rows_per_batch,
            "opened expression matrix"
        );

        Ok(Self {
            rows: reader.into_records(),
            sample_codes,
            study_code: study_code.to_string(),
            file_hash,
            file_name,
            rows_per_batch,
            rows_read: 0,
            finished: false,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_rows_per_batch(mut self, rows_per_batch: usize) -> Self {
        self.rows_per_batch = rows_per_batch.max(1);
        self
    }

    pub(crate) fn sample_codes(&self) -> &[String] {
        &self.sample_codes
    }

    pub(crate) fn file_hash(&self) -> &str {
        &self.file_hash
    }

    pub(crate) fn file_name(&self) -> &str {
        &self.file_name
    }

    #[cfg(test)]
    pub(crate) fn rows_read(&self) -> usize {
        self.rows_read
    }

    fn next_batch(&mut self) -> Result<Option<Vec<ExpressionRecord>>> {
        let capacity = self
            .rows_per_batch
            .saturating_mul(self.sample_codes.len())
            .min(MAX_BATCH_PREALLOC);
        let mut batch = Vec::with_capacity(capacity);
        let mut rows_in_batch = 0;

        while rows_in_batch < self.rows_per_batch {
            let Some(row) = self.rows.next() else {
                break;
            };
            let row = row.with_context(|| {
                format!("failed to read row {} of {}", self.rows_read + 2, self.file_name)
            })?;
            let line = row
                .position()
                .map(|position| position.line())
                .unwrap_or((self.rows_read + 2) as u64);

            if row.len() != self.sample_codes.len() + 1 {
                bail!(
                    "{} line {line}: expected {} columns, found {}",
                    self.file_name,
                    self.sample_codes.len() + 1,
                    row.len()
                );
            }

            let gene_id = row.get(0).unwrap_or_default().trim().to_string();
            for (sample_code, cell) in self.sample_codes.iter().zip(row.iter().skip(1)) {
                let expression_value = parse_expression_value(cell).with_context(|| {
                    format!(
                        "{} line {line}: invalid value for gene {gene_id}, sample {sample_code}",
                        self.file_name
                    )
                })?;

                batch.push(ExpressionRecord {
                    gene_id: gene_id.clone(),
                    sample_accession_code: sample_code.clone(),
                    expression_value,
                    study_accession_code: self.study_code.clone(),
                    file_hash: self.file_hash.clone(),
                    file_name: self.file_name.clone(),
                });
            }

            rows_in_batch += 1;
            self.rows_read += 1;
        }

        if rows_in_batch == 0 {
            return Ok(None);
        }

        Ok(Some(batch))
    }
}

impl Iterator for ExpressionBatches {
    type Item = Result<Vec<ExpressionRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

fn parse_expression_value(cell: &str) -> Result<Option<f64>> {
    let trimmed = cell.trim();
    if MISSING_VALUE_TOKENS
        .iter()
        .any(|token| trimmed.eq_ignore_ascii_case(token))
    {
        return Ok(None);
    }

    let value = trimmed
        .parse::<f64>()
        .with_context(|| format!("non-numeric expression value {trimmed:?}"))?;
    Ok(Some(value))
}
