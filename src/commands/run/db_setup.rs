use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::util::now_utc_string;

pub(crate) const DB_SCHEMA_VERSION: &str = "0.1.0";

/// Warehouse tables in load order, as reported by `status`.
pub(crate) const WAREHOUSE_TABLES: &[&str] = &[
    "dim_study",
    "dim_platform",
    "dim_illness",
    "dim_sample",
    "staging_expression_rows",
    "meta_study_qc",
];

pub(crate) fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

pub(crate) fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dim_study (
              study_key INTEGER PRIMARY KEY AUTOINCREMENT,
              study_accession_code TEXT NOT NULL UNIQUE,
              study_title TEXT,
              study_pubmed_id TEXT,
              study_technology TEXT,
              study_organism TEXT,
              study_description TEXT,
              source_first_published TEXT,
              source_last_modified TEXT,
              etl_created_at TEXT NOT NULL,
              etl_updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dim_platform (
              platform_key INTEGER PRIMARY KEY AUTOINCREMENT,
              platform_accession TEXT NOT NULL UNIQUE,
              platform_name TEXT,
              manufacturer TEXT,
              measurement_technology TEXT,
              etl_created_at TEXT NOT NULL,
              etl_updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dim_illness (
              illness_key INTEGER PRIMARY KEY,
              illness_label TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS dim_sample (
              sample_key INTEGER PRIMARY KEY AUTOINCREMENT,
              sample_accession_code TEXT NOT NULL UNIQUE,
              sample_title TEXT,
              sample_organism TEXT,
              sample_platform TEXT,
              sample_treatment TEXT,
              sample_cell_line TEXT,
              sample_tissue TEXT,
              is_processed INTEGER NOT NULL DEFAULT 0,
              processor_name TEXT,
              processor_version TEXT,
              illness_label TEXT NOT NULL,
              illness_inference_method TEXT NOT NULL,
              illness_key,
              study_key INTEGER NOT NULL,
              platform_key INTEGER NOT NULL,
              etl_created_at TEXT NOT NULL,
              etl_updated_at TEXT NOT NULL,
              FOREIGN KEY(study_key) REFERENCES dim_study(study_key),
              FOREIGN KEY(platform_key) REFERENCES dim_platform(platform_key)
            );

            CREATE TABLE IF NOT EXISTS staging_expression_rows (
              row_id INTEGER PRIMARY KEY AUTOINCREMENT,
              study_accession_code TEXT NOT NULL,
              batch_id TEXT NOT NULL,
              gene_id TEXT NOT NULL,
              sample_accession_code TEXT NOT NULL,
              sample_key INTEGER NOT NULL,
              expression_value REAL,
              file_name TEXT NOT NULL,
              file_hash TEXT NOT NULL,
              loaded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta_study_qc (
              qc_id INTEGER PRIMARY KEY AUTOINCREMENT,
              study_key INTEGER NOT NULL,
              batch_id TEXT NOT NULL,
              ks_statistic REAL,
              ks_pvalue REAL,
              ks_warning TEXT,
              quantile_normalized INTEGER NOT NULL DEFAULT 0,
              quant_sf_only INTEGER NOT NULL DEFAULT 0,
              loaded_at TEXT NOT NULL,
              FOREIGN KEY(study_key) REFERENCES dim_study(study_key)
            );

            CREATE INDEX IF NOT EXISTS idx_sample_study ON dim_sample(study_key);
            CREATE INDEX IF NOT EXISTS idx_expression_batch ON staging_expression_rows(batch_id);
            CREATE INDEX IF NOT EXISTS idx_expression_study_sample
              ON staging_expression_rows(study_accession_code, sample_accession_code);
            CREATE INDEX IF NOT EXISTS idx_qc_study ON meta_study_qc(study_key);
            ",
        )
        .context("failed to initialize warehouse schema")?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}

pub(crate) fn count_rows(connection: &Connection, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    connection
        .query_row(&sql, [], |row| row.get(0))
        .with_context(|| format!("failed to count rows in {table}"))
}
