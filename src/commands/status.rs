use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::run::{DB_SCHEMA_VERSION, WAREHOUSE_TABLES, count_rows};
use crate::config::EtlConfig;

pub fn run(args: StatusArgs) -> Result<()> {
    let config = EtlConfig::from_yaml_file(&args.config)?;
    let db_path = &config.warehouse_path;

    info!(config = %args.config.display(), "status requested");

    if !db_path.exists() {
        warn!(path = %db_path.display(), "warehouse file missing");
        return Ok(());
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;

    let schema_version = metadata_value(&conn, "db_schema_version")?;
    let updated_at = metadata_value(&conn, "db_updated_at")?;
    info!(
        path = %db_path.display(),
        schema_version = %schema_version.as_deref().unwrap_or("-"),
        expected_schema_version = DB_SCHEMA_VERSION,
        updated_at = %updated_at.as_deref().unwrap_or("-"),
        "warehouse status"
    );

    for table in WAREHOUSE_TABLES {
        match count_rows(&conn, table) {
            Ok(rows) => info!(table = %table, rows, "table status"),
            Err(err) => warn!(table = %table, error = %format!("{err:#}"), "table unavailable"),
        }
    }

    Ok(())
}

fn metadata_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    let has_metadata: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'metadata'",
        [],
        |row| row.get(0),
    )?;
    if !has_metadata {
        return Ok(None);
    }

    conn.query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| row.get(0))
        .optional()
        .with_context(|| format!("failed to read metadata key {key}"))
}
