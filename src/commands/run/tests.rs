use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::{TimeZone, Utc};
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value, json};

use crate::config::{EtlConfig, IllnessRule, ManufacturerTable, default_illness_rules};
use crate::model::{InferenceMethod, LoadStats, UNKNOWN_ILLNESS};
use crate::technology::MeasurementTechnology;
use crate::util::sha256_file;

use super::*;

const MATRIX: &str = "Gene\tS1\tS2\nG1\t1.5\t2.5\nG2\t3.0\tNA\nG3\t0\t-1.25\n";

struct Fixture {
    _dir: tempfile::TempDir,
    config: EtlConfig,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = EtlConfig::new(dir.path().join("warehouse.sqlite"));
        config.base_path = dir.path().join("raw");
        fs::create_dir_all(&config.base_path).expect("create base path");
        Self { _dir: dir, config }
    }

    fn write_matrix(&self, study_code: &str, body: &str) -> PathBuf {
        let path = self.config.study_file_paths(study_code).expression;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create study dir");
        }
        fs::write(&path, body).expect("write matrix");
        path
    }

    fn write_metadata(&self, document: &Value) {
        let path = self.config.base_path.join(&self.config.json_metadata_file);
        fs::write(path, serde_json::to_vec_pretty(document).expect("serialize"))
            .expect("write metadata");
    }

    fn connect(&self, study_code: &str) -> WarehouseLoader {
        WarehouseLoader::connect(&self.config.warehouse_path, study_code).expect("connect")
    }
}

fn experiment(study_code: &str, samples: &[&str]) -> Value {
    json!({
        "accession_code": study_code,
        "title": format!("Sepsis cohort {study_code}"),
        "technology": "RNA-SEQ",
        "organisms": ["HOMO_SAPIENS", "MUS_MUSCULUS"],
        "sample_accession_codes": samples,
        "platform": "Illumina HiSeq 2500 (GPL16791)",
        "pubmed_id": 12345,
    })
}

fn sample(title: &str) -> Value {
    json!({
        "refinebio_title": title,
        "refinebio_organism": "HOMO_SAPIENS",
        "refinebio_tissue": "whole blood",
        "refinebio_processed": true,
        "refinebio_processor_name": "Salmon",
    })
}

fn standard_document() -> Value {
    json!({
        "experiments": { "SRP001": experiment("SRP001", &["S1", "S2"]) },
        "samples": {
            "S1": sample("Patient with septic shock"),
            "S2": sample("Healthy control"),
        },
        "ks_statistic": 0.12,
        "ks_pvalue": 0.5,
        "quantile_normalized": true,
    })
}

fn transformed(config: &EtlConfig, study_code: &str) -> TransformedStudy {
    let extracted = extract_study(config, study_code).expect("extract");
    Transformer::from_config(config)
        .expect("transformer")
        .transform(extracted)
        .expect("transform")
}

fn rule(pattern: &str, label: &str, priority: i64) -> IllnessRule {
    IllnessRule {
        pattern: pattern.to_string(),
        label: label.to_string(),
        priority,
        description: None,
    }
}

struct StaticRows(Vec<Vec<SqlValue>>);

impl IllnessKeySource for StaticRows {
    fn fetch_illness_rows(&self) -> Result<Vec<Vec<SqlValue>>> {
        Ok(self.0.clone())
    }
}

struct FailingSource;

impl IllnessKeySource for FailingSource {
    fn fetch_illness_rows(&self) -> Result<Vec<Vec<SqlValue>>> {
        bail!("warehouse unavailable")
    }
}

fn text(value: &str) -> SqlValue {
    SqlValue::Text(value.to_string())
}

#[test]
fn matrix_batches_cover_every_cell_for_any_batch_size() {
    let fixture = Fixture::new();
    let body = "Gene\tS1\tS2\tS3\nG1\t1\t2\t3\nG2\t4\t5\t6\nG3\t7\t8\t9\nG4\t1\t1\t1\nG5\t2\t2\t2\n";
    let path = fixture.write_matrix("SRP001", body);
    let expected_hash = sha256_file(&path).expect("hash");
    let single_row_records: Vec<_> = ExpressionBatches::open(&path, "SRP001", 1)
        .expect("open")
        .with_rows_per_batch(1)
        .collect::<Result<Vec<_>>>()
        .expect("batches")
        .into_iter()
        .flatten()
        .collect();

    for rows_per_batch in [1, 2, 3, 5, 10] {
        let batches: Vec<_> = ExpressionBatches::open(&path, "SRP001", 1)
            .expect("open")
            .with_rows_per_batch(rows_per_batch)
            .collect::<Result<_>>()
            .expect("batches");

        let total: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total, 15, "rows_per_batch={rows_per_batch}");
        assert_eq!(batches.len(), 5_usize.div_ceil(rows_per_batch));
        assert!(
            batches
                .iter()
                .flatten()
                .all(|record| record.file_hash == expected_hash && record.file_name == "SRP001.tsv")
        );

        let records: Vec<_> = batches.into_iter().flatten().collect();
        assert_eq!(records, single_row_records, "rows_per_batch={rows_per_batch}");
    }
}

#[test]
fn oversized_chunk_size_reads_the_matrix_in_one_batch() {
    let fixture = Fixture::new();
    let path = fixture.write_matrix("SRP001", MATRIX);

    let batches: Vec<_> = ExpressionBatches::open(&path, "SRP001", usize::MAX)
        .expect("open")
        .collect::<Result<_>>()
        .expect("batches");

    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 6);
}

#[test]
fn matrix_batch_size_follows_chunk_size_over_sample_count() {
    let fixture = Fixture::new();
    let body = "Gene\tS1\tS2\tS3\nG1\t1\t2\t3\nG2\t4\t5\t6\nG3\t7\t8\t9\nG4\t1\t1\t1\nG5\t2\t2\t2\n";
    let path = fixture.write_matrix("SRP001", body);

    let mut batches = ExpressionBatches::open(&path, "SRP001", 6).expect("open");
    let sizes: Vec<usize> = batches
        .by_ref()
        .map(|batch| batch.expect("batch").len())
        .collect();

    assert_eq!(sizes, vec![6, 6, 3]);
    assert_eq!(batches.rows_read(), 5);
}

#[test]
fn matrix_records_are_long_format_with_missing_values_as_null() {
    let fixture = Fixture::new();
    let path = fixture.write_matrix("SRP001", MATRIX);

    let records: Vec<_> = ExpressionBatches::open(&path, "SRP001", 100)
        .expect("open")
        .collect::<Result<Vec<_>>>()
        .expect("batches")
        .into_iter()
        .flatten()
        .collect();

    assert_eq!(records.len(), 6);
    assert_eq!(records[0].gene_id, "G1");
    assert_eq!(records[0].sample_accession_code, "S1");
    assert_eq!(records[0].expression_value, Some(1.5));
    assert_eq!(records[3].gene_id, "G2");
    assert_eq!(records[3].sample_accession_code, "S2");
    assert_eq!(records[3].expression_value, None);
    assert_eq!(records[5].expression_value, Some(-1.25));
    assert!(records.iter().all(|record| record.study_accession_code == "SRP001"));
}

#[test]
fn matrix_hash_is_stable_across_extractions() {
    let fixture = Fixture::new();
    let path = fixture.write_matrix("SRP001", MATRIX);

    let first = ExpressionBatches::open(&path, "SRP001", 100).expect("open");
    let second = ExpressionBatches::open(&path, "SRP001", 100).expect("open");

    assert_eq!(first.file_hash(), second.file_hash());
    assert_eq!(first.file_hash().len(), 64);
    assert_eq!(first.sample_codes(), ["S1", "S2"]);
}

#[test]
fn ragged_matrix_row_yields_one_error_then_ends() {
    let fixture = Fixture::new();
    let path = fixture.write_matrix("SRP001", "Gene\tS1\tS2\nG1\t1\t2\nG2\t3\nG3\t4\t5\n");

    let mut batches = ExpressionBatches::open(&path, "SRP001", 1)
        .expect("open")
        .with_rows_per_batch(1);

    assert_eq!(batches.next().map(|batch| batch.map(|b| b.len()).ok()), Some(Some(2)));
    let err = batches.next().expect("error item").err().expect("ragged row error");
    assert!(format!("{err:#}").contains("expected 3 columns"));
    assert!(batches.next().is_none());
}

#[test]
fn non_numeric_matrix_cell_is_a_format_error() {
    let fixture = Fixture::new();
    let path = fixture.write_matrix("SRP001", "Gene\tS1\nG1\thigh\n");

    let result: Result<Vec<_>> = ExpressionBatches::open(&path, "SRP001", 100)
        .expect("open")
        .collect();

    let err = result.err().expect("non-numeric error");
    assert!(format!("{err:#}").contains("non-numeric expression value"));
}

#[test]
fn matrix_without_sample_columns_is_rejected() {
    let fixture = Fixture::new();
    let path = fixture.write_matrix("SRP001", "Gene\nG1\n");

    assert!(ExpressionBatches::open(&path, "SRP001", 100).is_err());
}

#[test]
fn header_only_matrix_yields_no_batches() {
    let fixture = Fixture::new();
    let path = fixture.write_matrix("SRP001", "Gene\tS1\tS2\n");

    let mut batches = ExpressionBatches::open(&path, "SRP001", 100).expect("open");
    assert!(batches.next().is_none());
}

#[test]
fn illness_override_wins_over_title() {
    let overrides = HashMap::from([("GSM1".to_string(), "CONTROL".to_string())]);
    let engine = IllnessInferenceEngine::new(&default_illness_rules(), &overrides).expect("engine");

    assert_eq!(
        engine.infer("septic shock", "GSM1"),
        ("CONTROL".to_string(), InferenceMethod::Override)
    );
    assert_eq!(
        engine.infer("septic shock", "GSM2"),
        ("SEPTIC_SHOCK".to_string(), InferenceMethod::Regex)
    );
}

#[test]
fn default_illness_rules_classify_titles_in_priority_order() {
    let engine = IllnessInferenceEngine::new(&default_illness_rules(), &HashMap::new()).expect("engine");

    let cases = [
        ("Patient with septic shock", "SEPTIC_SHOCK", InferenceMethod::Regex),
        ("No sepsis sample", "NO_SEPSIS", InferenceMethod::Regex),
        ("Sepsis patient", "SEPSIS", InferenceMethod::Regex),
        ("Healthy control", "CONTROL", InferenceMethod::Regex),
        ("Unremarkable", UNKNOWN_ILLNESS, InferenceMethod::Default),
        ("", UNKNOWN_ILLNESS, InferenceMethod::Default),
    ];

    for (title, label, method) in cases {
        assert_eq!(engine.infer(title, "GSM1"), (label.to_string(), method), "{title}");
    }

    for title in ["SEPTIC SHOCK", "septic shock", "Septic Shock"] {
        assert_eq!(engine.infer(title, "GSM1").0, "SEPTIC_SHOCK");
    }
}

#[test]
fn illness_rules_are_sorted_once_and_ties_keep_configured_order() {
    let rules = vec![
        rule("alpha", "LATE", 3),
        rule("alpha", "FIRST", 1),
        rule("alpha", "SECOND", 1),
    ];
    let engine = IllnessInferenceEngine::new(&rules, &HashMap::new()).expect("engine");

    let labels: Vec<&str> = engine.rules().iter().map(|rule| rule.label.as_str()).collect();
    assert_eq!(labels, vec!["FIRST", "SECOND", "LATE"]);
    assert_eq!(engine.rules()[2].priority, 3);
    assert_eq!(engine.infer("Alpha cohort", "GSM1").0, "FIRST");
}

#[test]
fn invalid_illness_pattern_names_the_rule() {
    let err = IllnessInferenceEngine::new(&[rule("(unclosed", "BROKEN", 1)], &HashMap::new())
        .err()
        .expect("invalid pattern");

    assert!(err.to_string().contains("BROKEN"));
}

#[test]
fn platform_descriptor_with_accession_is_split() {
    let normalizer = PlatformNormalizer::new(&ManufacturerTable::default()).expect("normalizer");

    let platform = normalizer.normalize("Illumina Genome Analyzer (GPL1111)", Some("RNA-SEQ"));

    assert_eq!(platform.accession, "GPL1111");
    assert_eq!(platform.name, "Illumina Genome Analyzer");
    assert_eq!(platform.manufacturer, "Illumina");
    assert_eq!(platform.measurement_technology, MeasurementTechnology::RnaSeq);
}

#[test]
fn platform_descriptor_without_accession_is_used_whole() {
    let normalizer = PlatformNormalizer::new(&ManufacturerTable::default()).expect("normalizer");

    let platform = normalizer.normalize("Illumina HiSeq", None);
    assert_eq!(platform.accession, "Illumina HiSeq");
    assert_eq!(platform.name, "Illumina HiSeq");

    let unknown = normalizer.normalize("Custom Spotted Array (GPL9)", None);
    assert_eq!(unknown.manufacturer, "Unknown");
    assert_eq!(unknown.measurement_technology, MeasurementTechnology::Microarray);

    let agilent = normalizer.normalize("AGILENT whole genome (GPL6480)", Some("MICROARRAY"));
    assert_eq!(agilent.manufacturer, "Agilent");
}

#[test]
fn manufacturer_table_order_decides_between_keywords() {
    let table = ManufacturerTable(vec![
        ("hiseq".to_string(), "HiSeq Vendor".to_string()),
        ("illumina".to_string(), "Illumina".to_string()),
    ]);
    let normalizer = PlatformNormalizer::new(&table).expect("normalizer");

    assert_eq!(normalizer.normalize("Illumina HiSeq 2500", None).manufacturer, "HiSeq Vendor");
}

#[test]
fn missing_illness_source_uses_built_in_keys() {
    let resolved = resolve_illness_keys(None);

    assert_eq!(resolved.keys, fallback_illness_keys());
    assert_eq!(resolved.source_name(), "fallback");
    assert_eq!(resolved.key_for("SEPTIC_SHOCK"), Some(&IllnessKey::Id(3)));
}

#[test]
fn failing_or_unusable_illness_sources_use_built_in_keys() {
    let empty = StaticRows(Vec::new());
    let bad_shape = StaticRows(vec![vec![text("CONTROL"), SqlValue::Integer(1), text("extra")]]);
    let blank_labels = StaticRows(vec![
        vec![text("  "), SqlValue::Integer(1)],
        vec![SqlValue::Null, SqlValue::Integer(2)],
    ]);

    let sources: [&dyn IllnessKeySource; 4] = [&FailingSource, &empty, &bad_shape, &blank_labels];
    for source in sources {
        let resolved = resolve_illness_keys(Some(source));
        assert_eq!(resolved.keys, fallback_illness_keys());
        assert!(resolved.fallback_reason.is_some());
    }
}

#[test]
fn warehouse_illness_rows_are_normalized() {
    let source = StaticRows(vec![
        vec![text(" control "), text("10")],
        vec![text("SEPSIS"), SqlValue::Real(11.0)],
        vec![text("Other"), text("x-12")],
        vec![text("UNKNOWN"), SqlValue::Integer(0)],
    ]);

    let resolved = resolve_illness_keys(Some(&source as &dyn IllnessKeySource));

    assert_eq!(resolved.source_name(), "warehouse");
    assert_eq!(resolved.keys.get("CONTROL"), Some(&IllnessKey::Id(10)));
    assert_eq!(resolved.keys.get("SEPSIS"), Some(&IllnessKey::Id(11)));
    assert_eq!(resolved.keys.get("OTHER"), Some(&IllnessKey::Text("x-12".to_string())));
    assert_eq!(resolved.key_for("NO_SEPSIS"), Some(&IllnessKey::Id(0)));
}

#[test]
fn unmapped_label_without_unknown_key_has_no_key() {
    let source = StaticRows(vec![vec![text("CONTROL"), SqlValue::Integer(1)]]);
    let resolved = resolve_illness_keys(Some(&source as &dyn IllnessKeySource));

    assert_eq!(resolved.key_for("SEPSIS"), None);
}

#[test]
fn connection_serves_illness_rows_from_dimension_table() {
    let conn = Connection::open_in_memory().expect("in-memory db");
    ensure_schema(&conn).expect("schema");
    conn.execute_batch(
        "INSERT INTO dim_illness(illness_key, illness_label) VALUES (5, 'CONTROL'), (6, 'SEPSIS');",
    )
    .expect("seed illness");

    let resolved = resolve_illness_keys(Some(&conn as &dyn IllnessKeySource));

    assert_eq!(resolved.source_name(), "warehouse");
    assert_eq!(resolved.keys.len(), 2);
    assert_eq!(resolved.keys.get("SEPSIS"), Some(&IllnessKey::Id(6)));
}

#[test]
fn schema_creates_every_warehouse_table_and_version() {
    let conn = Connection::open_in_memory().expect("in-memory db");
    ensure_schema(&conn).expect("schema");
    ensure_schema(&conn).expect("schema is re-runnable");

    for table in WAREHOUSE_TABLES {
        assert_eq!(count_rows(&conn, table).expect("count"), 0, "{table}");
    }
    let version: String = conn
        .query_row("SELECT value FROM metadata WHERE key = 'db_schema_version'", [], |row| row.get(0))
        .expect("schema version");
    assert_eq!(version, super::DB_SCHEMA_VERSION);
}

#[test]
fn metadata_without_study_is_an_extraction_error() {
    let fixture = Fixture::new();
    fixture.write_metadata(&standard_document());
    fixture.write_matrix("SRP404", MATRIX);

    let err = extract_study(&fixture.config, "SRP404").err().expect("missing study");

    assert_eq!(err.stage(), "extract");
    assert!(err.to_string().contains("study code SRP404 not found"));
}

#[test]
fn missing_matrix_is_an_extraction_error() {
    let fixture = Fixture::new();
    fixture.write_metadata(&standard_document());

    let err = extract_study(&fixture.config, "SRP001").err().expect("missing matrix");
    assert_eq!(err.stage(), "extract");
}

#[test]
fn metadata_qc_fields_default_when_absent() {
    let document = json!({ "experiments": { "SRP001": {} } });

    let metadata = parse_metadata_document(&document, "SRP001").expect("metadata");

    assert!(metadata.samples.is_empty());
    assert_eq!(metadata.qc_metrics.ks_statistic, None);
    assert!(!metadata.qc_metrics.quantile_normalized);
    assert!(!metadata.qc_metrics.quant_sf_only);
    assert!(sample_count_warning(&metadata, "SRP001").is_none());
}

#[test]
fn extraction_warns_on_sample_count_mismatch() {
    let fixture = Fixture::new();
    let mut document = standard_document();
    document["experiments"]["SRP001"]["sample_accession_codes"] = json!(["S1", "S2", "S3"]);
    fixture.write_metadata(&document);
    fixture.write_matrix("SRP001", MATRIX);

    let extracted = extract_study(&fixture.config, "SRP001").expect("extract");

    assert_eq!(extracted.stats.declared_sample_count, 3);
    assert_eq!(extracted.stats.metadata_sample_count, 2);
    assert_eq!(extracted.stats.matrix_sample_count, 2);
    assert!(extracted.stats.warnings[0].contains("sample count mismatch"));
    assert_eq!(extracted.metadata.qc_metrics.ks_statistic, Some(0.12));
}

#[test]
fn experiment_without_accession_is_a_transformation_error() {
    let fixture = Fixture::new();
    let mut document = standard_document();
    document["experiments"]["SRP001"] = json!({ "title": "untitled" });
    fixture.write_metadata(&document);
    fixture.write_matrix("SRP001", MATRIX);

    let extracted = extract_study(&fixture.config, "SRP001").expect("extract");
    let err = Transformer::from_config(&fixture.config)
        .expect("transformer")
        .transform(extracted)
        .err()
        .expect("missing accession");

    assert_eq!(err.stage(), "transform");
}

#[test]
fn study_record_takes_first_organism_and_renders_pubmed_id() {
    let metadata = parse_metadata_document(&standard_document(), "SRP001").expect("metadata");

    let study = transform_study(&metadata.experiment).expect("study");

    assert_eq!(study.accession_code, "SRP001");
    assert_eq!(study.organism.as_deref(), Some("HOMO_SAPIENS"));
    assert_eq!(study.pubmed_id.as_deref(), Some("12345"));
}

#[test]
fn samples_carry_inferred_illness_and_method_counts() {
    let overrides = HashMap::from([("S2".to_string(), "SEPSIS".to_string())]);
    let transformer = Transformer::new(
        IllnessInferenceEngine::new(&default_illness_rules(), &overrides).expect("engine"),
        PlatformNormalizer::new(&ManufacturerTable::default()).expect("normalizer"),
    );
    let samples: Map<String, Value> = json!({
        "S1": sample("Patient with septic shock"),
        "S2": sample("Healthy control"),
        "S3": { "refinebio_title": null },
    })
    .as_object()
    .cloned()
    .expect("object");

    let (records, stats) = transformer.transform_samples(&samples, "SRP001");

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].illness_label, "SEPTIC_SHOCK");
    assert_eq!(records[1].illness_label, "SEPSIS");
    assert_eq!(records[1].illness_inference_method, InferenceMethod::Override);
    assert_eq!(records[2].illness_label, UNKNOWN_ILLNESS);
    assert!(records[0].is_processed);
    assert!(!records[2].is_processed);
    assert_eq!(records[0].tissue.as_deref(), Some("whole blood"));
    assert_eq!(stats.samples_processed, 3);
    assert_eq!(stats.illness_by_method.get(&InferenceMethod::Regex), Some(&1));
    assert_eq!(stats.illness_by_method.get(&InferenceMethod::Override), Some(&1));
    assert_eq!(stats.illness_by_method.get(&InferenceMethod::Default), Some(&1));
}

#[test]
fn samples_follow_metadata_document_order() {
    let fixture = Fixture::new();
    let raw = r#"{
        "experiments": {
            "SRP001": {
                "accession_code": "SRP001",
                "technology": "RNA-SEQ",
                "platform": "Illumina HiSeq 2500 (GPL16791)",
                "sample_accession_codes": ["Z9", "A1", "M5"]
            }
        },
        "samples": {
            "Z9": { "refinebio_title": "septic shock" },
            "A1": { "refinebio_title": "healthy control" },
            "M5": { "refinebio_title": "sepsis" }
        }
    }"#;
    let document: Value = serde_json::from_str(raw).expect("metadata json");

    let metadata = parse_metadata_document(&document, "SRP001").expect("metadata");
    let keys: Vec<&str> = metadata.samples.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["Z9", "A1", "M5"]);

    let transformer = Transformer::from_config(&fixture.config).expect("transformer");
    let (records, _) = transformer.transform_samples(&metadata.samples, "SRP001");
    let accessions: Vec<&str> = records
        .iter()
        .map(|record| record.accession_code.as_str())
        .collect();
    assert_eq!(accessions, vec!["Z9", "A1", "M5"]);

    fs::write(
        fixture.config.base_path.join(&fixture.config.json_metadata_file),
        raw,
    )
    .expect("write metadata");
    fixture.write_matrix("SRP001", "Gene\tZ9\tA1\tM5\nG1\t1\t2\t3\n");

    let study = transformed(&fixture.config, "SRP001");
    let labels: Vec<(&str, &str)> = study
        .samples
        .iter()
        .map(|sample| (sample.accession_code.as_str(), sample.illness_label.as_str()))
        .collect();
    assert_eq!(
        labels,
        vec![("Z9", "SEPTIC_SHOCK"), ("A1", "CONTROL"), ("M5", "SEPSIS")]
    );
}

#[test]
fn batch_id_is_a_timestamp_salted_digest() {
    let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().expect("timestamp");
    let later = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 1).single().expect("timestamp");

    let batch_id = generate_batch_id("SRP001", ts);

    assert_eq!(batch_id.len(), 32);
    assert!(batch_id.chars().all(|ch| ch.is_ascii_hexdigit()));
    assert_eq!(batch_id, generate_batch_id("SRP001", ts));
    assert_ne!(batch_id, generate_batch_id("SRP001", later));
    assert_ne!(batch_id, generate_batch_id("SRP002", ts));
}

#[test]
fn reloading_a_study_keeps_dimension_keys_and_appends_facts() {
    let fixture = Fixture::new();
    fixture.write_metadata(&standard_document());
    fixture.write_matrix("SRP001", MATRIX);

    let first = {
        let mut loader = fixture.connect("SRP001");
        let report = loader.load_all(transformed(&fixture.config, "SRP001"));
        assert!(report.success(), "{:?}", report.failure);
        assert_eq!(report.stats.tables_loaded, 5);
        assert_eq!(report.stats.records_inserted, 6);
        report.dimension_keys.expect("keys")
    };

    let mut loader = fixture.connect("SRP001");
    let report = loader.load_all(transformed(&fixture.config, "SRP001"));
    assert!(report.success(), "{:?}", report.failure);
    let second = report.dimension_keys.expect("keys");

    assert_eq!(first.study_key, second.study_key);
    assert_eq!(first.platform_key, second.platform_key);
    assert_eq!(first.sample_keys, second.sample_keys);

    let conn = loader.connection();
    assert_eq!(count_rows(conn, "dim_study").expect("count"), 1);
    assert_eq!(count_rows(conn, "dim_platform").expect("count"), 1);
    assert_eq!(count_rows(conn, "dim_sample").expect("count"), 2);
    assert_eq!(count_rows(conn, "staging_expression_rows").expect("count"), 12);
    assert_eq!(count_rows(conn, "meta_study_qc").expect("count"), 2);

    let nulls: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM staging_expression_rows WHERE expression_value IS NULL",
            [],
            |row| row.get(0),
        )
        .expect("null count");
    assert_eq!(nulls, 2);

    let platform: (String, String, String) = conn
        .query_row(
            "SELECT platform_accession, manufacturer, measurement_technology FROM dim_platform",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .expect("platform row");
    assert_eq!(
        platform,
        ("GPL16791".to_string(), "Illumina".to_string(), "RNA-SEQ".to_string())
    );
}

#[test]
fn sample_illness_keys_come_from_fallback_when_dimension_is_empty() {
    let fixture = Fixture::new();
    fixture.write_metadata(&standard_document());
    fixture.write_matrix("SRP001", MATRIX);

    let mut loader = fixture.connect("SRP001");
    let report = loader.load_all(transformed(&fixture.config, "SRP001"));
    assert!(report.success());
    assert_eq!(report.stats.illness_key_source, "fallback");

    let key: i64 = loader
        .connection()
        .query_row(
            "SELECT illness_key FROM dim_sample WHERE sample_accession_code = 'S1'",
            [],
            |row| row.get(0),
        )
        .expect("illness key");
    assert_eq!(key, 3);
}

#[test]
fn sample_illness_keys_come_from_warehouse_when_seeded() {
    let fixture = Fixture::new();
    fixture.write_metadata(&standard_document());
    fixture.write_matrix("SRP001", MATRIX);

    let mut loader = fixture.connect("SRP001");
    loader
        .connection()
        .execute_batch(
            "INSERT INTO dim_illness(illness_key, illness_label)
             VALUES (0, 'UNKNOWN'), (10, 'CONTROL'), (13, 'SEPTIC_SHOCK');",
        )
        .expect("seed illness");

    let report = loader.load_all(transformed(&fixture.config, "SRP001"));
    assert!(report.success());
    assert_eq!(report.stats.illness_key_source, "warehouse");

    let mut statement = loader
        .connection()
        .prepare("SELECT illness_key FROM dim_sample ORDER BY sample_accession_code")
        .expect("prepare");
    let keys: Vec<i64> = statement
        .query_map([], |row| row.get(0))
        .expect("query")
        .collect::<rusqlite::Result<_>>()
        .expect("keys");
    assert_eq!(keys, vec![13, 10]);
}

#[test]
fn sample_without_any_illness_key_is_stored_with_null_key() {
    let fixture = Fixture::new();
    fixture.write_metadata(&standard_document());
    fixture.write_matrix("SRP001", MATRIX);
    let study = transformed(&fixture.config, "SRP001");

    let mut loader = fixture.connect("SRP001");
    let study_key = loader.upsert_study(&study.study).expect("study");
    let platform_key = loader.upsert_platform(&study.platform).expect("platform");
    let keys = ResolvedIllnessKeys {
        keys: [("CONTROL".to_string(), IllnessKey::Id(1))].into_iter().collect(),
        fallback_reason: None,
    };
    let mut stats = LoadStats::default();

    let sample_keys = loader
        .upsert_samples(&study.samples, study_key, platform_key, &keys, &mut stats)
        .expect("samples");

    assert_eq!(sample_keys.len(), 2);
    assert_eq!(stats.warnings.len(), 1);
    let key: Option<i64> = loader
        .connection()
        .query_row(
            "SELECT illness_key FROM dim_sample WHERE sample_accession_code = 'S1'",
            [],
            |row| row.get(0),
        )
        .expect("illness key");
    assert_eq!(key, None);
}

#[test]
fn unmapped_matrix_samples_are_counted_not_fatal() {
    let fixture = Fixture::new();
    fixture.write_metadata(&standard_document());
    fixture.write_matrix("SRP001", "Gene\tS1\tS2\tS9\nG1\t1\t2\t3\nG2\t4\t5\t6\n");

    let study = transformed(&fixture.config, "SRP001");
    let mut loader = fixture.connect("SRP001");
    let report = loader.load_all(study);

    assert!(report.success());
    assert_eq!(report.stats.records_read, 6);
    assert_eq!(report.stats.records_inserted, 4);
    assert_eq!(report.stats.records_unmapped, 2);
    assert_eq!(report.stats.unmapped_sample_codes, vec!["S9".to_string()]);
    assert_eq!(
        count_rows(loader.connection(), "staging_expression_rows").expect("count"),
        4
    );
}

#[test]
fn mid_load_failure_keeps_committed_batches() {
    let mut fixture = Fixture::new();
    fixture.config.chunk_size = 2;
    fixture.write_metadata(&standard_document());
    fixture.write_matrix("SRP001", "Gene\tS1\tS2\nG1\t1\t2\nG2\tx\t3\n");

    let study = transformed(&fixture.config, "SRP001");
    let mut loader = fixture.connect("SRP001");
    let report = loader.load_all(study);

    assert!(!report.success());
    assert!(report.dimension_keys.is_none());
    assert_eq!(report.stats.batches_committed, 1);
    assert_eq!(report.stats.errors.len(), 1);
    let failure = report.failure.expect("failure");
    assert!(format!("{failure:#}").contains("non-numeric expression value"));
    assert_eq!(
        count_rows(loader.connection(), "staging_expression_rows").expect("count"),
        2
    );
    assert_eq!(count_rows(loader.connection(), "meta_study_qc").expect("count"), 0);
}

fn three_study_fixture() -> Fixture {
    let fixture = Fixture::new();
    fixture.write_metadata(&json!({
        "experiments": {
            "SRP001": experiment("SRP001", &["S1", "S2"]),
            "SRP003": experiment("SRP003", &["S3", "S4"]),
        },
        "samples": {
            "S1": sample("Sepsis patient"),
            "S2": sample("Healthy control"),
            "S3": sample("septic shock day 1"),
            "S4": sample("non-sepsis ICU"),
        },
    }));
    fixture.write_matrix("SRP001", "Gene\tS1\tS2\nG1\t1\t2\nG2\t3\t4\n");
    fixture.write_matrix("SRP002", "Gene\tS1\nG1\t1\n");
    fixture.write_matrix("SRP003", "Gene\tS3\tS4\nG1\t5\t6\nG2\t7\t8\n");
    fixture
}

#[test]
fn failing_study_does_not_stop_the_batch() {
    let fixture = three_study_fixture();
    let orchestrator = EtlOrchestrator::new(fixture.config.clone()).expect("orchestrator");

    let report = orchestrator.execute_batch(None).expect("batch");

    assert_eq!(report.studies_requested, 3);
    assert_eq!(report.studies_processed, 2);
    assert_eq!(report.studies_failed, 1);
    assert!(!report.succeeded());
    assert_eq!(report.total_records_processed, 8);

    let codes: Vec<&str> = report
        .study_results
        .iter()
        .map(|result| result.study_code.as_str())
        .collect();
    assert_eq!(codes, vec!["SRP001", "SRP002", "SRP003"]);

    let failed = &report.study_results[1];
    assert!(!failed.success);
    assert_eq!(failed.failed_stage.as_deref(), Some("extract"));
    assert!(!failed.trace.is_empty());
    assert!(failed.load_stats.is_none());
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("study SRP002:"));

    let succeeded = &report.study_results[2];
    assert!(succeeded.success);
    assert_eq!(succeeded.batch_id.as_deref().map(str::len), Some(32));
    assert!(succeeded.duration_seconds > 0.0);
}

#[test]
fn explicit_study_codes_skip_discovery() {
    let fixture = three_study_fixture();
    let orchestrator = EtlOrchestrator::new(fixture.config.clone()).expect("orchestrator");

    let report = orchestrator
        .execute_batch(Some(vec!["SRP003".to_string()]))
        .expect("batch");

    assert!(report.succeeded());
    assert_eq!(report.studies_requested, 1);
    assert_eq!(report.total_records_processed, 4);
}

#[test]
fn load_stage_failure_is_reported_as_load_error() {
    let fixture = Fixture::new();
    fixture.write_metadata(&standard_document());
    fixture.write_matrix("SRP001", "Gene\tS1\tS2\nG1\tbad\t2\n");
    let orchestrator = EtlOrchestrator::new(fixture.config.clone()).expect("orchestrator");

    let result = orchestrator.execute_study("SRP001");

    assert!(!result.success);
    assert_eq!(result.failed_stage.as_deref(), Some("load"));
    assert!(result.error.as_deref().is_some_and(|error| error.starts_with("load failed for SRP001")));
    let load_stats = result.load_stats.expect("load stats");
    assert_eq!(load_stats.errors.len(), 1);
    assert_eq!(load_stats.records_inserted, 0);
}
