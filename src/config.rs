use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::EtlError;

pub const DEFAULT_STUDY_CODE_PATTERN: &str = r"[A-Za-z]{2,3}-[A-Za-z]{3}-\d+|[A-Za-z]{3}\d+";
pub const DEFAULT_METADATA_FILE: &str = "aggregated_metadata.json";
pub const DEFAULT_EXPRESSION_TEMPLATE: &str = "{study_code}/{study_code}.tsv";
pub const STUDY_CODE_PLACEHOLDER: &str = "{study_code}";
pub const DEFAULT_CHUNK_SIZE: usize = 50_000;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 7_200;
pub const DEFAULT_LOG_BACKUP_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IllnessRule {
    pub pattern: String,
    pub label: String,
    pub priority: i64,
    #[serde(default)]
    pub description: Option<String>,
}

impl IllnessRule {
    fn new(pattern: &str, label: &str, priority: i64, description: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            label: label.to_string(),
            priority,
            description: Some(description.to_string()),
        }
    }
}

pub fn default_illness_rules() -> Vec<IllnessRule> {
    vec![
        IllnessRule::new(
            r"\b(septic\s*shock|sshock|septic_shock|shock)\b",
            "SEPTIC_SHOCK",
            1,
            "Septic shock indicators",
        ),
        IllnessRule::new(
            r"\bno[-_\s]?sepsis\b|\bnon[-_\s]?sepsis\b",
            "NO_SEPSIS",
            2,
            "No sepsis indicators",
        ),
        IllnessRule::new(r"\bsepsis\b", "SEPSIS", 3, "Sepsis indicators"),
        IllnessRule::new(
            r"\bcontrol\b|\bhealthy\b",
            "CONTROL",
            4,
            "Control/healthy samples",
        ),
    ]
}

/// Ordered keyword → display-name table. Order is significant: the first
/// keyword found in a platform name decides the manufacturer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManufacturerTable(pub Vec<(String, String)>);

impl Default for ManufacturerTable {
    fn default() -> Self {
        Self(vec![
            ("illumina".to_string(), "Illumina".to_string()),
            ("affymetrix".to_string(), "Affymetrix".to_string()),
            ("agilent".to_string(), "Agilent".to_string()),
        ])
    }
}

impl<'de> Deserialize<'de> for ManufacturerTable {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OrderedPairs;

        impl<'de> Visitor<'de> for OrderedPairs {
            type Value = ManufacturerTable;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a mapping of keyword to manufacturer name")
            }

            fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((keyword, manufacturer)) =
                    access.next_entry::<String, String>()?
                {
                    entries.push((keyword, manufacturer));
                }
                Ok(ManufacturerTable(entries))
            }
        }

        deserializer.deserialize_map(OrderedPairs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformLookup {
    #[serde(default)]
    pub manufacturer: ManufacturerTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcThresholds {
    pub max_null_percentage: f64,
    pub max_duplicate_percentage: f64,
    pub min_genes_per_sample: u64,
    pub min_samples_per_study: u64,
}

impl Default for QcThresholds {
    fn default() -> Self {
        Self {
            max_null_percentage: 0.1,
            max_duplicate_percentage: 0.05,
            min_genes_per_sample: 1000,
            min_samples_per_study: 3,
        }
    }
}

/// How often `log_file` is rolled over to a new, date-suffixed file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// A single file, appended to across runs.
    Never,
    Hourly,
    #[default]
    Daily,
}

#[derive(Debug, Clone, Deserialize)]
struct IllnessInferenceSection {
    #[serde(default)]
    rules: Option<Vec<IllnessRule>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawEtlConfig {
    #[serde(alias = "connection_string")]
    warehouse_path: PathBuf,
    #[serde(default = "default_base_path")]
    base_path: PathBuf,
    #[serde(default = "default_study_code_pattern")]
    study_code_pattern: String,
    #[serde(default = "default_metadata_file")]
    json_metadata_file: String,
    #[serde(default = "default_expression_template")]
    expression_file_template: String,
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: u64,
    #[serde(default)]
    illness_inference_rules: Option<Vec<IllnessRule>>,
    #[serde(default)]
    illness_inference: Option<IllnessInferenceSection>,
    #[serde(default)]
    illness_overrides: HashMap<String, String>,
    #[serde(default)]
    platform_lookup: PlatformLookup,
    #[serde(default)]
    qc_thresholds: QcThresholds,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    log_file: Option<PathBuf>,
    #[serde(default)]
    log_rotation: LogRotation,
    #[serde(default = "default_log_backup_count")]
    log_backup_count: usize,
    #[serde(default)]
    report_path: Option<PathBuf>,
}

/// Pipeline configuration, normally read from YAML.
///
/// Illness rules may be given flat (`illness_inference_rules`) or nested
/// (`illness_inference.rules`); the flat key wins when present, and an empty
/// or missing rule list selects [`default_illness_rules`].
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "RawEtlConfig")]
pub struct EtlConfig {
    pub warehouse_path: PathBuf,
    pub base_path: PathBuf,
    pub study_code_pattern: String,
    pub json_metadata_file: String,
    pub expression_file_template: String,
    pub chunk_size: usize,
    /// Advisory only; no stage enforces it.
    pub timeout_seconds: u64,
    pub illness_inference_rules: Vec<IllnessRule>,
    pub illness_overrides: HashMap<String, String>,
    pub platform_lookup: PlatformLookup,
    pub qc_thresholds: QcThresholds,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub log_rotation: LogRotation,
    /// Rolled files kept next to the active one.
    pub log_backup_count: usize,
    pub report_path: Option<PathBuf>,
}

impl From<RawEtlConfig> for EtlConfig {
    fn from(raw: RawEtlConfig) -> Self {
        let nested_rules = raw.illness_inference.and_then(|section| section.rules);
        let rules = raw
            .illness_inference_rules
            .or(nested_rules)
            .filter(|rules| !rules.is_empty())
            .unwrap_or_else(default_illness_rules);

        Self {
            warehouse_path: raw.warehouse_path,
            base_path: raw.base_path,
            study_code_pattern: raw.study_code_pattern,
            json_metadata_file: raw.json_metadata_file,
            expression_file_template: raw.expression_file_template,
            chunk_size: raw.chunk_size,
            timeout_seconds: raw.timeout_seconds,
            illness_inference_rules: rules,
            illness_overrides: raw.illness_overrides,
            platform_lookup: raw.platform_lookup,
            qc_thresholds: raw.qc_thresholds,
            log_level: raw.log_level,
            log_file: raw.log_file,
            log_rotation: raw.log_rotation,
            log_backup_count: raw.log_backup_count,
            report_path: raw.report_path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyPaths {
    pub metadata: PathBuf,
    pub expression: PathBuf,
}

impl EtlConfig {
    #[cfg(test)]
    pub fn new(warehouse_path: impl Into<PathBuf>) -> Self {
        Self {
            warehouse_path: warehouse_path.into(),
            base_path: default_base_path(),
            study_code_pattern: default_study_code_pattern(),
            json_metadata_file: default_metadata_file(),
            expression_file_template: default_expression_template(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            illness_inference_rules: default_illness_rules(),
            illness_overrides: HashMap::new(),
            platform_lookup: PlatformLookup::default(),
            qc_thresholds: QcThresholds::default(),
            log_level: default_log_level(),
            log_file: None,
            log_rotation: LogRotation::default(),
            log_backup_count: DEFAULT_LOG_BACKUP_COUNT,
            report_path: None,
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("failed to parse YAML configuration")
    }

    pub fn from_yaml_file(path: &Path) -> std::result::Result<Self, EtlError> {
        let load = || -> Result<Self> {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_yaml_str(&raw)
        };

        load().map_err(|cause| EtlError::Config {
            path: path.to_path_buf(),
            cause,
        })
    }

    pub fn study_file_paths(&self, study_code: &str) -> StudyPaths {
        let expression = self
            .expression_file_template
            .replace(STUDY_CODE_PLACEHOLDER, study_code);

        StudyPaths {
            metadata: self.base_path.join(&self.json_metadata_file),
            expression: self.base_path.join(expression),
        }
    }
}

fn default_base_path() -> PathBuf {
    PathBuf::from("data/raw")
}

fn default_study_code_pattern() -> String {
    DEFAULT_STUDY_CODE_PATTERN.to_string()
}

fn default_metadata_file() -> String {
    DEFAULT_METADATA_FILE.to_string()
}

fn default_expression_template() -> String {
    DEFAULT_EXPRESSION_TEMPLATE.to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_backup_count() -> usize {
    DEFAULT_LOG_BACKUP_COUNT
}
