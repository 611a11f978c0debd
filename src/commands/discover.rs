use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, warn};

use crate::cli::DiscoverArgs;
use crate::config::EtlConfig;
use crate::model::{DiscoveredStudy, StudyInventory};
use crate::util::{now_utc_string, sha256_file, write_json_pretty};

pub fn run(args: DiscoverArgs) -> Result<()> {
    let config = EtlConfig::from_yaml_file(&args.config)?;
    let inventory = build_inventory(&config)?;

    for study in &inventory.studies {
        info!(
            study = %study.study_code,
            matrix = %study.expression_path,
            present = study.expression_present,
            sha256 = %study.sha256.as_deref().unwrap_or("-"),
            "discovered study"
        );
    }

    if let Some(manifest_path) = args.manifest_path {
        write_json_pretty(&manifest_path, &inventory)?;
        info!(path = %manifest_path.display(), "wrote study inventory");
    }

    info!(
        study_count = inventory.study_count,
        base_path = %inventory.base_path,
        "discovery completed"
    );
    Ok(())
}

pub fn build_inventory(config: &EtlConfig) -> Result<StudyInventory> {
    let codes = discover_study_codes(&config.base_path, &config.study_code_pattern)?;

    let mut studies = Vec::with_capacity(codes.len());
    for study_code in codes {
        let expression = config.study_file_paths(&study_code).expression;
        let expression_present = expression.is_file();
        let sha256 = if expression_present {
            Some(sha256_file(&expression)?)
        } else {
            warn!(study = %study_code, path = %expression.display(), "expression matrix missing");
            None
        };

        studies.push(DiscoveredStudy {
            study_code,
            expression_path: expression.display().to_string(),
            expression_present,
            sha256,
        });
    }

    Ok(StudyInventory {
        manifest_version: 1,
        generated_at: now_utc_string(),
        base_path: config.base_path.display().to_string(),
        study_count: studies.len(),
        studies,
    })
}

/// Sorted names of the directories under `base_path` whose name matches
/// `pattern` from its first character.
pub fn discover_study_codes(base_path: &Path, pattern: &str) -> Result<Vec<String>> {
    let pattern = Regex::new(pattern)
        .with_context(|| format!("failed to compile study code pattern {pattern:?}"))?;

    let mut codes = Vec::new();
    for path in study_directories(base_path)? {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };

        if pattern.find(name).is_some_and(|found| found.start() == 0) {
            codes.push(name.to_string());
        }
    }

    codes.sort();
    info!(base_path = %base_path.display(), studies = codes.len(), "discovered studies");
    Ok(codes)
}

fn study_directories(base_path: &Path) -> Result<Vec<PathBuf>> {
    let mut directories = Vec::new();

    let entries = fs::read_dir(base_path)
        .with_context(|| format!("failed to read {}", base_path.display()))?;

    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", base_path.display()))?;
        let path = entry.path();

        if entry
            .file_type()
            .with_context(|| format!("failed to inspect file type: {}", path.display()))?
            .is_dir()
        {
            directories.push(path);
        }
    }

    Ok(directories)
}
