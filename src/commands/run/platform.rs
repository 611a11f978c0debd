use anyhow::{Context, Result};
use regex::Regex;

use crate::config::{EtlConfig, ManufacturerTable};
use crate::model::PlatformRecord;
use crate::technology::infer_measurement_technology;

pub(crate) const UNKNOWN_MANUFACTURER: &str = "Unknown";

/// Splits `Name (ACCESSION)` descriptors and derives manufacturer and
/// measurement technology.
#[derive(Debug, Clone)]
pub(crate) struct PlatformNormalizer {
    accession_suffix: Regex,
    manufacturers: Vec<(String, String)>,
}

impl PlatformNormalizer {
    pub(crate) fn new(table: &ManufacturerTable) -> Result<Self> {
        let accession_suffix = Regex::new(r"^(.+)\(([^)]+)\)")
            .context("failed to compile platform accession regex")?;

        let manufacturers = table
            .0
            .iter()
            .map(|(keyword, name)| (keyword.to_lowercase(), name.clone()))
            .collect();

        Ok(Self {
            accession_suffix,
            manufacturers,
        })
    }

    pub(crate) fn from_config(config: &EtlConfig) -> Result<Self> {
        Self::new(&config.platform_lookup.manufacturer)
    }

    pub(crate) fn normalize(&self, descriptor: &str, study_technology: Option<&str>) -> PlatformRecord {
        let (name, accession) = match self.accession_suffix.captures(descriptor) {
            Some(captures) => (
                captures[1].trim().to_string(),
                captures[2].to_string(),
            ),
            None => (descriptor.to_string(), descriptor.to_string()),
        };

        let manufacturer = self.manufacturer_for(&name);
        let measurement_technology = infer_measurement_technology(study_technology, Some(&name));

        PlatformRecord {
            accession,
            name,
            manufacturer,
            measurement_technology,
        }
    }

    fn manufacturer_for(&self, platform_name: &str) -> String {
        let lowered = platform_name.to_lowercase();
        self.manufacturers
            .iter()
            .find(|(keyword, _)| lowered.contains(keyword.as_str()))
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| UNKNOWN_MANUFACTURER.to_string())
    }
}
