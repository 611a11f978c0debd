use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MeasurementTechnology {
    #[serde(rename = "RNA-SEQ")]
    RnaSeq,
    #[serde(rename = "MICROARRAY")]
    Microarray,
    #[serde(rename = "OTHER")]
    Other,
}

impl MeasurementTechnology {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RnaSeq => "RNA-SEQ",
            Self::Microarray => "MICROARRAY",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for MeasurementTechnology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower-cases, turns runs of `-`/`_` into a space and collapses whitespace.
pub fn normalize_descriptor(value: Option<&str>) -> String {
    let Some(value) = value else {
        return String::new();
    };

    let lowered = value.trim().to_lowercase();
    let mut cleaned = String::with_capacity(lowered.len());
    let mut in_separator = false;

    for ch in lowered.chars() {
        if ch == '-' || ch == '_' {
            if !in_separator {
                cleaned.push(' ');
                in_separator = true;
            }
        } else {
            cleaned.push(ch);
            in_separator = false;
        }
    }

    cleaned.split_whitespace().collect::<Vec<&str>>().join(" ")
}

fn classify_descriptor(normalized: &str, array_token_counts: bool) -> Option<MeasurementTechnology> {
    if normalized.is_empty() {
        return None;
    }

    let compact = normalized.replace(' ', "");
    let tokens: Vec<&str> = normalized.split(' ').collect();
    let has_token = |needle: &str| tokens.iter().any(|token| *token == needle);

    if compact.contains("microarray") || (array_token_counts && has_token("array")) {
        return Some(MeasurementTechnology::Microarray);
    }

    if compact.contains("rnaseq")
        || normalized.contains("rna seq")
        || (has_token("rna") && (has_token("seq") || has_token("sequencing")))
    {
        return Some(MeasurementTechnology::RnaSeq);
    }

    None
}

/// The study descriptor is authoritative; the platform descriptor is only
/// consulted when the study descriptor gives no verdict.
pub fn infer_measurement_technology(
    study_technology: Option<&str>,
    platform_descriptor: Option<&str>,
) -> MeasurementTechnology {
    classify_descriptor(&normalize_descriptor(study_technology), false)
        .or_else(|| classify_descriptor(&normalize_descriptor(platform_descriptor), true))
        .unwrap_or(MeasurementTechnology::Other)
}
