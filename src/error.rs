use std::path::PathBuf;

use thiserror::Error;

/// Stage-level failures. Each variant keeps the underlying `anyhow` chain so
/// the orchestrator can record the full cause trace for a failed study.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("failed to load configuration from {path}: {cause:#}")]
    Config { path: PathBuf, cause: anyhow::Error },

    #[error("extraction failed for {study_code}: {cause:#}")]
    Extraction {
        study_code: String,
        cause: anyhow::Error,
    },

    #[error("transformation failed for {study_code}: {cause:#}")]
    Transformation {
        study_code: String,
        cause: anyhow::Error,
    },

    #[error("load failed for {study_code}: {cause:#}")]
    Load {
        study_code: String,
        cause: anyhow::Error,
    },
}

impl EtlError {
    pub fn extraction(study_code: &str, cause: impl Into<anyhow::Error>) -> Self {
        Self::Extraction {
            study_code: study_code.to_string(),
            cause: cause.into(),
        }
    }

    pub fn transformation(study_code: &str, cause: impl Into<anyhow::Error>) -> Self {
        Self::Transformation {
            study_code: study_code.to_string(),
            cause: cause.into(),
        }
    }

    pub fn load(study_code: &str, cause: impl Into<anyhow::Error>) -> Self {
        Self::Load {
            study_code: study_code.to_string(),
            cause: cause.into(),
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Extraction { .. } => "extract",
            Self::Transformation { .. } => "transform",
            Self::Load { .. } => "load",
        }
    }

    /// Messages of the cause chain, outermost first.
    pub fn trace(&self) -> Vec<String> {
        let cause = match self {
            Self::Config { cause, .. }
            | Self::Extraction { cause, .. }
            | Self::Transformation { cause, .. }
            | Self::Load { cause, .. } => cause,
        };
        cause.chain().map(ToString::to_string).collect()
    }
}
