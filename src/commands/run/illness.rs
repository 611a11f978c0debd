use std::collections::HashMap;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::config::{EtlConfig, IllnessRule};
use crate::model::{InferenceMethod, UNKNOWN_ILLNESS};

/// Compiled illness rule; the rule list is sorted once, at construction.
#[derive(Debug, Clone)]
pub(crate) struct CompiledIllnessRule {
    pub(crate) regex: Regex,
    pub(crate) label: String,
    pub(crate) priority: i64,
}

/// Title-based illness classifier with per-sample overrides.
#[derive(Debug, Clone)]
pub(crate) struct IllnessInferenceEngine {
    rules: Vec<CompiledIllnessRule>,
    overrides: HashMap<String, String>,
}

impl IllnessInferenceEngine {
    pub(crate) fn new(rules: &[IllnessRule], overrides: &HashMap<String, String>) -> Result<Self> {
        let mut ordered: Vec<&IllnessRule> = rules.iter().collect();
        // stable: equal priorities keep configuration order
        ordered.sort_by_key(|rule| rule.priority);

        let mut compiled = Vec::with_capacity(ordered.len());
        for rule in ordered {
            let regex = RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| {
                    format!(
                        "failed to compile illness rule {} ({})",
                        rule.label,
                        rule.description.as_deref().unwrap_or("no description")
                    )
                })?;

            debug!(label = %rule.label, priority = rule.priority, "illness rule");
            compiled.push(CompiledIllnessRule {
                regex,
                label: rule.label.clone(),
                priority: rule.priority,
            });
        }

        debug!(
            rules = compiled.len(),
            overrides = overrides.len(),
            "compiled illness inference rules"
        );

        Ok(Self {
            rules: compiled,
            overrides: overrides.clone(),
        })
    }

    pub(crate) fn from_config(config: &EtlConfig) -> Result<Self> {
        Self::new(&config.illness_inference_rules, &config.illness_overrides)
    }

    pub(crate) fn infer(&self, sample_title: &str, sample_accession: &str) -> (String, InferenceMethod) {
        if let Some(label) = self.overrides.get(sample_accession) {
            return (label.clone(), InferenceMethod::Override);
        }

        match self.rules.iter().find(|rule| rule.regex.is_match(sample_title)) {
            Some(rule) => {
                debug!(
                    sample = %sample_accession,
                    label = %rule.label,
                    priority = rule.priority,
                    "illness rule matched"
                );
                (rule.label.clone(), InferenceMethod::Regex)
            }
            None => (UNKNOWN_ILLNESS.to_string(), InferenceMethod::Default),
        }
    }

    #[cfg(test)]
    pub(crate) fn rules(&self) -> &[CompiledIllnessRule] {
        &self.rules
    }
}
