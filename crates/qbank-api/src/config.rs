use std::path::Path;

use anyhow::{Context, Result};
use qbank_core::{BankError, DecisionPolicy, FingerprintConfig, MatcherConfig, NormalizerConfig};
use serde::{Deserialize, Serialize};

/// Runtime settings for a question bank. Every section falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QbankConfig {
    pub normalizer: NormalizerConfig,
    pub fingerprint: FingerprintConfig,
    pub matcher: MatcherConfig,
    pub policy: DecisionPolicy,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Seconds between background index rebuilds. `0` disables them.
    pub reindex_interval_secs: u64,
}

impl QbankConfig {
    /// Load settings from an optional YAML file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parse and validate settings from a YAML document.
    ///
    /// # Errors
    /// Returns an error when the YAML is malformed or any section is invalid.
    pub fn parse(yaml: &str) -> Result<Self> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml).context("failed to parse YAML config")?
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`BankError::Config`] or [`BankError::ThresholdConfig`] for the first invalid
    /// section.
    pub fn validate(&self) -> Result<(), BankError> {
        if self.normalizer.shingle_size == 0 {
            return Err(BankError::Config("normalizer.shingle_size MUST be >= 1".to_string()));
        }
        self.fingerprint.validate()?;
        self.matcher.validate()?;
        self.policy.validated()?;
        Ok(())
    }
}
