use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, EngineError};
use crate::submission::Backoff;

pub const CONFIG_FILE: &str = "experiment.yaml";

const PROCEDURE_KEY: &str = "Procedure";
const STIMULI_KEY: &str = "Stimuli";

/// Selects the procedure and stimuli documents of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Condition(BTreeMap<String, String>);

impl Condition {
    pub fn new(procedure: impl Into<String>, stimuli: impl Into<String>) -> Self {
        let mut values = BTreeMap::new();
        values.insert(PROCEDURE_KEY.to_string(), procedure.into());
        values.insert(STIMULI_KEY.to_string(), stimuli.into());
        Self(values)
    }

    pub fn procedure(&self) -> Result<&str, EngineError> {
        self.required(PROCEDURE_KEY)
    }

    pub fn stimuli(&self) -> Result<&str, EngineError> {
        self.required(STIMULI_KEY)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn required(&self, key: &'static str) -> Result<&str, EngineError> {
        self.get(key).ok_or(EngineError::Condition(key))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub base_secs: f64,
    pub cap_secs: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 1.0,
            cap_secs: 120.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentConfig {
    pub title: String,
    pub submit_url: Option<String>,
    pub request_timeout_secs: u64,
    pub backoff: BackoffConfig,
    pub allow_keyboard_shortcuts_to_change_trial: bool,
    pub conditions: Vec<Condition>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            title: "Experiment".to_string(),
            submit_url: None,
            request_timeout_secs: 30,
            backoff: BackoffConfig::default(),
            allow_keyboard_shortcuts_to_change_trial: false,
            conditions: Vec::new(),
        }
    }
}

impl ExperimentConfig {
    /// Reads `experiment.yaml` from the experiment root; defaults when absent.
    pub fn load(experiment_dir: &Path) -> Result<Self, ConfigError> {
        let path = experiment_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config: Self =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml { path, source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let BackoffConfig { base_secs, cap_secs } = self.backoff;
        if !base_secs.is_finite() || base_secs < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff.base_secs must be a non-negative number, got {}",
                base_secs
            )));
        }
        if !cap_secs.is_finite() || cap_secs < base_secs {
            return Err(ConfigError::Invalid(format!(
                "backoff.cap_secs ({}) must be at least backoff.base_secs ({})",
                cap_secs, base_secs
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn condition(&self, index: usize) -> Result<&Condition, ConfigError> {
        self.conditions.get(index).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "condition index {} out of range ({} configured)",
                index,
                self.conditions.len()
            ))
        })
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs_f64(self.backoff.base_secs),
            Duration::from_secs_f64(self.backoff.cap_secs),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
