//! Runtime configuration
//!
//! Loaded from TOML; every section has defaults, so an empty file (or no
//! file at all) is a valid configuration. A few `NEUROSURF_*` environment
//! variables override file values.
//!
//! ```toml
//! [agent]
//! max_iterations = 10
//!
//! [scheduler]
//! max_budget = 24.0
//!
//! [scheduler.roles.executive]
//! model = "nemotron-3-nano:30b"
//! cost = 16.0
//! priority = 10
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::agent::AgentConfig;
use crate::scheduler::{default_catalogue, ModelScheduler, Role, RoleDescriptor, SchedulerError};

pub const ENV_OLLAMA_URL: &str = "NEUROSURF_OLLAMA_URL";
pub const ENV_MAX_ITERATIONS: &str = "NEUROSURF_MAX_ITERATIONS";
pub const ENV_MAX_BUDGET: &str = "NEUROSURF_MAX_BUDGET";
pub const ENV_OTLP_ENDPOINT: &str = "NEUROSURF_OTLP_ENDPOINT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Total capacity shared by loaded roles (GB of VRAM by convention)
    pub max_budget: f64,
    pub roles: BTreeMap<Role, RoleDescriptor>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_budget: 24.0,
            roles: default_catalogue(),
        }
    }
}

impl SchedulerConfig {
    pub fn build(&self) -> Result<ModelScheduler, SchedulerError> {
        ModelScheduler::new(self.max_budget, self.roles.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub temperature: f32,
    /// Context window passed as `options.num_ctx`
    pub num_ctx: Option<u32>,
    /// Passed through as `keep_alive` (e.g. "5m")
    pub keep_alive: Option<String>,
    /// Bound on non-streaming requests
    pub request_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            temperature: 0.0,
            num_ctx: None,
            keep_alive: None,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// OTLP gRPC endpoint (e.g. "http://localhost:4317"); console only when unset
    pub otlp_endpoint: Option<String>,
    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "neurosurf".to_string(),
            otlp_endpoint: None,
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub scheduler: SchedulerConfig,
    pub ollama: OllamaConfig,
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load from a TOML file, apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Load from `path` if given, otherwise defaults; overrides and validation apply to both
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Self::default();
                config.apply_env_overrides()?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by the `NEUROSURF_*` variable names
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_OLLAMA_URL) {
            self.ollama.base_url = url;
        }
        if let Some(value) = lookup(ENV_MAX_ITERATIONS) {
            self.agent.max_iterations = value.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{} must be an integer, got '{}'", ENV_MAX_ITERATIONS, value))
            })?;
        }
        if let Some(value) = lookup(ENV_MAX_BUDGET) {
            self.scheduler.max_budget = value.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{} must be a number, got '{}'", ENV_MAX_BUDGET, value))
            })?;
        }
        if let Some(endpoint) = lookup(ENV_OTLP_ENDPOINT) {
            self.telemetry.otlp_endpoint = (!endpoint.is_empty()).then_some(endpoint);
        }
        Ok(())
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_iterations < 1 {
            return Err(ConfigError::Invalid("agent.max_iterations must be at least 1".into()));
        }
        if self.agent.window_size < 1 {
            return Err(ConfigError::Invalid("agent.window_size must be at least 1".into()));
        }
        if !(self.scheduler.max_budget.is_finite() && self.scheduler.max_budget > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "scheduler.max_budget must be positive, got {}",
                self.scheduler.max_budget
            )));
        }
        for (role, descriptor) in &self.scheduler.roles {
            if !(descriptor.cost.is_finite() && descriptor.cost > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "scheduler.roles.{}.cost must be positive, got {}",
                    role, descriptor.cost
                )));
            }
            if descriptor.model.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "scheduler.roles.{}.model must not be empty",
                    role
                )));
            }
        }
        if !self.scheduler.roles.contains_key(&self.agent.reasoning_role) {
            return Err(ConfigError::Invalid(format!(
                "agent.reasoning_role '{}' not found in [scheduler.roles]",
                self.agent.reasoning_role
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.agent.max_iterations, 15);
        assert_eq!(config.scheduler.roles.len(), 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml_str(
            r#"
            [agent]
            max_iterations = 4
            reasoning_role = "clerk"

            [scheduler]
            max_budget = 10.0

            [scheduler.roles.clerk]
            model = "llama3.2:3b"
            cost = 3.0
            priority = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.agent.max_iterations, 4);
        assert_eq!(config.agent.window_size, 6);
        assert_eq!(config.agent.reasoning_role, Role::Clerk);
        assert_eq!(config.scheduler.roles.len(), 1);
        config.validate().unwrap();
        assert_eq!(config.scheduler.build().unwrap().max_budget(), 10.0);
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(|key| match key {
                ENV_OLLAMA_URL => Some("http://gpu-box:11434".to_string()),
                ENV_MAX_ITERATIONS => Some("3".to_string()),
                ENV_MAX_BUDGET => Some("40".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.ollama.base_url, "http://gpu-box:11434");
        assert_eq!(config.agent.max_iterations, 3);
        assert_eq!(config.scheduler.max_budget, 40.0);

        let err = config
            .apply_overrides(|key| (key == ENV_MAX_ITERATIONS).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.agent.max_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scheduler.max_budget = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scheduler.roles.remove(&Role::Executive);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/neurosurf.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
