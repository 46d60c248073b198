//! TOML-based configuration for strata.
//!
//! Every section is optional; missing keys fall back to their defaults.
//!
//! Example configuration:
//! ```toml
//! [planner]
//! max_depth = 64
//! weak_component_limit = 20
//! partial_retry = true
//! synonym_fallback = true
//!
//! [optimizer]
//! predicate_pushdown = true
//! datasource_inlining = true
//! inline_datasource_cutoff = 2
//! max_loops = 100
//!
//! [logging]
//! level = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Search limits and fallbacks.
    pub planner: PlannerSettings,

    /// Rewrite passes run after planning.
    pub optimizer: OptimizerConfig,

    /// Log filtering for the binary.
    pub logging: LoggingSettings,
}

/// Knobs of the discovery loop.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PlannerSettings {
    /// Deepest nested search before giving up.
    pub max_depth: usize,

    /// Bridge discovery rounds before the ambiguity check gives up.
    pub weak_component_limit: usize,

    /// Retry a failed search once with partial sources accepted.
    pub partial_retry: bool,

    /// Fall back to pseudonym substitution for unresolvable roots.
    pub synonym_fallback: bool,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            max_depth: 64,
            weak_component_limit: 20,
            partial_retry: true,
            synonym_fallback: true,
        }
    }
}

/// Which rewrite rules run, and their limits.
///
/// Passed by reference into the optimizer and into each rule.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub predicate_pushdown: bool,
    pub predicate_pushdown_remove: bool,
    pub datasource_inlining: bool,
    pub constant_inlining: bool,
    pub merge_aggregate: bool,
    pub direct_return: bool,

    /// Most consumers a datasource may be inlined into.
    pub inline_datasource_cutoff: usize,

    /// Passes per rule before the loop is declared runaway.
    pub max_loops: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            predicate_pushdown: true,
            predicate_pushdown_remove: true,
            datasource_inlining: true,
            constant_inlining: true,
            merge_aggregate: true,
            direct_return: true,
            inline_datasource_cutoff: 2,
            max_loops: 100,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default `EnvFilter` level for the crate, overridden by `RUST_LOG`.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject limits that would stop the planner or optimizer from running.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.planner.max_depth == 0 {
            return Err(SettingsError::InvalidConfig(
                "planner.max_depth must be positive".to_string(),
            ));
        }
        if self.planner.weak_component_limit == 0 {
            return Err(SettingsError::InvalidConfig(
                "planner.weak_component_limit must be positive".to_string(),
            ));
        }
        if self.optimizer.max_loops == 0 {
            return Err(SettingsError::InvalidConfig(
                "optimizer.max_loops must be positive".to_string(),
            ));
        }
        if self.optimizer.inline_datasource_cutoff == 0 {
            return Err(SettingsError::InvalidConfig(
                "optimizer.inline_datasource_cutoff must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
