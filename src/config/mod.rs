//! Configuration module for strata.
//!
//! Planner limits, optimizer rule switches and logging level, loaded from
//! TOML. There is no global configuration; callers pass these values in.

mod settings;

pub use settings::{LoggingSettings, OptimizerConfig, PlannerSettings, Settings, SettingsError};
