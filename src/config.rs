//! Engine configuration.
//!
//! Loads an optional `config.toml` and merges it over stock defaults. Only
//! the keys a user wants to change need to appear:
//!
//! ```toml
//! [processing]
//! schedule = "parallel"     # "sequential" or "parallel"
//! group_size = 4            # Images per concurrent group
//! max_processes = 4         # Max parallel workers (omit for auto = CPU cores)
//!
//! [output]
//! quality = 90              # Quality for intermediate renders (1-100)
//! keep_work_files = false   # Keep <output>/.work after the batch
//!
//! [detection]
//! entropy_grid = 8          # Cells per side for the entropy analyzer
//!
//! [estimates]
//! resize = 200              # Base milliseconds per image for each processor
//! crop = 300
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::imaging::Quality;
use crate::orchestrator::{RunOptions, Schedule};
use crate::task::CostModel;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub processing: ProcessingConfig,
    pub output: OutputConfig,
    pub detection: DetectionConfig,
    /// Per-processor base costs for time estimates.
    pub estimates: CostModel,
}

impl EngineConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output.quality == 0 || self.output.quality > 100 {
            return Err(ConfigError::Validation(
                "output.quality must be 1-100".into(),
            ));
        }
        if self.processing.group_size == 0 {
            return Err(ConfigError::Validation(
                "processing.group_size must be at least 1".into(),
            ));
        }
        if self.processing.max_processes == Some(0) {
            return Err(ConfigError::Validation(
                "processing.max_processes must be at least 1".into(),
            ));
        }
        if !(2..=32).contains(&self.detection.entropy_grid) {
            return Err(ConfigError::Validation(
                "detection.entropy_grid must be 2-32".into(),
            ));
        }
        Ok(())
    }

    /// Orchestrator options described by this config.
    pub fn run_options(&self) -> RunOptions {
        let schedule = match self.processing.schedule {
            ScheduleKind::Sequential => Schedule::Sequential,
            ScheduleKind::Parallel => Schedule::Parallel {
                group_size: self.processing.group_size,
            },
        };
        RunOptions {
            schedule,
            quality: Quality::new(self.output.quality),
            keep_work_files: self.output.keep_work_files,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    #[default]
    Sequential,
    Parallel,
}

/// Scheduling and worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    pub schedule: ScheduleKind,
    /// Images processed concurrently in one group when parallel.
    pub group_size: usize,
    /// Maximum number of rayon workers.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_processes: Option<usize>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleKind::Sequential,
            group_size: 4,
            max_processes: None,
        }
    }
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.max_processes.map(|n| n.min(cores)).unwrap_or(cores)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub quality: u32,
    pub keep_work_files: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            quality: 90,
            keep_work_files: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionConfig {
    pub entropy_grid: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self { entropy_grid: 8 }
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the base layer user overrides are merged onto.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(EngineConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Merge an optional overlay onto the stock defaults, then deserialize and
/// validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<EngineConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: EngineConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from a TOML file, or the stock defaults when `path` is `None`.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let overlay = match path {
        Some(p) => {
            let content = fs::read_to_string(p)?;
            Some(toml::from_str::<toml::Value>(&content)?)
        }
        None => None,
    };
    resolve_config(overlay)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# imagetask configuration
# =======================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Scheduling
# ---------------------------------------------------------------------------
[processing]
# "sequential" processes one image at a time.
# "parallel" processes images in groups; groups run one after another.
schedule = "sequential"

# Images per concurrent group when schedule = "parallel".
group_size = 4

# Maximum rayon workers. Omit for auto (number of CPU cores).
# Values above the core count are clamped down.
# max_processes = 4

# ---------------------------------------------------------------------------
# Output
# ---------------------------------------------------------------------------
[output]
# Encoding quality for intermediate renders (resize, crop, favicon), 1-100.
# Optimize steps carry their own quality.
quality = 90

# Keep <output>/.work with every step's intermediate artifact.
keep_work_files = false

# ---------------------------------------------------------------------------
# Region detection
# ---------------------------------------------------------------------------
[detection]
# Cells per side of the grid the entropy analyzer scores (2-32).
entropy_grid = 8

# ---------------------------------------------------------------------------
# Time estimates
# ---------------------------------------------------------------------------
[estimates]
# Base milliseconds per image for each processor. Smart crops and
# templates cost three times their base; favicons scale with renditions.
resize = 200
crop = 300
optimize = 250
rename = 5
template = 350
favicon = 40
"##
}
