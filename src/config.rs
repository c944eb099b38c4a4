//! Configuration management
//!
//! Configuration is read from a TOML file, then selected values can be
//! overridden from `REFCOST_*` environment variables. Every section has
//! defaults, so an empty file is a valid configuration.
//!
//! ```toml
//! [refinement]
//! max_level = 32
//! step = 4
//! reference_levels = [8, 16, 24, 32]
//!
//! [calibration]
//! estimator = "exact"
//!
//! [[calibration.percentiles]]
//! query = 2
//! level = 32
//! percentile = 99.5
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::calibration::{PercentileEstimator, PercentileRule, DEFAULT_DIGEST_SIZE};
use crate::error::{Error, Result};
use crate::packet::TraceOptions;
use crate::refinement::RefinementHierarchy;
use crate::relation::ParallelConfig;
use crate::types::{Level, MAX_LEVEL};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Refinement levels
    #[serde(default)]
    pub refinement: RefinementConfig,

    /// Threshold calibration
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Performance tuning
    #[serde(default)]
    pub performance: PerformanceConfig,

    /// Checkpoint and output locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Trace loading
    #[serde(default)]
    pub trace: TraceOptions,

    /// Logging
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Refinement hierarchy configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RefinementConfig {
    /// Finest prefix length
    #[serde(default = "default_max_level")]
    pub max_level: Level,

    /// Distance between consecutive levels
    #[serde(default = "default_step")]
    pub step: Level,

    /// Levels kept in the final matrix; empty keeps every level
    #[serde(default)]
    pub reference_levels: Vec<Level>,
}

/// Percentile estimator selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    /// Exact linear interpolation
    #[default]
    Exact,
    /// T-digest sketch
    TDigest,
}

/// Threshold calibration configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CalibrationConfig {
    /// Finest-level percentile estimator
    #[serde(default)]
    pub estimator: EstimatorKind,

    /// Centroids kept by the t-digest estimator
    #[serde(default = "default_digest_size")]
    pub digest_size: usize,

    /// Per-query (and optionally per-level) percentile overrides
    #[serde(default)]
    pub percentiles: Vec<PercentileRule>,
}

/// Performance tuning
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PerformanceConfig {
    /// Threads of the worker pool
    #[serde(default = "default_workers")]
    pub worker_threads: usize,

    /// Rows per parallel grouping morsel
    #[serde(default = "default_morsel_size")]
    pub morsel_size: usize,

    /// Rows below which grouping stays on one thread
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
}

/// Storage locations
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory for on-disk checkpoints; kept in memory when unset
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Directory for raw count artifacts
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Output path of the assembled matrix
    #[serde(default = "default_matrix_path")]
    pub matrix_path: PathBuf,

    /// Leave a minute's checkpoints in place once its counts are built
    #[serde(default)]
    pub keep_checkpoints: bool,
}

/// Monitoring configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Default log filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_max_level() -> Level { MAX_LEVEL }
fn default_step() -> Level { 4 }
fn default_digest_size() -> usize { DEFAULT_DIGEST_SIZE }
fn default_workers() -> usize { num_cpus::get() }
fn default_morsel_size() -> usize { ParallelConfig::default().morsel_size }
fn default_parallel_threshold() -> usize { ParallelConfig::default().parallel_threshold }
fn default_artifact_dir() -> PathBuf { PathBuf::from("artifacts") }
fn default_matrix_path() -> PathBuf { PathBuf::from("cost_matrix.bin") }
fn default_log_level() -> String { "info".to_string() }

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_level: default_max_level(),
            step: default_step(),
            reference_levels: Vec::new(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorKind::default(),
            digest_size: default_digest_size(),
            percentiles: Vec::new(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_workers(),
            morsel_size: default_morsel_size(),
            parallel_threshold: default_parallel_threshold(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: None,
            artifact_dir: default_artifact_dir(),
            matrix_path: default_matrix_path(),
            keep_checkpoints: false,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides read through `lookup`, keyed by environment variable name
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Refinement
        if let Some(max) = parse_var(&lookup, "REFCOST_MAX_LEVEL") {
            self.refinement.max_level = max;
        }
        if let Some(step) = parse_var(&lookup, "REFCOST_STEP") {
            self.refinement.step = step;
        }
        if let Some(levels) = lookup("REFCOST_REFERENCE_LEVELS") {
            let parsed: std::result::Result<Vec<Level>, _> = levels
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect();
            if let Ok(parsed) = parsed {
                self.refinement.reference_levels = parsed;
            }
        }

        // Performance
        if let Some(threads) = parse_var(&lookup, "REFCOST_WORKER_THREADS") {
            self.performance.worker_threads = threads;
        }

        // Storage
        if let Some(dir) = lookup("REFCOST_CHECKPOINT_DIR") {
            self.storage.checkpoint_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("REFCOST_ARTIFACT_DIR") {
            self.storage.artifact_dir = PathBuf::from(dir);
        }
        if let Some(keep) = parse_var(&lookup, "REFCOST_KEEP_CHECKPOINTS") {
            self.storage.keep_checkpoints = keep;
        }

        // Trace
        if let Some(collapse) = parse_var(&lookup, "REFCOST_COLLAPSE_TIMESTAMPS") {
            self.trace.collapse_timestamps = collapse;
        }

        // Monitoring
        if let Some(log_level) = lookup("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.hierarchy()?;

        if let Some(&bad) = self.refinement.reference_levels.iter().find(|&&l| l > MAX_LEVEL) {
            return Err(Error::Configuration(format!(
                "Reference level {} exceeds {}",
                bad, MAX_LEVEL
            )));
        }

        if self.calibration.digest_size == 0 {
            return Err(Error::Configuration("Digest size must be > 0".to_string()));
        }
        if let Some(rule) = self
            .calibration
            .percentiles
            .iter()
            .find(|r| !(r.percentile > 0.0 && r.percentile <= 100.0))
        {
            return Err(Error::Configuration(format!(
                "Percentile {} for query {} not in (0, 100]",
                rule.percentile, rule.query
            )));
        }

        if self.performance.worker_threads == 0 {
            return Err(Error::Configuration("Worker threads must be > 0".to_string()));
        }
        if self.performance.morsel_size == 0 {
            return Err(Error::Configuration("Morsel size must be > 0".to_string()));
        }

        if self.storage.artifact_dir.as_os_str().is_empty() {
            return Err(Error::Configuration("Artifact directory cannot be empty".to_string()));
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents).map_err(|e| {
            Error::Configuration(format!("Failed to write config file {}: {}", path.display(), e))
        })
    }

    /// Refinement hierarchy described by the `refinement` section
    pub fn hierarchy(&self) -> Result<RefinementHierarchy> {
        RefinementHierarchy::new(self.refinement.max_level, self.refinement.step)
    }

    /// Finest-level percentile estimator
    pub fn estimator(&self) -> PercentileEstimator {
        match self.calibration.estimator {
            EstimatorKind::Exact => PercentileEstimator::Exact,
            EstimatorKind::TDigest => PercentileEstimator::TDigest {
                max_size: self.calibration.digest_size,
            },
        }
    }

    /// Grouping parallelism
    pub fn parallel_config(&self) -> ParallelConfig {
        ParallelConfig::default()
            .with_morsel_size(self.performance.morsel_size)
            .with_threshold(self.performance.parallel_threshold)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(name).and_then(|v| v.trim().parse().ok())
}

mod num_cpus {
    pub fn get() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.refinement.max_level, 32);
        assert_eq!(config.refinement.step, 4);
        assert!(config.storage.checkpoint_dir.is_none());
        assert_eq!(config.hierarchy().unwrap().len(), 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.refinement, RefinementConfig::default());
        assert_eq!(config.estimator(), PercentileEstimator::Exact);
    }

    #[test]
    fn test_parse_sections() {
        let config: Config = toml::from_str(
            r#"
            [refinement]
            max_level = 32
            step = 8
            reference_levels = [16, 32]

            [calibration]
            estimator = "t_digest"
            digest_size = 50

            [[calibration.percentiles]]
            query = 2
            level = 32
            percentile = 99.5

            [[calibration.percentiles]]
            query = 5
            percentile = 95.0

            [trace]
            collapse_timestamps = true
            "#,
        )
        .unwrap();

        assert_eq!(config.hierarchy().unwrap().levels(), &[32, 24, 16, 8]);
        assert_eq!(config.estimator(), PercentileEstimator::TDigest { max_size: 50 });
        assert_eq!(config.calibration.percentiles.len(), 2);
        assert_eq!(config.calibration.percentiles[1].level, None);
        assert!(config.trace.collapse_timestamps);
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = Config::default();
        config.refinement.step = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.calibration.percentiles.push(PercentileRule {
            query: 1,
            level: None,
            percentile: 120.0,
        });
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.performance.worker_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refcost.toml");
        let mut config = Config::default();
        config.refinement.reference_levels = vec![8, 16];
        config.storage.checkpoint_dir = Some(dir.path().join("checkpoints"));
        config.save_to_file(&path).unwrap();

        assert_eq!(Config::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_env_override() {
        let vars: HashMap<&str, &str> = [
            ("REFCOST_REFERENCE_LEVELS", "8, 24"),
            ("REFCOST_STEP", "8"),
            ("REFCOST_WORKER_THREADS", "not-a-number"),
            ("REFCOST_KEEP_CHECKPOINTS", "true"),
            ("REFCOST_CHECKPOINT_DIR", "/tmp/refcost"),
        ]
        .into();
        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.refinement.reference_levels, vec![8, 24]);
        assert_eq!(config.refinement.step, 8);
        assert_eq!(config.performance.worker_threads, Config::default().performance.worker_threads);
        assert!(config.storage.keep_checkpoints);
        assert_eq!(config.storage.checkpoint_dir, Some(PathBuf::from("/tmp/refcost")));
        assert_eq!(config.refinement.max_level, 32);
    }
}
