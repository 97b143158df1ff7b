//! TOML configuration for metricwatch.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working configuration. The config file path can be overridden
//! with the `METRICWATCH_CONFIG` environment variable. The loaded structure is
//! validated once at startup and shared read-only afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::sensitivity::{default_table, LevelValues};
use crate::detect::{DetectorRegistry, SensitivityResolver};

pub const CONFIG_ENV: &str = "METRICWATCH_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/metricwatch/metricwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the metricwatch process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub grouping: GroupingConfig,
    #[serde(default)]
    pub priority: PriorityConfig,
    #[serde(default)]
    pub detectors: DetectorsConfig,
    /// Per-method overrides of the built-in sensitivity table.
    #[serde(default)]
    pub sensitivity: BTreeMap<String, LevelValues>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `METRICWATCH_CONFIG` environment variable.
    /// 2. `/etc/metricwatch/metricwatch.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "METRICWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Load from an explicit path when given, otherwise fall back to
    /// [`Config::load_or_default`].
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::load_or_default()),
        }
    }

    /// Built-in sensitivity table with configured rows laid over it.
    pub fn sensitivity_table(&self) -> BTreeMap<String, LevelValues> {
        let mut table = default_table();
        for (method, levels) in &self.sensitivity {
            table.insert(DetectorRegistry::canonical(method).to_string(), *levels);
        }
        table
    }

    /// Check every section. Called once at startup; failure aborts it.
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate().context("invalid [pipeline] section")?;
        self.grouping.validate().context("invalid [grouping] section")?;
        self.priority.validate().context("invalid [priority] section")?;
        self.detectors.validate().context("invalid [detectors] section")?;

        let registry = DetectorRegistry::from_config(&self.detectors);
        let known: Vec<&str> = registry.metas().map(|m| m.id).collect();
        for method in self.sensitivity.keys() {
            if !known.contains(&DetectorRegistry::canonical(method)) {
                bail!("invalid [sensitivity] section: unknown method '{method}'");
            }
        }
        SensitivityResolver::new(&self.sensitivity_table(), &registry)
            .context("invalid [sensitivity] section")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the HTTP API.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Where anomaly events and detection history are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local; lost on restart.
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// SQLite database file, used when `backend = "sqlite"`.
    pub path: PathBuf,
    /// Maximum pooled connections.
    pub pool_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: PathBuf::from("/var/lib/metricwatch/metricwatch.db"),
            pool_size: 4,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Series evaluated concurrently.
    pub workers: usize,
    /// Overall deadline for one detection request.
    pub request_timeout_ms: u64,
    pub max_series_per_request: usize,
    /// Longer series are rejected as invalid input.
    pub max_points_per_series: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            request_timeout_ms: 30_000,
            max_series_per_request: 1000,
            max_points_per_series: 20_000,
        }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.request_timeout_ms == 0 {
            bail!("request_timeout_ms must be positive");
        }
        if self.max_series_per_request == 0 {
            bail!("max_series_per_request must be at least 1");
        }
        if self.max_points_per_series == 0 {
            bail!("max_points_per_series must be at least 1");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

/// Upper bound for `max_gap_secs` and `min_gap_secs` (one year).
pub const MAX_GAP_SECS: u64 = 365 * 24 * 3600;

/// Upper bound for `gap_intervals`.
pub const MAX_GAP_INTERVALS: u32 = 10_000;

/// Temporal clustering of flagged points into events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    /// Fixed maximum gap between consecutive anomalous points of one event.
    /// When unset the gap is derived from the series' sampling interval.
    pub max_gap_secs: Option<u64>,
    /// Derived gap, in median sampling intervals.
    pub gap_intervals: u32,
    /// Floor for the derived gap.
    pub min_gap_secs: u64,
    /// Continue the stored events of a stream across requests. When off,
    /// every request is grouped on its own and nothing is read from or
    /// written to the event store.
    pub merge_across_batches: bool,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            max_gap_secs: None,
            gap_intervals: 5,
            min_gap_secs: 1,
            merge_across_batches: true,
        }
    }
}

impl GroupingConfig {
    fn validate(&self) -> Result<()> {
        if self.max_gap_secs == Some(0) {
            bail!("max_gap_secs must be positive when set");
        }
        if let Some(secs) = self.max_gap_secs.filter(|&s| s > MAX_GAP_SECS) {
            bail!("max_gap_secs must be at most {MAX_GAP_SECS}, got {secs}");
        }
        if self.gap_intervals == 0 || self.gap_intervals > MAX_GAP_INTERVALS {
            bail!("gap_intervals must be between 1 and {MAX_GAP_INTERVALS}");
        }
        if self.min_gap_secs > MAX_GAP_SECS {
            bail!("min_gap_secs must be at most {MAX_GAP_SECS}, got {}", self.min_gap_secs);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Composite priority weights, modifiers and bucket cut points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub w_peak: f64,
    pub w_count: f64,
    pub w_duration: f64,
    /// Point count at which the count component saturates.
    pub count_saturation: u32,
    /// Duration at which the duration component saturates.
    pub duration_saturation_secs: u64,
    /// Events with fewer points are multiplied by `low_support_factor`.
    pub min_support: u32,
    pub low_support_factor: f64,
    pub history_weight: f64,
    /// Prior event count at which the history boost saturates.
    pub history_saturation: u32,
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    /// Business criticality per resource id; 1.0 when absent.
    pub criticality: BTreeMap<String, f64>,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            w_peak: 0.5,
            w_count: 0.3,
            w_duration: 0.2,
            count_saturation: 10,
            duration_saturation_secs: 600,
            min_support: 2,
            low_support_factor: 0.5,
            history_weight: 0.1,
            history_saturation: 10,
            critical: 0.8,
            high: 0.6,
            medium: 0.3,
            criticality: BTreeMap::new(),
        }
    }
}

impl PriorityConfig {
    fn validate(&self) -> Result<()> {
        for (name, w) in [
            ("w_peak", self.w_peak),
            ("w_count", self.w_count),
            ("w_duration", self.w_duration),
        ] {
            if !w.is_finite() || w < 0.0 {
                bail!("{name} must be a non-negative number, got {w}");
            }
        }
        if self.w_peak + self.w_count + self.w_duration <= 0.0 {
            bail!("priority weights must not all be zero");
        }
        if self.w_peak < self.w_duration {
            bail!("w_peak must not be smaller than w_duration");
        }
        for (name, c) in [("critical", self.critical), ("high", self.high), ("medium", self.medium)] {
            if !(0.0..=1.0).contains(&c) {
                bail!("cut point {name} must lie in [0, 1], got {c}");
            }
        }
        if !(self.critical >= self.high && self.high >= self.medium) {
            bail!("cut points must satisfy critical >= high >= medium");
        }
        if self.count_saturation == 0 || self.duration_saturation_secs == 0 || self.history_saturation == 0 {
            bail!("saturation values must be positive");
        }
        if !(0.0..=1.0).contains(&self.low_support_factor) {
            bail!("low_support_factor must lie in [0, 1]");
        }
        if !self.history_weight.is_finite() || self.history_weight < 0.0 {
            bail!("history_weight must be non-negative");
        }
        if let Some((resource, c)) = self
            .criticality
            .iter()
            .find(|(_, c)| !c.is_finite() || **c < 0.0)
        {
            bail!("criticality for '{resource}' must be a non-negative number, got {c}");
        }
        Ok(())
    }

    /// Configured criticality of a resource, 1.0 when not listed.
    pub fn criticality_for(&self, resource_id: &str) -> f64 {
        self.criticality.get(resource_id).copied().unwrap_or(1.0)
    }
}

// ---------------------------------------------------------------------------
// Detectors
// ---------------------------------------------------------------------------

/// Method-specific parameters that do not vary with sensitivity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorsConfig {
    #[serde(rename = "moving-average", alias = "moving_average")]
    pub moving_average: MovingAverageConfig,
    #[serde(rename = "isolation-forest", alias = "isolation_forest")]
    pub isolation_forest: IsolationForestConfig,
    pub lof: LofConfig,
    pub prophet: ProphetConfig,
    #[serde(rename = "matrix-profile", alias = "matrix_profile")]
    pub matrix_profile: MatrixProfileConfig,
}

impl DetectorsConfig {
    fn validate(&self) -> Result<()> {
        if self.moving_average.window < 2 {
            bail!("moving-average window must be at least 2");
        }
        if self.isolation_forest.n_trees == 0 {
            bail!("isolation-forest n_trees must be at least 1");
        }
        if self.isolation_forest.sample_size < 2 {
            bail!("isolation-forest sample_size must be at least 2");
        }
        if self.lof.n_neighbors == 0 {
            bail!("lof n_neighbors must be at least 1");
        }
        if self.prophet.seasonal_period == 1 {
            bail!("prophet seasonal_period must be 0 (off) or at least 2");
        }
        if self.matrix_profile.window < 2 {
            bail!("matrix-profile window must be at least 2");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MovingAverageConfig {
    pub window: usize,
}

impl Default for MovingAverageConfig {
    fn default() -> Self {
        Self { window: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationForestConfig {
    pub n_trees: usize,
    /// Subsample drawn per tree, capped at the series length.
    pub sample_size: usize,
    pub seed: u64,
}

impl Default for IsolationForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            sample_size: 256,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LofConfig {
    pub n_neighbors: usize,
}

impl Default for LofConfig {
    fn default() -> Self {
        Self { n_neighbors: 20 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProphetConfig {
    /// Season length in points; 0 disables seasonality.
    pub seasonal_period: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixProfileConfig {
    /// Subsequence length.
    pub window: usize,
}

impl Default for MatrixProfileConfig {
    fn default() -> Self {
        Self { window: 4 }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Plain,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset (`trace` .. `error`, or a
    /// full `EnvFilter` directive).
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
