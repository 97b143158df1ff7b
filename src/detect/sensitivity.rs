//! Sensitivity resolution: `(method, sensitivity) -> hyperparameters`.
//!
//! The table is supplied by configuration and validated once against the
//! registry at startup. Lookups afterwards are pure and infallible for every
//! registered method.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::registry::DetectorRegistry;
use super::{DetectError, Sensitivity};

/// What a method's sensitivity entry means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    /// Multiplier `k` on a standard deviation; smaller flags more.
    Deviation,
    /// Expected outlier fraction; larger flags more.
    Contamination,
    /// Forecast confidence level; narrower flags more.
    Interval,
}

impl ParameterKind {
    fn build(self, value: f64) -> Hyperparameters {
        match self {
            Self::Deviation => Hyperparameters::Deviation { k: value },
            Self::Contamination => Hyperparameters::Contamination { fraction: value },
            Self::Interval => Hyperparameters::Interval { width: value },
        }
    }

    fn in_range(self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self {
            Self::Deviation => value > 0.0,
            Self::Contamination => value > 0.0 && value < 0.5,
            Self::Interval => value > 0.0 && value < 1.0,
        }
    }

    /// Low must be the strictest level, high the loosest.
    fn ordered(self, levels: &LevelValues) -> bool {
        match self {
            Self::Deviation | Self::Interval => {
                levels.low >= levels.medium && levels.medium >= levels.high
            }
            Self::Contamination => levels.low <= levels.medium && levels.medium <= levels.high,
        }
    }
}

/// Resolved method parameters for one sensitivity level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Hyperparameters {
    Deviation { k: f64 },
    Contamination { fraction: f64 },
    Interval { width: f64 },
}

/// One row of the sensitivity table as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelValues {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl LevelValues {
    pub const fn new(low: f64, medium: f64, high: f64) -> Self {
        Self { low, medium, high }
    }

    pub fn get(&self, sensitivity: Sensitivity) -> f64 {
        match sensitivity {
            Sensitivity::Low => self.low,
            Sensitivity::Medium => self.medium,
            Sensitivity::High => self.high,
        }
    }
}

/// Built-in table, keyed by detector id.
pub fn default_table() -> BTreeMap<String, LevelValues> {
    [
        ("z-score", LevelValues::new(3.5, 3.0, 2.0)),
        ("moving-average", LevelValues::new(3.5, 3.0, 2.0)),
        ("isolation-forest", LevelValues::new(0.01, 0.05, 0.10)),
        ("lof", LevelValues::new(0.01, 0.05, 0.10)),
        ("prophet", LevelValues::new(0.99, 0.95, 0.80)),
        ("matrix-profile", LevelValues::new(3.0, 2.5, 2.0)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

#[derive(Debug, Clone)]
pub struct SensitivityResolver {
    table: BTreeMap<String, [Hyperparameters; 3]>,
}

impl SensitivityResolver {
    /// Build the resolver, checking that every registered method has a
    /// complete, in-range and correctly ordered row.
    pub fn new(table: &BTreeMap<String, LevelValues>, registry: &DetectorRegistry) -> Result<Self> {
        let mut resolved = BTreeMap::new();
        for meta in registry.metas() {
            let Some(levels) = table.get(meta.id) else {
                bail!("sensitivity table has no entry for method '{}'", meta.id);
            };
            let kind = meta.parameter;
            for s in Sensitivity::ALL {
                let v = levels.get(s);
                if !kind.in_range(v) {
                    bail!("sensitivity '{s}' for '{}' is out of range: {v}", meta.id);
                }
            }
            if !kind.ordered(levels) {
                bail!(
                    "sensitivity levels for '{}' must go from strictest (low) to loosest (high)",
                    meta.id
                );
            }
            resolved.insert(
                meta.id.to_string(),
                Sensitivity::ALL.map(|s| kind.build(levels.get(s))),
            );
        }
        Ok(Self { table: resolved })
    }

    pub fn resolve(&self, method: &str, sensitivity: Sensitivity) -> Result<Hyperparameters, DetectError> {
        self.table
            .get(method)
            .map(|row| row[sensitivity as usize])
            .ok_or_else(|| DetectError::DetectorUnavailable {
                method: method.to_string(),
                reason: "no sensitivity entry".to_string(),
            })
    }
}
