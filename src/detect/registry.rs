//! Detector trait and the registry of available methods.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::sensitivity::ParameterKind;
use super::{stats, DetectError, DetectionResult, Hyperparameters, MetricSeries, Sensitivity};
use crate::config::DetectorsConfig;

/// Helper enum for listing/grouping methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Statistical,
    Ml,
    Advanced,
}

/// Static metadata describing a detection method.
#[derive(Debug, Clone, Serialize)]
pub struct DetectorMeta {
    pub id: &'static str,
    pub display_name: &'static str,
    pub category: Category,
    pub description: &'static str,
    pub best_for: &'static [&'static str],
    /// How this method reads its sensitivity table row.
    pub parameter: ParameterKind,
}

/// Raw detector output: normalized scores plus the cut-off they are compared to.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub scores: Vec<f64>,
    pub threshold: f64,
}

/// Trait for all detection methods.
pub trait Detector: Send + Sync {
    /// Static metadata about the method.
    fn meta(&self) -> DetectorMeta;

    /// Whether the method's optional backing is present in this build.
    fn is_available(&self) -> bool {
        true
    }

    /// Why `is_available` is false.
    fn unavailable_reason(&self) -> Option<&'static str> {
        None
    }

    /// Fewest points the method can score.
    fn min_points(&self) -> usize;

    /// Range the method's scores live in, for priority normalization.
    fn score_range(&self) -> (f64, f64) {
        (0.0, 1.0)
    }

    /// Score every point. Called only with series of at least `min_points`
    /// points and non-zero variance.
    fn score(&self, series: &MetricSeries, params: &Hyperparameters) -> Result<Scored, DetectError>;

    /// `score` that stops early with a computation error once `cancel` fires.
    /// Methods with quadratic loops override this; the rest run to completion.
    fn score_until(
        &self,
        series: &MetricSeries,
        params: &Hyperparameters,
        cancel: &CancellationToken,
    ) -> Result<Scored, DetectError> {
        let _ = cancel;
        self.score(series, params)
    }

    /// Validate length, short-circuit degenerate input, score and flag.
    fn detect(
        &self,
        series: &MetricSeries,
        sensitivity: Sensitivity,
        params: &Hyperparameters,
    ) -> Result<DetectionResult, DetectError> {
        self.detect_until(series, sensitivity, params, &CancellationToken::new())
    }

    /// `detect` bounded by `cancel`.
    fn detect_until(
        &self,
        series: &MetricSeries,
        sensitivity: Sensitivity,
        params: &Hyperparameters,
        cancel: &CancellationToken,
    ) -> Result<DetectionResult, DetectError> {
        let meta = self.meta();
        let needed = self.min_points();
        if series.len() < needed {
            return Err(DetectError::InsufficientData {
                method: meta.id.to_string(),
                needed,
                have: series.len(),
            });
        }

        let values = series.values();
        let scored = if stats::is_constant(&values) {
            debug!(method = meta.id, resource = %series.resource_id, "zero-variance series, skipping model");
            let threshold = match params {
                Hyperparameters::Contamination { .. } => 0.0,
                _ => 0.5,
            };
            Scored {
                scores: vec![0.0; series.len()],
                threshold,
            }
        } else {
            self.score_until(series, params, cancel)?
        };

        if scored.scores.len() != series.len() {
            return Err(DetectError::computation(
                meta.id,
                format!("produced {} scores for {} points", scored.scores.len(), series.len()),
            ));
        }
        if !scored.threshold.is_finite() || scored.scores.iter().any(|s| !s.is_finite()) {
            return Err(DetectError::computation(meta.id, "non-finite score"));
        }

        Ok(DetectionResult::new(
            series,
            meta.id,
            sensitivity,
            scored.scores,
            scored.threshold,
        ))
    }
}

/// Listing entry for a registered method.
#[derive(Debug, Clone, Serialize)]
pub struct MethodInfo {
    #[serde(flatten)]
    pub meta: DetectorMeta,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<&'static str>,
    pub min_points: usize,
}

/// Aliases accepted from older clients.
const ALIASES: &[(&str, &str)] = &[("dtai-auto", "matrix-profile"), ("zscore", "z-score")];

/// Registered detectors, read-only after startup.
#[derive(Clone, Default)]
pub struct DetectorRegistry {
    detectors: Vec<Arc<dyn Detector>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every built-in method with its configured parameters.
    pub fn from_config(cfg: &DetectorsConfig) -> Self {
        let mut registry = Self::new();
        registry.register(super::zscore::ZScoreDetector);
        registry.register(super::moving_average::MovingAverageDetector::new(
            cfg.moving_average.window,
        ));
        registry.register(super::isolation_forest::IsolationForestDetector::new(
            cfg.isolation_forest.clone(),
        ));
        registry.register(super::lof::LofDetector::new(cfg.lof.n_neighbors));
        registry.register(super::forecast::ForecastDetector::new(
            cfg.prophet.seasonal_period,
        ));
        #[cfg(feature = "matrix-profile")]
        registry.register(super::matrix_profile::MatrixProfileDetector::new(
            cfg.matrix_profile.window,
        ));
        #[cfg(not(feature = "matrix-profile"))]
        registry.register(MissingDetector {
            meta: matrix_profile_meta(),
            reason: "built without the `matrix-profile` feature",
        });

        for info in registry.list() {
            info!(
                method = info.meta.id,
                available = info.available,
                min_points = info.min_points,
                "registered detector"
            );
        }
        registry
    }

    /// Add a detector, replacing any existing one with the same id.
    pub fn register<D: Detector + 'static>(&mut self, detector: D) {
        let id = detector.meta().id;
        self.detectors.retain(|d| d.meta().id != id);
        self.detectors.push(Arc::new(detector));
    }

    pub fn metas(&self) -> impl Iterator<Item = DetectorMeta> + '_ {
        self.detectors.iter().map(|d| d.meta())
    }

    pub fn list(&self) -> Vec<MethodInfo> {
        self.detectors
            .iter()
            .map(|d| MethodInfo {
                meta: d.meta(),
                available: d.is_available(),
                unavailable_reason: d.unavailable_reason(),
                min_points: d.min_points(),
            })
            .collect()
    }

    /// Canonical id for `name`, resolving aliases.
    pub fn canonical(name: &str) -> &str {
        let name = name.trim();
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == name)
            .map(|(_, id)| *id)
            .unwrap_or(name)
    }

    /// Look up an available detector. Never substitutes another method.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Detector>, DetectError> {
        let id = Self::canonical(name);
        let detector = self
            .detectors
            .iter()
            .find(|d| d.meta().id == id)
            .ok_or_else(|| DetectError::DetectorUnavailable {
                method: name.to_string(),
                reason: "not registered".to_string(),
            })?;
        if !detector.is_available() {
            return Err(DetectError::DetectorUnavailable {
                method: id.to_string(),
                reason: detector
                    .unavailable_reason()
                    .unwrap_or("optional dependency missing")
                    .to_string(),
            });
        }
        Ok(Arc::clone(detector))
    }
}

pub(crate) fn matrix_profile_meta() -> DetectorMeta {
    DetectorMeta {
        id: "matrix-profile",
        display_name: "Matrix Profile",
        category: Category::Advanced,
        description: "Flags subsequences whose nearest neighbour is unusually far away (discords).",
        best_for: &["Temporal patterns", "Shape anomalies", "Motif breaks"],
        parameter: ParameterKind::Deviation,
    }
}

/// Placeholder for a method whose backing is compiled out.
#[cfg(not(feature = "matrix-profile"))]
struct MissingDetector {
    meta: DetectorMeta,
    reason: &'static str,
}

#[cfg(not(feature = "matrix-profile"))]
impl Detector for MissingDetector {
    fn meta(&self) -> DetectorMeta {
        self.meta.clone()
    }

    fn is_available(&self) -> bool {
        false
    }

    fn unavailable_reason(&self) -> Option<&'static str> {
        Some(self.reason)
    }

    fn min_points(&self) -> usize {
        0
    }

    fn score(&self, _series: &MetricSeries, _params: &Hyperparameters) -> Result<Scored, DetectError> {
        Err(DetectError::DetectorUnavailable {
            method: self.meta.id.to_string(),
            reason: self.reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = DetectorRegistry::from_config(&DetectorsConfig::default());
        let ids: Vec<_> = registry.metas().map(|m| m.id).collect();
        for id in [
            "z-score",
            "moving-average",
            "isolation-forest",
            "lof",
            "prophet",
            "matrix-profile",
        ] {
            assert!(ids.contains(&id), "{id} missing");
        }
    }

    #[test]
    fn test_unknown_method_never_substitutes() {
        let registry = DetectorRegistry::from_config(&DetectorsConfig::default());
        match registry.get("arima") {
            Err(DetectError::DetectorUnavailable { method, .. }) => assert_eq!(method, "arima"),
            other => panic!("unexpected: {:?}", other.map(|d| d.meta().id)),
        }
    }

    #[test]
    fn test_alias_resolves() {
        assert_eq!(DetectorRegistry::canonical("dtai-auto"), "matrix-profile");
        assert_eq!(DetectorRegistry::canonical("lof"), "lof");
    }

    #[cfg(feature = "matrix-profile")]
    #[test]
    fn test_matrix_profile_available_with_feature() {
        let registry = DetectorRegistry::from_config(&DetectorsConfig::default());
        assert!(registry.get("dtai-auto").is_ok());
    }

    #[cfg(not(feature = "matrix-profile"))]
    #[test]
    fn test_matrix_profile_reported_missing() {
        let registry = DetectorRegistry::from_config(&DetectorsConfig::default());
        let info = registry.list().into_iter().find(|i| i.meta.id == "matrix-profile").unwrap();
        assert!(!info.available);
        assert!(registry.get("matrix-profile").is_err());
    }
}
