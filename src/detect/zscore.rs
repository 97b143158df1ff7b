use super::registry::{Category, Detector, DetectorMeta, Scored};
use super::sensitivity::ParameterKind;
use super::stats::TimeSeries;
use super::{DetectError, Hyperparameters, MetricSeries};

/// Global z-score: distance from the series mean in standard deviations.
pub struct ZScoreDetector;

/// Normalized score for a deviation `z` against multiplier `k`.
/// Crosses 0.5 exactly at `z == k`; saturates at `2k`.
pub(crate) fn deviation_score(z: f64, k: f64) -> f64 {
    (z / (2.0 * k)).clamp(0.0, 1.0)
}

pub(crate) fn deviation_k(method: &str, params: &Hyperparameters) -> Result<f64, DetectError> {
    match params {
        Hyperparameters::Deviation { k } => Ok(*k),
        other => Err(DetectError::computation(
            method,
            format!("expected a deviation multiplier, got {other:?}"),
        )),
    }
}

impl Detector for ZScoreDetector {
    fn meta(&self) -> DetectorMeta {
        DetectorMeta {
            id: "z-score",
            display_name: "Z-Score",
            category: Category::Statistical,
            description: "Distance from the global mean in standard deviations. Simple and fast.",
            best_for: &["Stationary series", "Fast screening", "Baselines"],
            parameter: ParameterKind::Deviation,
        }
    }

    fn min_points(&self) -> usize {
        3
    }

    fn score(&self, series: &MetricSeries, params: &Hyperparameters) -> Result<Scored, DetectError> {
        let k = deviation_k("z-score", params)?;
        let values = series.values();
        let ts = TimeSeries::new(&values);
        let scores = values
            .iter()
            .map(|&v| ts.abs_z_score(v).map_or(0.0, |z| deviation_score(z, k)))
            .collect();
        Ok(Scored {
            scores,
            threshold: 0.5,
        })
    }
}
