//! Matrix-profile discord detection.
//!
//! The matrix profile holds, for every subsequence of length `window`, the
//! z-normalized Euclidean distance to its nearest non-trivial neighbour.
//! Subsequences with no close match anywhere else in the series are discords.
//! Each point takes the largest profile value among the subsequences that
//! cover it, and that per-point discord is compared against the rest of the
//! series in standard deviations.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::registry::{matrix_profile_meta, Detector, DetectorMeta, Scored};
use super::stats::TimeSeries;
use super::zscore::{deviation_k, deviation_score};
use super::{DetectError, Hyperparameters, MetricSeries};

pub struct MatrixProfileDetector {
    window: usize,
}

impl MatrixProfileDetector {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
        }
    }
}

/// A subsequence after z-normalization; `None` when it is constant.
fn normalize(sub: &[f64]) -> Option<Vec<f64>> {
    let ts = TimeSeries::new(sub);
    let sd = ts.std_dev();
    if sd <= f64::EPSILON * ts.mean().abs().max(1.0) {
        return None;
    }
    let mean = ts.mean();
    Some(sub.iter().map(|v| (v - mean) / sd).collect())
}

/// z-normalized Euclidean distance. Two constant subsequences are identical;
/// a constant one against a varying one sits at `sqrt(m)`.
fn znorm_distance(a: &Option<Vec<f64>>, b: &Option<Vec<f64>>, m: usize) -> f64 {
    match (a, b) {
        (None, None) => 0.0,
        (Some(a), Some(b)) => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            .sqrt(),
        _ => (m as f64).sqrt(),
    }
}

/// Self-join matrix profile of `values` with subsequence length `m`.
/// `None` when `cancel` fires part way through.
pub fn matrix_profile(values: &[f64], m: usize, cancel: &CancellationToken) -> Option<Vec<f64>> {
    if m == 0 || values.len() < m {
        return Some(Vec::new());
    }
    let count = values.len() - m + 1;
    let exclusion = m.div_ceil(2);
    let subs: Vec<Option<Vec<f64>>> = (0..count).map(|i| normalize(&values[i..i + m])).collect();

    let mut profile = Vec::with_capacity(count);
    for i in 0..count {
        if cancel.is_cancelled() {
            return None;
        }
        let d = (0..count)
            .filter(|&j| i.abs_diff(j) >= exclusion)
            .map(|j| znorm_distance(&subs[i], &subs[j], m))
            .fold(f64::INFINITY, f64::min);
        profile.push(if d.is_finite() { d } else { 0.0 });
    }
    Some(profile)
}

impl Detector for MatrixProfileDetector {
    fn meta(&self) -> DetectorMeta {
        matrix_profile_meta()
    }

    fn min_points(&self) -> usize {
        3 * self.window
    }

    fn score(&self, series: &MetricSeries, params: &Hyperparameters) -> Result<Scored, DetectError> {
        self.score_until(series, params, &CancellationToken::new())
    }

    fn score_until(
        &self,
        series: &MetricSeries,
        params: &Hyperparameters,
        cancel: &CancellationToken,
    ) -> Result<Scored, DetectError> {
        let k = deviation_k("matrix-profile", params)?;
        let values = series.values();
        let m = self.window;
        let profile = matrix_profile(&values, m, cancel).ok_or_else(|| DetectError::cancelled("matrix-profile"))?;

        let discord: Vec<f64> = (0..values.len())
            .map(|p| {
                let first = p.saturating_sub(m - 1);
                let last = p.min(profile.len().saturating_sub(1));
                profile[first..=last].iter().copied().fold(0.0, f64::max)
            })
            .collect();

        let ts = TimeSeries::new(&discord);
        debug!(
            window = m,
            subsequences = profile.len(),
            mean = ts.mean(),
            std = ts.std_dev(),
            "matrix profile computed"
        );
        let scores = discord
            .iter()
            .map(|&d| match ts.abs_z_score(d) {
                // Only unusually large distances are discords.
                Some(z) if d > ts.mean() => deviation_score(z, k),
                _ => 0.0,
            })
            .collect();

        Ok(Scored {
            scores,
            threshold: 0.5,
        })
    }
}
