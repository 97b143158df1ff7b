//! Local Outlier Factor over standardized per-point features.

use std::cmp::Ordering;

use tokio_util::sync::CancellationToken;

use super::isolation_forest::{contamination, contamination_threshold};
use super::registry::{Category, Detector, DetectorMeta, Scored};
use super::sensitivity::ParameterKind;
use super::stats::{min_max_normalize, point_features, standardize};
use super::{DetectError, Hyperparameters, MetricSeries};

pub struct LofDetector {
    n_neighbors: usize,
}

impl LofDetector {
    pub fn new(n_neighbors: usize) -> Self {
        Self {
            n_neighbors: n_neighbors.max(2),
        }
    }
}

fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

fn by_distance(a: &(usize, f64), b: &(usize, f64)) -> Ordering {
    a.1.total_cmp(&b.1).then(a.0.cmp(&b.0))
}

/// The `k` nearest neighbours of `rows[i]`, ascending by distance (self excluded).
fn nearest(rows: &[[f64; 3]], i: usize, k: usize) -> Vec<(usize, f64)> {
    let mut d: Vec<(usize, f64)> = (0..rows.len())
        .filter(|&j| j != i)
        .map(|j| (j, distance(&rows[i], &rows[j])))
        .collect();
    if k > 0 && k < d.len() {
        d.select_nth_unstable_by(k - 1, by_distance);
    }
    let mut nb = d[..k.min(d.len())].to_vec();
    nb.sort_by(by_distance);
    nb
}

/// Raw LOF values (about 1.0 for inliers, larger for outliers).
/// `None` when `cancel` fires before the neighbour search completes.
pub fn local_outlier_factors(rows: &[[f64; 3]], k: usize, cancel: &CancellationToken) -> Option<Vec<f64>> {
    let n = rows.len();
    let mut neighbours: Vec<Vec<(usize, f64)>> = Vec::with_capacity(n);
    for i in 0..n {
        if cancel.is_cancelled() {
            return None;
        }
        neighbours.push(nearest(rows, i, k));
    }

    let k_distance: Vec<f64> = neighbours
        .iter()
        .map(|nb| nb.last().map_or(0.0, |&(_, d)| d))
        .collect();

    let lrd: Vec<f64> = neighbours
        .iter()
        .map(|nb| {
            let mean_reach = nb
                .iter()
                .map(|&(j, d)| d.max(k_distance[j]))
                .sum::<f64>()
                / nb.len().max(1) as f64;
            1.0 / (mean_reach + 1e-10)
        })
        .collect();

    let factors = neighbours
        .iter()
        .enumerate()
        .map(|(i, nb)| {
            let ratio_sum: f64 = nb.iter().map(|&(j, _)| lrd[j] / lrd[i]).sum();
            ratio_sum / nb.len().max(1) as f64
        })
        .collect();
    Some(factors)
}

impl Detector for LofDetector {
    fn meta(&self) -> DetectorMeta {
        DetectorMeta {
            id: "lof",
            display_name: "Local Outlier Factor",
            category: Category::Ml,
            description: "Compares each point's local density with that of its neighbours.",
            best_for: &["Irregular clusters", "Density anomalies", "Non-linear data"],
            parameter: ParameterKind::Contamination,
        }
    }

    fn min_points(&self) -> usize {
        10
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
        let fraction = contamination("lof", params)?;
        let rows = standardize(&point_features(&series.values()));
        let k = self.n_neighbors.min(rows.len().saturating_sub(1));
        let factors = local_outlier_factors(&rows, k, cancel).ok_or_else(|| DetectError::cancelled("lof"))?;
        let scores = min_max_normalize(&factors);
        let threshold = contamination_threshold(&scores, fraction);
        Ok(Scored { scores, threshold })
    }
}
