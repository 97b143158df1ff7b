//! Isolation forest over per-point features (value, first difference, relative change).
//!
//! Scores follow Liu et al.: `s(x) = 2^(-E[h(x)] / c(psi))`, higher is more
//! anomalous. The contamination fraction places the threshold at the
//! `1 - fraction` percentile of the scores, which is the same decision rule as
//! "outlier decision function below zero".

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::registry::{Category, Detector, DetectorMeta, Scored};
use super::sensitivity::ParameterKind;
use super::stats::{percentile, point_features};
use super::{DetectError, Hyperparameters, MetricSeries};
use crate::config::IsolationForestConfig;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Average path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Features with a finite, non-zero spread over `idx`, with their bounds.
fn split_candidates(rows: &[[f64; 3]], idx: &[usize]) -> Vec<(usize, f64, f64)> {
    (0..3)
        .filter_map(|feature| {
            let (lo, hi) = idx.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                (lo.min(rows[i][feature]), hi.max(rows[i][feature]))
            });
            (lo < hi && (hi - lo).is_finite()).then_some((feature, lo, hi))
        })
        .collect()
}

enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        value: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn build(rows: &[[f64; 3]], idx: Vec<usize>, depth: usize, limit: usize, rng: &mut StdRng) -> Node {
        if depth >= limit || idx.len() <= 1 {
            return Node::Leaf { size: idx.len() };
        }

        let candidates = split_candidates(rows, &idx);
        if candidates.is_empty() {
            return Node::Leaf { size: idx.len() };
        }

        let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        let value = rng.gen_range(lo..hi);
        let (left, right): (Vec<usize>, Vec<usize>) =
            idx.into_iter().partition(|&i| rows[i][feature] < value);

        Node::Split {
            feature,
            value,
            left: Box::new(Node::build(rows, left, depth + 1, limit, rng)),
            right: Box::new(Node::build(rows, right, depth + 1, limit, rng)),
        }
    }

    fn path_length(&self, x: &[f64; 3], depth: usize) -> f64 {
        match self {
            Node::Leaf { size } => depth as f64 + average_path_length(*size),
            Node::Split {
                feature,
                value,
                left,
                right,
            } => {
                if x[*feature] < *value {
                    left.path_length(x, depth + 1)
                } else {
                    right.path_length(x, depth + 1)
                }
            }
        }
    }
}

/// A fitted forest.
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
}

impl IsolationForest {
    pub fn fit(rows: &[[f64; 3]], cfg: &IsolationForestConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let sample_size = cfg.sample_size.min(rows.len()).max(1);
        let limit = (sample_size as f64).log2().ceil().max(1.0) as usize;

        let trees = (0..cfg.n_trees.max(1))
            .map(|_| {
                let idx = index::sample(&mut rng, rows.len(), sample_size).into_vec();
                Node::build(rows, idx, 0, limit, &mut rng)
            })
            .collect();

        Self { trees, sample_size }
    }

    pub fn score(&self, x: &[f64; 3]) -> f64 {
        let mean_path = self
            .trees
            .iter()
            .map(|t| t.path_length(x, 0))
            .sum::<f64>()
            / self.trees.len() as f64;
        let c = average_path_length(self.sample_size);
        if c <= 0.0 {
            return 0.5;
        }
        2f64.powf(-mean_path / c)
    }
}

pub struct IsolationForestDetector {
    cfg: IsolationForestConfig,
}

impl IsolationForestDetector {
    pub fn new(cfg: IsolationForestConfig) -> Self {
        Self { cfg }
    }
}

pub(crate) fn contamination(method: &str, params: &Hyperparameters) -> Result<f64, DetectError> {
    match params {
        Hyperparameters::Contamination { fraction } => Ok(*fraction),
        other => Err(DetectError::computation(
            method,
            format!("expected a contamination fraction, got {other:?}"),
        )),
    }
}

/// Threshold such that roughly `fraction` of `scores` lie above it.
pub(crate) fn contamination_threshold(scores: &[f64], fraction: f64) -> f64 {
    percentile(scores, 100.0 * (1.0 - fraction))
}

impl Detector for IsolationForestDetector {
    fn meta(&self) -> DetectorMeta {
        DetectorMeta {
            id: "isolation-forest",
            display_name: "Isolation Forest",
            category: Category::Ml,
            description: "Isolates points with random axis-aligned splits; outliers isolate early.",
            best_for: &["Spikes", "Complex anomalies", "Production default"],
            parameter: ParameterKind::Contamination,
        }
    }

    fn min_points(&self) -> usize {
        10
    }

    fn score(&self, series: &MetricSeries, params: &Hyperparameters) -> Result<Scored, DetectError> {
        let fraction = contamination("isolation-forest", params)?;
        let rows = point_features(&series.values());
        let all: Vec<usize> = (0..rows.len()).collect();
        if split_candidates(&rows, &all).is_empty() {
            return Err(DetectError::computation(
                "isolation-forest",
                "feature ranges overflow; no feature can be split",
            ));
        }
        let forest = IsolationForest::fit(&rows, &self.cfg);
        debug!(
            points = rows.len(),
            trees = forest.trees.len(),
            sample_size = forest.sample_size,
            "isolation forest fitted"
        );

        let scores: Vec<f64> = rows.iter().map(|x| forest.score(x)).collect();
        let threshold = contamination_threshold(&scores, fraction);
        Ok(Scored { scores, threshold })
    }
}
