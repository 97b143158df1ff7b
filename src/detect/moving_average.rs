use super::registry::{Category, Detector, DetectorMeta, Scored};
use super::sensitivity::ParameterKind;
use super::stats::TimeSeries;
use super::zscore::{deviation_k, deviation_score};
use super::{DetectError, Hyperparameters, MetricSeries};

/// Deviation from a trailing rolling mean, in rolling standard deviations.
///
/// The window holds the `window` points *before* the one being scored, so a
/// spike does not inflate its own baseline. Points without a full window
/// score zero.
pub struct MovingAverageDetector {
    window: usize,
}

impl MovingAverageDetector {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
        }
    }
}

impl Detector for MovingAverageDetector {
    fn meta(&self) -> DetectorMeta {
        DetectorMeta {
            id: "moving-average",
            display_name: "Moving Average",
            category: Category::Statistical,
            description: "Rolling mean and deviation; follows local regime changes.",
            best_for: &["Trending series", "Regime shifts", "Slow seasonality"],
            parameter: ParameterKind::Deviation,
        }
    }

    fn min_points(&self) -> usize {
        self.window + 1
    }

    fn score(&self, series: &MetricSeries, params: &Hyperparameters) -> Result<Scored, DetectError> {
        let k = deviation_k("moving-average", params)?;
        let values = series.values();
        let scores = values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                if i < self.window {
                    return 0.0;
                }
                let window = TimeSeries::new(&values[i - self.window..i]);
                match window.abs_z_score(v) {
                    Some(z) => deviation_score(z, k),
                    // Flat window: any departure is maximal, no departure is nothing.
                    None if v == window.mean() => 0.0,
                    None => 1.0,
                }
            })
            .collect();
        Ok(Scored {
            scores,
            threshold: 0.5,
        })
    }
}
