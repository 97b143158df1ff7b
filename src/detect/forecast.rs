//! Prophet-style detection: fit trend (+ optional additive seasonality), then
//! flag observations that fall outside the forecast confidence interval.

use tracing::debug;

use super::registry::{Category, Detector, DetectorMeta, Scored};
use super::sensitivity::ParameterKind;
use super::stats::{normal_quantile, TimeSeries};
use super::{DetectError, Hyperparameters, MetricSeries};

pub struct ForecastDetector {
    /// Season length in points; 0 disables the seasonal component.
    seasonal_period: usize,
}

impl ForecastDetector {
    pub fn new(seasonal_period: usize) -> Self {
        Self { seasonal_period }
    }
}

/// Fitted in-sample forecast.
#[derive(Debug, Clone)]
pub struct Forecast {
    pub yhat: Vec<f64>,
    /// Half width of the interval around `yhat`.
    pub half_width: f64,
}

/// Ordinary least squares `y = a + b t`.
fn linear_trend(t: &[f64], y: &[f64]) -> (f64, f64) {
    let tm = TimeSeries::new(t).mean();
    let ym = TimeSeries::new(y).mean();
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (ti, yi) in t.iter().zip(y) {
        sxy += (ti - tm) * (yi - ym);
        sxx += (ti - tm).powi(2);
    }
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    (ym - slope * tm, slope)
}

impl ForecastDetector {
    pub fn fit(&self, series: &MetricSeries, width: f64) -> Forecast {
        let t = series.elapsed_secs();
        let y = series.values();
        let (intercept, slope) = linear_trend(&t, &y);
        let mut yhat: Vec<f64> = t.iter().map(|ti| intercept + slope * ti).collect();

        let p = self.seasonal_period;
        if p >= 2 && y.len() >= 2 * p {
            let mut phase_sum = vec![0.0; p];
            let mut phase_n = vec![0usize; p];
            for (i, (yi, fi)) in y.iter().zip(&yhat).enumerate() {
                phase_sum[i % p] += yi - fi;
                phase_n[i % p] += 1;
            }
            for (i, fi) in yhat.iter_mut().enumerate() {
                *fi += phase_sum[i % p] / phase_n[i % p] as f64;
            }
        }

        let residuals: Vec<f64> = y.iter().zip(&yhat).map(|(yi, fi)| yi - fi).collect();
        let mut sigma = TimeSeries::new(&residuals).std_dev();
        let scale = TimeSeries::new(&y.iter().map(|v| v.abs()).collect::<Vec<_>>()).mean();
        if sigma <= 1e-9 * scale.max(1.0) {
            sigma = 0.0;
        }
        let z = normal_quantile(0.5 + width / 2.0);
        debug!(slope, sigma, z, seasonal_period = p, "forecast fitted");

        Forecast {
            yhat,
            half_width: z * sigma,
        }
    }
}

impl Detector for ForecastDetector {
    fn meta(&self) -> DetectorMeta {
        DetectorMeta {
            id: "prophet",
            display_name: "Forecast Interval (Prophet-style)",
            category: Category::Advanced,
            description: "Trend plus seasonality forecast; flags values outside the confidence interval.",
            best_for: &["Trending series", "Daily or weekly cycles", "Capacity metrics"],
            parameter: ParameterKind::Interval,
        }
    }

    fn min_points(&self) -> usize {
        10
    }

    fn score(&self, series: &MetricSeries, params: &Hyperparameters) -> Result<Scored, DetectError> {
        let width = match params {
            Hyperparameters::Interval { width } => *width,
            other => {
                return Err(DetectError::computation(
                    "prophet",
                    format!("expected an interval width, got {other:?}"),
                ))
            }
        };

        let forecast = self.fit(series, width);
        let scores = if forecast.half_width <= 0.0 {
            // Perfect fit; remaining residuals are rounding noise.
            vec![0.0; series.len()]
        } else {
            series
                .points
                .iter()
                .zip(&forecast.yhat)
                .map(|(p, f)| ((p.value - f).abs() / forecast.half_width / 2.0).clamp(0.0, 1.0))
                .collect()
        };
        Ok(Scored {
            scores,
            threshold: 0.5,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::testing::minute_series;
    use crate::detect::Sensitivity;

    #[test]
    fn test_linear_series_is_quiet() {
        let values: Vec<f64> = (0..20).map(|i| 5.0 + 2.0 * i as f64).collect();
        let r = ForecastDetector::new(0)
            .detect(&minute_series(&values), Sensitivity::High, &Hyperparameters::Interval { width: 0.8 })
            .unwrap();
        assert_eq!(r.anomaly_count(), 0);
    }

    #[test]
    fn test_outlier_on_trend() {
        let mut values: Vec<f64> = (0..40).map(|i| 100.0 + i as f64 + (i % 3) as f64 * 0.5).collect();
        values[30] += 60.0;
        let r = ForecastDetector::new(0)
            .detect(&minute_series(&values), Sensitivity::Medium, &Hyperparameters::Interval { width: 0.95 })
            .unwrap();
        assert!(r.flags[30]);
        assert_eq!(r.anomaly_count(), 1);
    }

    #[test]
    fn test_seasonality_absorbs_cycle() {
        // Square wave with period 4 and a single break in the pattern.
        let mut values: Vec<f64> = (0..48).map(|i| if i % 4 < 2 { 10.0 } else { 30.0 }).collect();
        values[34] = 10.0;
        let seasonal = ForecastDetector::new(4)
            .detect(&minute_series(&values), Sensitivity::Medium, &Hyperparameters::Interval { width: 0.95 })
            .unwrap();
        assert!(seasonal.flags[34]);
        assert!(seasonal.anomaly_count() <= 2, "{:?}", seasonal.flags);
    }

    #[test]
    fn test_wider_interval_flags_less() {
        let values: Vec<f64> = (0..60).map(|i| ((i * 17) % 23) as f64).collect();
        let s = minute_series(&values);
        let d = ForecastDetector::new(0);
        let count = |width| {
            d.detect(&s, Sensitivity::Medium, &Hyperparameters::Interval { width })
                .unwrap()
                .anomaly_count()
        };
        assert!(count(0.99) <= count(0.95));
        assert!(count(0.95) <= count(0.80));
    }
}
