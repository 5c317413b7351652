//! Window statistics computed over lagged target history.
//!
//! Every transform is evaluated against the history preceding the row being
//! built, so the same code path serves training rows and recursive forecasts.

use serde::{Deserialize, Serialize};

/// A statistic over the target, shifted by a lag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LagTransform {
    RollingMean {
        window_size: usize,
        #[serde(default)]
        min_samples: Option<usize>,
    },
    RollingStd {
        window_size: usize,
        #[serde(default)]
        min_samples: Option<usize>,
    },
    RollingMin {
        window_size: usize,
        #[serde(default)]
        min_samples: Option<usize>,
    },
    RollingMax {
        window_size: usize,
        #[serde(default)]
        min_samples: Option<usize>,
    },
    ExpandingMean,
    ExpandingStd,
    ExponentiallyWeightedMean {
        alpha: f64,
    },
}

/// A transform applied at a specific lag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaggedTransform {
    pub lag: usize,
    pub transform: LagTransform,
}

impl LaggedTransform {
    pub fn new(lag: usize, transform: LagTransform) -> Self {
        Self { lag, transform }
    }

    /// Feature column name, e.g. `rolling_mean_lag1_window_size7`.
    pub fn feature_name(&self) -> String {
        let lag = self.lag;
        match &self.transform {
            LagTransform::RollingMean { window_size, .. } => {
                format!("rolling_mean_lag{}_window_size{}", lag, window_size)
            }
            LagTransform::RollingStd { window_size, .. } => {
                format!("rolling_std_lag{}_window_size{}", lag, window_size)
            }
            LagTransform::RollingMin { window_size, .. } => {
                format!("rolling_min_lag{}_window_size{}", lag, window_size)
            }
            LagTransform::RollingMax { window_size, .. } => {
                format!("rolling_max_lag{}_window_size{}", lag, window_size)
            }
            LagTransform::ExpandingMean => format!("expanding_mean_lag{}", lag),
            LagTransform::ExpandingStd => format!("expanding_std_lag{}", lag),
            LagTransform::ExponentiallyWeightedMean { alpha } => {
                format!("exponentially_weighted_mean_lag{}_alpha{}", lag, alpha)
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.lag == 0 {
            return Err(format!("{}: lag must be at least 1", self.feature_name()));
        }
        match &self.transform {
            LagTransform::RollingMean { window_size, min_samples }
            | LagTransform::RollingStd { window_size, min_samples }
            | LagTransform::RollingMin { window_size, min_samples }
            | LagTransform::RollingMax { window_size, min_samples } => {
                if *window_size == 0 {
                    return Err(format!("{}: window_size must be at least 1", self.feature_name()));
                }
                if let Some(min) = min_samples {
                    if *min == 0 || min > window_size {
                        return Err(format!(
                            "{}: min_samples must be in 1..={}",
                            self.feature_name(),
                            window_size
                        ));
                    }
                }
            }
            LagTransform::ExponentiallyWeightedMean { alpha } => {
                if !(*alpha > 0.0 && *alpha <= 1.0) {
                    return Err(format!("{}: alpha must be in (0, 1]", self.feature_name()));
                }
            }
            LagTransform::ExpandingMean | LagTransform::ExpandingStd => {}
        }
        Ok(())
    }

    /// Value for the row that follows `history`. NaN when not enough data.
    pub fn compute(&self, history: &[f64]) -> f64 {
        if self.lag == 0 || history.len() < self.lag {
            return f64::NAN;
        }
        let visible = &history[..history.len() + 1 - self.lag];

        match &self.transform {
            LagTransform::RollingMean { window_size, min_samples } => {
                rolling(visible, *window_size, *min_samples, 1, mean)
            }
            LagTransform::RollingStd { window_size, min_samples } => {
                rolling(visible, *window_size, *min_samples, 2, std)
            }
            LagTransform::RollingMin { window_size, min_samples } => {
                rolling(visible, *window_size, *min_samples, 1, |v| {
                    v.iter().copied().fold(f64::INFINITY, f64::min)
                })
            }
            LagTransform::RollingMax { window_size, min_samples } => {
                rolling(visible, *window_size, *min_samples, 1, |v| {
                    v.iter().copied().fold(f64::NEG_INFINITY, f64::max)
                })
            }
            LagTransform::ExpandingMean => {
                let values = finite(visible);
                if values.is_empty() {
                    f64::NAN
                } else {
                    mean(&values)
                }
            }
            LagTransform::ExpandingStd => {
                let values = finite(visible);
                if values.len() < 2 {
                    f64::NAN
                } else {
                    std(&values)
                }
            }
            LagTransform::ExponentiallyWeightedMean { alpha } => {
                let mut smoothed: Option<f64> = None;
                for &x in visible.iter().filter(|x| !x.is_nan()) {
                    smoothed = Some(match smoothed {
                        None => x,
                        Some(prev) => alpha * x + (1.0 - alpha) * prev,
                    });
                }
                smoothed.unwrap_or(f64::NAN)
            }
        }
    }
}

fn rolling<F>(visible: &[f64], window_size: usize, min_samples: Option<usize>, floor: usize, stat: F) -> f64
where
    F: Fn(&[f64]) -> f64,
{
    let start = visible.len().saturating_sub(window_size);
    let values = finite(&visible[start..]);
    let required = min_samples.unwrap_or(window_size).max(floor);
    if values.len() < required {
        f64::NAN
    } else {
        stat(&values)
    }
}

fn finite(values: &[f64]) -> Vec<f64> {
    values.iter().copied().filter(|x| !x.is_nan()).collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator).
fn std(values: &[f64]) -> f64 {
    let m = mean(values);
    let var = values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}
