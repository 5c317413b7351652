//! Reference feature transform: lags, lag statistics, calendar features and
//! covariates, forecast recursively one step at a time.

use std::collections::BTreeSet;

use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};

use super::transforms::LaggedTransform;
use super::{FeatureTransform, PredictFn, TransformOptions};
use crate::data::{DynamicFrame, FeatureTable, ForecastTable, Frequency, Panel, Timestamp};
use crate::error::BoxError;
use crate::model::Predictor;

/// Calendar attribute of a timestamp used as a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateFeature {
    Year,
    Quarter,
    Month,
    Week,
    Day,
    Dayofweek,
    Dayofyear,
    Hour,
}

impl DateFeature {
    pub fn name(&self) -> &'static str {
        match self {
            DateFeature::Year => "year",
            DateFeature::Quarter => "quarter",
            DateFeature::Month => "month",
            DateFeature::Week => "week",
            DateFeature::Day => "day",
            DateFeature::Dayofweek => "dayofweek",
            DateFeature::Dayofyear => "dayofyear",
            DateFeature::Hour => "hour",
        }
    }

    fn value(&self, ts: Timestamp) -> Option<f64> {
        let dt = ts.as_datetime()?;
        let v = match self {
            DateFeature::Year => dt.year() as f64,
            DateFeature::Quarter => ((dt.month() - 1) / 3 + 1) as f64,
            DateFeature::Month => dt.month() as f64,
            DateFeature::Week => dt.iso_week().week() as f64,
            DateFeature::Day => dt.day() as f64,
            DateFeature::Dayofweek => dt.weekday().num_days_from_monday() as f64,
            DateFeature::Dayofyear => dt.ordinal() as f64,
            DateFeature::Hour => dt.hour() as f64,
        };
        Some(v)
    }
}

/// Which features to build.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LagFeaturesConfig {
    /// Frequency of calendar panels. Integer panels always step by one.
    pub freq: Option<Frequency>,
    /// Lags of the target, e.g. `[1, 7]`.
    pub lags: Vec<usize>,
    pub lag_transforms: Vec<LaggedTransform>,
    pub date_features: Vec<DateFeature>,
}

impl LagFeaturesConfig {
    pub fn with_freq(mut self, freq: Frequency) -> Self {
        self.freq = Some(freq);
        self
    }

    pub fn with_lags(mut self, lags: Vec<usize>) -> Self {
        self.lags = lags;
        self
    }

    pub fn with_lag_transform(mut self, transform: LaggedTransform) -> Self {
        self.lag_transforms.push(transform);
        self
    }

    pub fn with_date_features(mut self, features: Vec<DateFeature>) -> Self {
        self.date_features = features;
        self
    }

    fn validate(&self) -> Result<(), BoxError> {
        if self.lags.contains(&0) {
            return Err("lags must be at least 1".into());
        }
        for transform in &self.lag_transforms {
            transform.validate()?;
        }
        Ok(())
    }
}

/// Per-series state kept after fitting, extended while forecasting.
#[derive(Debug, Clone)]
struct SeriesState {
    id: String,
    last_time: Timestamp,
    history: Vec<f64>,
    statics: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Fitted {
    freq: Frequency,
    dynamic_features: Vec<String>,
    feature_names: Vec<String>,
    series: Vec<SeriesState>,
}

/// Lag-based feature transform.
#[derive(Debug, Clone, Default)]
pub struct LagFeatures {
    config: LagFeaturesConfig,
    fitted: Option<Fitted>,
}

impl LagFeatures {
    pub fn new(config: LagFeaturesConfig) -> Self {
        Self { config, fitted: None }
    }

    pub fn config(&self) -> &LagFeaturesConfig {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    /// Feature names in training order, once fitted.
    pub fn feature_names(&self) -> Option<&[String]> {
        self.fitted.as_ref().map(|f| f.feature_names.as_slice())
    }

    fn target_feature_names(&self) -> Vec<String> {
        let lags = self.config.lags.iter().map(|lag| format!("lag{}", lag));
        let transforms = self.config.lag_transforms.iter().map(LaggedTransform::feature_name);
        let dates = self.config.date_features.iter().map(|d| d.name().to_string());
        lags.chain(transforms).chain(dates).collect()
    }

    /// Lag, lag-statistic and calendar values for the row following `history`.
    fn push_target_features(&self, history: &[f64], time: Timestamp, out: &mut Vec<f64>) -> Result<(), BoxError> {
        for &lag in &self.config.lags {
            let value = if history.len() >= lag {
                history[history.len() - lag]
            } else {
                f64::NAN
            };
            out.push(value);
        }
        for transform in &self.config.lag_transforms {
            out.push(transform.compute(history));
        }
        for feature in &self.config.date_features {
            let value = feature
                .value(time)
                .ok_or_else(|| format!("date feature '{}' needs calendar timestamps", feature.name()))?;
            out.push(value);
        }
        Ok(())
    }
}

fn lookup_dynamic(frames: &[DynamicFrame], series_id: &str, time: Timestamp, column: &str) -> Option<f64> {
    frames.iter().find_map(|f| f.get(series_id, time, column))
}

impl FeatureTransform for LagFeatures {
    fn frequency(&self) -> Option<Frequency> {
        self.config.freq
    }

    fn fit_transform(&mut self, panel: &Panel, options: &TransformOptions) -> Result<FeatureTable, BoxError> {
        self.config.validate()?;
        if panel.is_empty() {
            return Err("cannot fit features on an empty panel".into());
        }

        let freq = match (options.freq, self.config.freq) {
            (Some(shared), Some(own)) if shared != own => {
                return Err(format!("frequency {} conflicts with the configured {}", shared, own).into());
            }
            (shared, own) => shared.or(own),
        };
        let freq = if panel.has_integer_times() {
            Frequency::UNIT
        } else {
            freq.ok_or("calendar timestamps require a frequency")?
        };
        if panel.has_integer_times() && !self.config.date_features.is_empty() {
            return Err("date features need calendar timestamps".into());
        }

        let static_features = options.static_features.clone();
        let dynamic_features: Vec<String> = panel
            .series()
            .iter()
            .flat_map(|s| s.covariates.keys())
            .filter(|name| !static_features.contains(name))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for s in panel.series() {
            for name in static_features.iter().chain(&dynamic_features) {
                if !s.covariates.contains_key(name) {
                    return Err(format!("series '{}' is missing covariate '{}'", s.id, name).into());
                }
            }
        }

        let mut feature_names: Vec<String> = static_features.iter().chain(&dynamic_features).cloned().collect();
        feature_names.extend(self.target_feature_names());
        if feature_names.is_empty() {
            return Err("no features configured: add lags, lag transforms, date features or covariates".into());
        }

        let mut table = FeatureTable {
            feature_names: feature_names.clone(),
            ..FeatureTable::default()
        };
        let mut states = Vec::with_capacity(panel.n_series());
        let mut row = Vec::with_capacity(feature_names.len());

        for s in panel.series() {
            if s.is_empty() {
                continue;
            }
            for t in 0..s.len() {
                row.clear();
                for name in static_features.iter().chain(&dynamic_features) {
                    row.push(s.covariates[name][t]);
                }
                self.push_target_features(&s.target[..t], s.times[t], &mut row)?;

                let target = s.target[t];
                if options.dropna && (target.is_nan() || row.iter().any(|v| v.is_nan())) {
                    continue;
                }
                table.series_ids.push(s.id.clone());
                table.times.push(s.times[t]);
                table.values.extend_from_slice(&row);
                table.target.push(target);
            }

            let keep_from = options.keep_last_n.map_or(0, |n| s.len().saturating_sub(n));
            let last = s.len() - 1;
            states.push(SeriesState {
                id: s.id.clone(),
                last_time: s.times[last],
                history: s.target[keep_from..].to_vec(),
                statics: static_features.iter().map(|name| s.covariates[name][last]).collect(),
            });
        }

        if table.is_empty() {
            return Err("feature table is empty after dropping rows with missing values".into());
        }

        self.fitted = Some(Fitted {
            freq,
            dynamic_features,
            feature_names,
            series: states,
        });
        Ok(table)
    }

    fn predict(
        &self,
        models: &[&dyn Predictor],
        horizon: usize,
        dynamic: &[DynamicFrame],
        predict_fn: Option<&PredictFn>,
    ) -> Result<ForecastTable, BoxError> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or("features must be fitted before predicting")?;
        if horizon == 0 {
            return Err("horizon must be at least 1".into());
        }
        if models.is_empty() {
            return Err("no models to predict with".into());
        }

        let n_series = fitted.series.len();
        // times[series][step]
        let times: Vec<Vec<Timestamp>> = fitted
            .series
            .iter()
            .map(|s| {
                (1..=horizon as i64)
                    .map(|h| fitted.freq.shift(s.last_time, h))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<_, _>>()?;

        let mut columns = Vec::with_capacity(models.len());
        for model in models {
            let mut histories: Vec<Vec<f64>> = fitted.series.iter().map(|s| s.history.clone()).collect();
            let mut forecasts = vec![Vec::with_capacity(horizon); n_series];

            for step in 0..horizon {
                let mut step_table = FeatureTable {
                    feature_names: fitted.feature_names.clone(),
                    ..FeatureTable::default()
                };
                for (idx, state) in fitted.series.iter().enumerate() {
                    let time = times[idx][step];
                    step_table.values.extend_from_slice(&state.statics);
                    for name in &fitted.dynamic_features {
                        let value = lookup_dynamic(dynamic, &state.id, time, name).ok_or_else(|| {
                            format!("missing future value of '{}' for series '{}' at {}", name, state.id, time)
                        })?;
                        step_table.values.push(value);
                    }
                    self.push_target_features(&histories[idx], time, &mut step_table.values)?;
                    step_table.series_ids.push(state.id.clone());
                    step_table.times.push(time);
                }

                let preds = match predict_fn {
                    Some(f) => f(*model, &step_table, dynamic, &fitted.feature_names)?,
                    None => model.predict(&step_table)?,
                };
                if preds.len() != n_series {
                    return Err(format!(
                        "model '{}' returned {} predictions for {} series",
                        model.name(),
                        preds.len(),
                        n_series
                    )
                    .into());
                }
                for (idx, pred) in preds.into_iter().enumerate() {
                    histories[idx].push(pred);
                    forecasts[idx].push(pred);
                }
            }
            columns.push((model.name().to_string(), forecasts.concat()));
        }

        let mut table = ForecastTable {
            columns,
            ..ForecastTable::default()
        };
        for (state, series_times) in fitted.series.iter().zip(&times) {
            for time in series_times {
                table.series_ids.push(state.id.clone());
                table.times.push(*time);
            }
        }
        Ok(table)
    }
}
