//! Feature engineering collaborators.
//!
//! - [`FeatureTransform`]: the contract the cross-validation engine consumes
//! - [`LagFeatures`]: reference transform built from lags, window statistics,
//!   calendar features and covariates, with recursive multi-step forecasting
//! - [`transforms`]: the window statistics themselves

pub mod lag_features;
pub mod transforms;

use std::sync::Arc;

use crate::data::{DynamicFrame, FeatureTable, ForecastTable, Frequency, Panel};
use crate::error::BoxError;
use crate::model::Predictor;

pub use lag_features::{DateFeature, LagFeatures, LagFeaturesConfig};
pub use transforms::{LagTransform, LaggedTransform};

/// Custom prediction hook called at every forecast step.
///
/// Receives the model, the features of the current step, the future
/// covariate frames and the feature names in training order. Extra
/// arguments are captured by the closure.
pub type PredictFn =
    Arc<dyn Fn(&dyn Predictor, &FeatureTable, &[DynamicFrame], &[String]) -> Result<Vec<f64>, BoxError> + Send + Sync>;

/// Options forwarded to [`FeatureTransform::fit_transform`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOptions {
    /// Frequency of calendar panels, shared with the window builder.
    pub freq: Option<Frequency>,
    /// Covariates repeated unchanged when forecasting.
    pub static_features: Vec<String>,
    /// Drop rows with missing features or target.
    pub dropna: bool,
    /// Keep only the last `n` observations per series for forecasting.
    pub keep_last_n: Option<usize>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            freq: None,
            static_features: Vec::new(),
            dropna: true,
            keep_last_n: None,
        }
    }
}

/// Turns a panel into a training table and forecasts recursively from the
/// state it keeps after fitting.
///
/// Cloning an unfit transform yields an independent template, so each
/// backtest window fits its own copy.
pub trait FeatureTransform: Clone + Send + Sync {
    /// Frequency the transform was configured with, if any.
    fn frequency(&self) -> Option<Frequency> {
        None
    }

    /// Fit on `panel` and return its feature table with the target attached.
    fn fit_transform(&mut self, panel: &Panel, options: &TransformOptions) -> Result<FeatureTable, BoxError>;

    /// Forecast `horizon` steps past the fitted data, one column per model.
    fn predict(
        &self,
        models: &[&dyn Predictor],
        horizon: usize,
        dynamic: &[DynamicFrame],
        predict_fn: Option<&PredictFn>,
    ) -> Result<ForecastTable, BoxError>;
}
