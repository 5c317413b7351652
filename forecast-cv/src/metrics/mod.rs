//! Forecast error metrics.
//!
//! Provides the metric registry used for evaluation and early stopping:
//! - MAPE, RMSE, MAE, SMAPE
//! - Caller-supplied pure metric functions
//!
//! All metrics average within each series first, then across series.

pub mod registry;

pub use registry::{CustomMetric, Metric, MetricName, CUSTOM_METRIC_LABEL};
