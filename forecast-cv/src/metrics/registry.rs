//! Named and custom forecast error metrics.
//!
//! Every metric averages in two levels: errors are reduced within each series
//! first, then the per-series scores are averaged with equal weight, so long
//! series do not dominate the result.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::data::Scored;
use crate::error::CvError;

/// Label used for caller-supplied metric functions.
pub const CUSTOM_METRIC_LABEL: &str = "custom_metric";

/// Built-in metrics. Lower is better for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    Mape,
    Rmse,
    Mae,
    Smape,
}

impl MetricName {
    pub const ALL: [MetricName; 4] = [MetricName::Mape, MetricName::Rmse, MetricName::Mae, MetricName::Smape];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Mape => "mape",
            MetricName::Rmse => "rmse",
            MetricName::Mae => "mae",
            MetricName::Smape => "smape",
        }
    }

    pub fn evaluate(&self, rows: &[Scored]) -> f64 {
        match self {
            MetricName::Mape => mape(rows),
            MetricName::Rmse => rmse(rows),
            MetricName::Mae => mae(rows),
            MetricName::Smape => smape(rows),
        }
    }
}

impl FromStr for MetricName {
    type Err = CvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricName::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = MetricName::ALL.iter().map(MetricName::as_str).collect();
                CvError::config(format!(
                    "{} is not one of the implemented metrics: ({})",
                    s,
                    known.join(", ")
                ))
            })
    }
}

/// A pure function of the scored validation rows of one window.
pub type CustomMetric = Arc<dyn Fn(&[Scored]) -> f64 + Send + Sync>;

/// Metric used for evaluation and early stopping.
#[derive(Clone)]
pub enum Metric {
    Named(MetricName),
    Custom(CustomMetric),
}

impl Metric {
    /// Look up a built-in metric by name.
    pub fn named(name: &str) -> Result<Self, CvError> {
        Ok(Metric::Named(name.parse()?))
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[Scored]) -> f64 + Send + Sync + 'static,
    {
        Metric::Custom(Arc::new(f))
    }

    /// Name reported in logs; custom metrics are always `custom_metric`.
    pub fn label(&self) -> &str {
        match self {
            Metric::Named(name) => name.as_str(),
            Metric::Custom(_) => CUSTOM_METRIC_LABEL,
        }
    }

    pub fn evaluate(&self, rows: &[Scored]) -> f64 {
        match self {
            Metric::Named(name) => name.evaluate(rows),
            Metric::Custom(f) => f(rows),
        }
    }
}

impl Default for Metric {
    fn default() -> Self {
        Metric::Named(MetricName::Mape)
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Metric({})", self.label())
    }
}

impl Serialize for Metric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Metric {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Metric::named(&name).map_err(serde::de::Error::custom)
    }
}

/// Reduce each series' rows with `per_series`, then average across series.
pub fn series_mean<F>(rows: &[Scored], per_series: F) -> f64
where
    F: Fn(&[&Scored]) -> f64,
{
    let mut groups: BTreeMap<&str, Vec<&Scored>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.series_id.as_str()).or_default().push(row);
    }
    if groups.is_empty() {
        return f64::NAN;
    }
    let total: f64 = groups.values().map(|g| per_series(g.as_slice())).sum();
    total / groups.len() as f64
}

fn mean_of<F>(rows: &[&Scored], f: F) -> f64
where
    F: Fn(&Scored) -> f64,
{
    rows.iter().map(|r| f(*r)).sum::<f64>() / rows.len() as f64
}

/// Mean absolute percentage error, relative to the actual value.
pub fn mape(rows: &[Scored]) -> f64 {
    series_mean(rows, |g| mean_of(g, |r| (r.actual - r.predicted).abs() / r.actual))
}

/// Root mean squared error per series, averaged across series.
pub fn rmse(rows: &[Scored]) -> f64 {
    series_mean(rows, |g| mean_of(g, |r| (r.actual - r.predicted).powi(2)).sqrt())
}

pub fn mae(rows: &[Scored]) -> f64 {
    series_mean(rows, |g| mean_of(g, |r| (r.actual - r.predicted).abs()))
}

/// Symmetric MAPE in `[0, 2]`; a row where both values are zero scores zero.
pub fn smape(rows: &[Scored]) -> f64 {
    series_mean(rows, |g| {
        mean_of(g, |r| {
            let denom = r.actual.abs() + r.predicted.abs();
            if denom == 0.0 {
                0.0
            } else {
                2.0 * (r.actual - r.predicted).abs() / denom
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Timestamp;
    use approx::assert_relative_eq;

    fn scored(id: &str, t: i64, actual: f64, predicted: f64) -> Scored {
        Scored {
            series_id: id.to_string(),
            time: Timestamp::Int(t),
            actual,
            predicted,
        }
    }

    #[test]
    fn test_rmse_averages_per_series_first() {
        // Series a: errors 3, 3, 3, 3 -> rmse 3. Series b: one error of 1 -> rmse 1.
        let mut rows: Vec<Scored> = (0..4).map(|t| scored("a", t, 10.0, 7.0)).collect();
        rows.push(scored("b", 0, 5.0, 4.0));
        assert_relative_eq!(rmse(&rows), 2.0);
        // A pooled computation over all rows would give sqrt(37 / 5).
        assert!((rmse(&rows) - (37.0f64 / 5.0).sqrt()).abs() > 0.1);
    }

    #[test]
    fn test_mape() {
        let rows = vec![scored("a", 0, 100.0, 90.0), scored("a", 1, 50.0, 60.0), scored("b", 0, 10.0, 10.0)];
        // a: (0.1 + 0.2) / 2 = 0.15, b: 0 -> 0.075
        assert_relative_eq!(mape(&rows), 0.075, epsilon = 1e-12);
    }

    #[test]
    fn test_mae_and_smape() {
        let rows = vec![scored("a", 0, 1.0, 3.0), scored("a", 1, 0.0, 0.0)];
        assert_relative_eq!(mae(&rows), 1.0);
        // (2*2/4 + 0) / 2
        assert_relative_eq!(smape(&rows), 0.5);
    }

    #[test]
    fn test_empty_rows_is_nan() {
        assert!(rmse(&[]).is_nan());
    }

    #[test]
    fn test_named_lookup() {
        assert_eq!(Metric::named("rmse").unwrap().label(), "rmse");
        let err = Metric::named("r2").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("mape, rmse, mae, smape"));
    }

    #[test]
    fn test_custom_metric_label() {
        let metric = Metric::custom(|rows| rows.len() as f64);
        assert_eq!(metric.label(), CUSTOM_METRIC_LABEL);
        assert_eq!(metric.evaluate(&[scored("a", 0, 1.0, 1.0)]), 1.0);
    }

    #[test]
    fn test_metric_serde() {
        let metric: Metric = serde_json::from_str("\"smape\"").unwrap();
        assert_eq!(metric.label(), "smape");
        assert_eq!(serde_json::to_string(&Metric::default()).unwrap(), "\"mape\"");
        assert!(serde_json::from_str::<Metric>("\"accuracy\"").is_err());
    }
}
