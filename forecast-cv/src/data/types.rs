//! Core panel types.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::CvError;

/// Timestamp of a panel row: an integer-coded period or a calendar time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Int(i64),
    DateTime(NaiveDateTime),
}

impl Timestamp {
    /// Midnight of the given calendar date.
    pub fn date(date: NaiveDate) -> Self {
        Timestamp::DateTime(date.and_time(chrono::NaiveTime::MIN))
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Timestamp::Int(_))
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Timestamp::DateTime(dt) => Some(*dt),
            Timestamp::Int(_) => None,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Int(t) => write!(f, "{}", t),
            Timestamp::DateTime(dt) if dt.time() == chrono::NaiveTime::MIN => write!(f, "{}", dt.date()),
            Timestamp::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

/// Column names of a long-format panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelColumns {
    /// Column identifying each series.
    pub id_col: String,
    /// Column holding timestamps or integer periods.
    pub time_col: String,
    /// Column holding the target.
    pub target_col: String,
    /// Covariates that are constant per series and repeated when forecasting.
    pub static_features: Vec<String>,
}

impl Default for PanelColumns {
    fn default() -> Self {
        Self {
            id_col: "unique_id".to_string(),
            time_col: "ds".to_string(),
            target_col: "y".to_string(),
            static_features: Vec::new(),
        }
    }
}

/// A single series of the panel, sorted by time.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub id: String,
    pub times: Vec<Timestamp>,
    pub target: Vec<f64>,
    /// Named covariates aligned with `times`.
    pub covariates: BTreeMap<String, Vec<f64>>,
}

impl Series {
    pub fn new(id: impl Into<String>, times: Vec<Timestamp>, target: Vec<f64>) -> Self {
        Self {
            id: id.into(),
            times,
            target,
            covariates: BTreeMap::new(),
        }
    }

    /// Attach a covariate column.
    pub fn with_covariate(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.covariates.insert(name.into(), values);
        self
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn last_time(&self) -> Option<Timestamp> {
        self.times.last().copied()
    }

    /// Rows with `lower < time <= upper` (either bound optional).
    pub fn between(&self, lower: Option<Timestamp>, upper: Option<Timestamp>) -> Series {
        let start = lower.map_or(0, |lo| self.times.partition_point(|t| *t <= lo));
        let end = upper.map_or(self.times.len(), |hi| self.times.partition_point(|t| *t <= hi));
        let end = end.max(start);
        Series {
            id: self.id.clone(),
            times: self.times[start..end].to_vec(),
            target: self.target[start..end].to_vec(),
            covariates: self
                .covariates
                .iter()
                .map(|(name, values)| (name.clone(), values[start..end].to_vec()))
                .collect(),
        }
    }

    fn sort_by_time(&mut self) {
        if self.times.windows(2).all(|w| w[0] <= w[1]) {
            return;
        }
        let mut order: Vec<usize> = (0..self.times.len()).collect();
        order.sort_by_key(|&i| self.times[i]);
        self.times = order.iter().map(|&i| self.times[i]).collect();
        self.target = order.iter().map(|&i| self.target[i]).collect();
        for values in self.covariates.values_mut() {
            *values = order.iter().map(|&i| values[i]).collect();
        }
    }

    fn validate_lengths(&self) -> Result<(), CvError> {
        if self.target.len() != self.times.len() {
            return Err(CvError::config(format!(
                "series '{}': {} timestamps but {} target values",
                self.id,
                self.times.len(),
                self.target.len()
            )));
        }
        for (name, values) in &self.covariates {
            if values.len() != self.times.len() {
                return Err(CvError::config(format!(
                    "series '{}': covariate '{}' has {} values, expected {}",
                    self.id,
                    name,
                    values.len(),
                    self.times.len()
                )));
            }
        }
        Ok(())
    }

    fn validate_unique_times(&self) -> Result<(), CvError> {
        if let Some(w) = self.times.windows(2).find(|w| w[0] == w[1]) {
            return Err(CvError::config(format!("series '{}': duplicate timestamp {}", self.id, w[0])));
        }
        Ok(())
    }
}

/// Long-format multi-series panel. Series are sorted by id, rows by time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Panel {
    series: Vec<Series>,
}

impl Panel {
    /// Build a panel, sorting series by id and rows by time.
    ///
    /// Fails on mismatched column lengths, duplicate ids or timestamps, and
    /// on a mix of integer and calendar timestamps.
    pub fn new(mut series: Vec<Series>) -> Result<Self, CvError> {
        for s in &mut series {
            s.validate_lengths()?;
            s.sort_by_time();
            s.validate_unique_times()?;
        }
        series.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(w) = series.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(CvError::config(format!("duplicate series id '{}'", w[0].id)));
        }

        let mut kinds = series.iter().flat_map(|s| s.times.iter()).map(Timestamp::is_int);
        if let Some(first) = kinds.next() {
            if kinds.any(|k| k != first) {
                return Err(CvError::config("panel mixes integer and calendar timestamps"));
            }
        }

        Ok(Self { series })
    }

    pub(crate) fn from_sorted(series: Vec<Series>) -> Self {
        Self { series }
    }

    pub fn series(&self) -> &[Series] {
        &self.series
    }

    pub fn get(&self, id: &str) -> Option<&Series> {
        self.series
            .binary_search_by(|s| s.id.as_str().cmp(id))
            .ok()
            .map(|idx| &self.series[idx])
    }

    pub fn n_series(&self) -> usize {
        self.series.len()
    }

    pub fn n_rows(&self) -> usize {
        self.series.iter().map(Series::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows() == 0
    }

    /// True when the time column holds integer-coded periods.
    pub fn has_integer_times(&self) -> bool {
        self.series
            .iter()
            .find_map(|s| s.times.first())
            .map_or(false, Timestamp::is_int)
    }

    pub fn max_time(&self) -> Option<Timestamp> {
        self.series.iter().filter_map(Series::last_time).max()
    }

    pub fn min_time(&self) -> Option<Timestamp> {
        self.series.iter().filter_map(|s| s.times.first().copied()).min()
    }

    /// Flatten into `(series, time, target)` rows.
    pub fn target_rows(&self) -> Vec<TargetRow> {
        self.series
            .iter()
            .flat_map(|s| {
                s.times.iter().zip(&s.target).map(move |(time, value)| TargetRow {
                    series_id: s.id.clone(),
                    time: *time,
                    value: *value,
                })
            })
            .collect()
    }
}

/// One observed target value.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRow {
    pub series_id: String,
    pub time: Timestamp,
    pub value: f64,
}

/// A validation row joined with its forecast.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub series_id: String,
    pub time: Timestamp,
    pub actual: f64,
    pub predicted: f64,
}

/// Numeric feature table produced by a feature transform.
///
/// Values are row-major with `feature_names.len()` columns. `target` is empty
/// for tables built at forecast time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureTable {
    pub series_ids: Vec<String>,
    pub times: Vec<Timestamp>,
    pub feature_names: Vec<String>,
    pub values: Vec<f64>,
    pub target: Vec<f64>,
}

impl FeatureTable {
    pub fn n_rows(&self) -> usize {
        self.series_ids.len()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series_ids.is_empty()
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        let n = self.n_features();
        &self.values[idx * n..(idx + 1) * n]
    }

    pub fn feature_index(&self, name: &str) -> Option<usize> {
        self.feature_names.iter().position(|f| f == name)
    }
}

/// Future values of dynamic covariates, keyed by `(series, time)`.
#[derive(Debug, Clone, Default)]
pub struct DynamicFrame {
    columns: Vec<String>,
    rows: HashMap<(String, Timestamp), Vec<f64>>,
}

impl DynamicFrame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: HashMap::new(),
        }
    }

    /// Insert the covariate values of one `(series, time)` pair.
    pub fn insert(&mut self, series_id: impl Into<String>, time: Timestamp, values: Vec<f64>) -> Result<(), CvError> {
        if values.len() != self.columns.len() {
            return Err(CvError::config(format!(
                "dynamic frame row has {} values, expected {}",
                values.len(),
                self.columns.len()
            )));
        }
        self.rows.insert((series_id.into(), time), values);
        Ok(())
    }

    /// Covariates of `panel` not listed in `exclude`, keyed by row.
    ///
    /// Used to hand observed covariates to forecasts over history, such as
    /// the validation slices of backtest windows.
    pub fn from_panel(panel: &Panel, exclude: &[String]) -> Self {
        let columns: Vec<String> = panel
            .series()
            .iter()
            .flat_map(|s| s.covariates.keys())
            .filter(|name| !exclude.contains(name))
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut rows = HashMap::new();
        if !columns.is_empty() {
            for s in panel.series() {
                for (i, time) in s.times.iter().enumerate() {
                    let values = columns
                        .iter()
                        .map(|c| s.covariates.get(c).map_or(f64::NAN, |v| v[i]))
                        .collect();
                    rows.insert((s.id.clone(), *time), values);
                }
            }
        }
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, series_id: &str, time: Timestamp, column: &str) -> Option<f64> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows
            .get(&(series_id.to_string(), time))
            .map(|values| values[col])
    }
}

/// Forecasts for each `(series, time)` with one named column per model.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ForecastTable {
    pub series_ids: Vec<String>,
    pub times: Vec<Timestamp>,
    pub columns: Vec<(String, Vec<f64>)>,
}

impl ForecastTable {
    pub fn n_rows(&self) -> usize {
        self.series_ids.len()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Lookup from `(series, time)` to row index.
    pub fn index(&self) -> HashMap<(&str, Timestamp), usize> {
        self.series_ids
            .iter()
            .zip(&self.times)
            .enumerate()
            .map(|(i, (id, t))| ((id.as_str(), *t), i))
            .collect()
    }
}

/// A held-out forecast of one window, kept for post-hoc inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CvPrediction {
    pub window: usize,
    pub cutoff: Timestamp,
    pub series_id: String,
    pub time: Timestamp,
    pub actual: f64,
    pub predicted: f64,
}
