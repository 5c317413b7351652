//! Panel loading and forecast export through polars.
//!
//! Panels are read from CSV or Parquet files in long format, one row per
//! `(series, time)` with the columns named in [`PanelColumns`]. Every other
//! numeric column becomes a covariate.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use thiserror::Error;

use super::types::{CvPrediction, DynamicFrame, ForecastTable, Panel, PanelColumns, Series, Timestamp};
use crate::error::CvError;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid panel: {0}")]
    Panel(#[from] CvError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read a CSV or Parquet file into a DataFrame, chosen by extension.
pub fn read_frame(path: &Path) -> Result<DataFrame, LoaderError> {
    if !path.exists() {
        return Err(LoaderError::FileNotFound(path.display().to_string()));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    let df = match extension.as_deref() {
        Some("parquet") | Some("pq") => {
            LazyFrame::scan_parquet(path, ScanArgsParquet::default())?.collect()?
        }
        _ => CsvReadOptions::default()
            .with_has_header(true)
            .with_parse_options(CsvParseOptions::default().with_try_parse_dates(true))
            .try_into_reader_with_file_path(Some(path.to_path_buf()))?
            .finish()?,
    };
    Ok(df)
}

/// Load a panel file.
pub fn load_panel(path: &Path, columns: &PanelColumns) -> Result<Panel, LoaderError> {
    let df = read_frame(path)?;
    frame_to_panel(&df, columns)
}

/// Convert a long-format DataFrame into a [`Panel`].
///
/// Null ids or timestamps are rejected; null target or covariate values
/// become `NaN`.
pub fn frame_to_panel(df: &DataFrame, columns: &PanelColumns) -> Result<Panel, LoaderError> {
    let ids = string_values(df.column(&columns.id_col)?)?;
    let times = timestamp_values(df.column(&columns.time_col)?)?;
    let target = float_values(df.column(&columns.target_col)?)?;

    let covariate_names: Vec<String> = df
        .get_columns()
        .iter()
        .filter(|c| is_numeric(c.dtype()))
        .map(|c| c.name().to_string())
        .filter(|name| {
            name != &columns.id_col && name != &columns.time_col && name != &columns.target_col
        })
        .collect();

    for name in &columns.static_features {
        if !covariate_names.contains(name) {
            return Err(LoaderError::InvalidData(format!(
                "static feature '{}' is not a numeric column",
                name
            )));
        }
    }

    let mut covariates = Vec::with_capacity(covariate_names.len());
    for name in &covariate_names {
        covariates.push(float_values(df.column(name)?)?);
    }

    let mut grouped: BTreeMap<String, Series> = BTreeMap::new();
    for (row, id) in ids.into_iter().enumerate() {
        let series = grouped
            .entry(id.clone())
            .or_insert_with(|| Series::new(id, Vec::new(), Vec::new()));
        series.times.push(times[row]);
        series.target.push(target[row]);
        for (name, values) in covariate_names.iter().zip(&covariates) {
            series
                .covariates
                .entry(name.clone())
                .or_default()
                .push(values[row]);
        }
    }

    Ok(Panel::new(grouped.into_values().collect())?)
}

/// Load future covariate values for forecasting.
pub fn load_dynamic(path: &Path, columns: &PanelColumns) -> Result<DynamicFrame, LoaderError> {
    let df = read_frame(path)?;
    frame_to_dynamic(&df, columns)
}

/// Convert a DataFrame of future covariates into a [`DynamicFrame`].
///
/// Every numeric column other than id, time and target is a covariate.
pub fn frame_to_dynamic(df: &DataFrame, columns: &PanelColumns) -> Result<DynamicFrame, LoaderError> {
    let ids = string_values(df.column(&columns.id_col)?)?;
    let times = timestamp_values(df.column(&columns.time_col)?)?;

    let names: Vec<String> = df
        .get_columns()
        .iter()
        .filter(|c| is_numeric(c.dtype()))
        .map(|c| c.name().to_string())
        .filter(|name| {
            name != &columns.id_col && name != &columns.time_col && name != &columns.target_col
        })
        .collect();
    let mut values = Vec::with_capacity(names.len());
    for name in &names {
        values.push(float_values(df.column(name)?)?);
    }

    let mut frame = DynamicFrame::new(names);
    for (row, (id, time)) in ids.into_iter().zip(times).enumerate() {
        frame.insert(id, time, values.iter().map(|v| v[row]).collect())?;
    }
    Ok(frame)
}

fn is_numeric(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Float32
            | DataType::Float64
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Boolean
    )
}

fn string_values(column: &Column) -> Result<Vec<String>, LoaderError> {
    let cast = column.cast(&DataType::String)?;
    cast.str()?
        .into_iter()
        .map(|v| {
            v.map(str::to_string).ok_or_else(|| {
                LoaderError::InvalidData(format!("null value in id column '{}'", column.name()))
            })
        })
        .collect()
}

fn float_values(column: &Column) -> Result<Vec<f64>, LoaderError> {
    let cast = column.cast(&DataType::Float64)?;
    Ok(cast.f64()?.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
}

fn timestamp_values(column: &Column) -> Result<Vec<Timestamp>, LoaderError> {
    let null_err = || LoaderError::InvalidData(format!("null value in time column '{}'", column.name()));

    match column.dtype() {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => {
            let cast = column.cast(&DataType::Int64)?;
            cast.i64()?
                .into_iter()
                .map(|v| v.map(Timestamp::Int).ok_or_else(null_err))
                .collect()
        }
        DataType::Date => {
            let cast = column.cast(&DataType::Int32)?;
            cast.i32()?
                .into_iter()
                .map(|v| v.map(|days| Timestamp::date(date_from_days(days))).ok_or_else(null_err))
                .collect()
        }
        DataType::Datetime(unit, _) => {
            let unit = *unit;
            let cast = column.cast(&DataType::Int64)?;
            cast.i64()?
                .into_iter()
                .map(|v| {
                    let raw = v.ok_or_else(null_err)?;
                    datetime_from_epoch(raw, unit)
                        .map(Timestamp::DateTime)
                        .ok_or_else(|| LoaderError::InvalidData(format!("timestamp {} out of range", raw)))
                })
                .collect()
        }
        DataType::String => column
            .str()?
            .into_iter()
            .map(|v| {
                let raw = v.ok_or_else(null_err)?;
                parse_timestamp(raw)
                    .ok_or_else(|| LoaderError::InvalidData(format!("cannot parse timestamp '{}'", raw)))
            })
            .collect(),
        other => Err(LoaderError::InvalidData(format!(
            "time column '{}' has unexpected type {}",
            column.name(),
            other
        ))),
    }
}

/// Convert days since Unix epoch to NaiveDate.
fn date_from_days(days: i32) -> NaiveDate {
    NaiveDate::from_num_days_from_ce_opt(days + 719163).unwrap_or_default()
}

fn datetime_from_epoch(raw: i64, unit: TimeUnit) -> Option<NaiveDateTime> {
    let (secs, nanos) = match unit {
        TimeUnit::Nanoseconds => (raw.div_euclid(1_000_000_000), raw.rem_euclid(1_000_000_000)),
        TimeUnit::Microseconds => (raw.div_euclid(1_000_000), raw.rem_euclid(1_000_000) * 1_000),
        TimeUnit::Milliseconds => (raw.div_euclid(1_000), raw.rem_euclid(1_000) * 1_000_000),
    };
    DateTime::from_timestamp(secs, nanos as u32).map(|dt| dt.naive_utc())
}

/// Parse integer periods, dates or datetimes.
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if let Ok(t) = raw.parse::<i64>() {
        return Some(Timestamp::Int(t));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(Timestamp::date(date));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(Timestamp::DateTime)
}

fn time_column(name: &str, times: &[Timestamp]) -> Column {
    if times.iter().all(Timestamp::is_int) {
        let values: Vec<i64> = times
            .iter()
            .map(|t| match t {
                Timestamp::Int(v) => *v,
                Timestamp::DateTime(_) => 0,
            })
            .collect();
        Column::new(name.into(), values)
    } else {
        let values: Vec<String> = times.iter().map(Timestamp::to_string).collect();
        Column::new(name.into(), values)
    }
}

/// Convert a forecast table into a DataFrame: id, time and one column per model.
pub fn forecast_to_frame(table: &ForecastTable, columns: &PanelColumns) -> Result<DataFrame, LoaderError> {
    let mut cols = vec![
        Column::new(columns.id_col.as_str().into(), table.series_ids.clone()),
        time_column(&columns.time_col, &table.times),
    ];
    for (name, values) in &table.columns {
        cols.push(Column::new(name.as_str().into(), values.clone()));
    }
    Ok(DataFrame::new(cols)?)
}

/// Convert cross-validation predictions into a DataFrame tagged by window.
pub fn cv_predictions_to_frame(preds: &[CvPrediction], columns: &PanelColumns) -> Result<DataFrame, LoaderError> {
    let windows: Vec<u64> = preds.iter().map(|p| p.window as u64).collect();
    let ids: Vec<String> = preds.iter().map(|p| p.series_id.clone()).collect();
    let times: Vec<Timestamp> = preds.iter().map(|p| p.time).collect();
    let cutoffs: Vec<Timestamp> = preds.iter().map(|p| p.cutoff).collect();
    let actual: Vec<f64> = preds.iter().map(|p| p.actual).collect();
    let predicted: Vec<f64> = preds.iter().map(|p| p.predicted).collect();

    let df = DataFrame::new(vec![
        Column::new(columns.id_col.as_str().into(), ids),
        time_column(&columns.time_col, &times),
        time_column("cutoff", &cutoffs),
        Column::new("window".into(), windows),
        Column::new(columns.target_col.as_str().into(), actual),
        Column::new("prediction".into(), predicted),
    ])?;
    Ok(df)
}

/// Write a DataFrame as CSV with a header row.
pub fn write_csv(df: &mut DataFrame, path: &Path) -> Result<(), LoaderError> {
    let mut file = std::fs::File::create(path)?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_date_from_days() {
        let date = date_from_days(18262);
        assert_eq!(date, NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("12"), Some(Timestamp::Int(12)));
        assert_eq!(
            parse_timestamp("2024-02-29"),
            Some(Timestamp::date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()))
        );
        assert!(parse_timestamp("2024-02-29 13:00:00").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_frame_to_panel_groups_series() {
        let df = DataFrame::new(vec![
            Column::new("unique_id".into(), ["b", "a", "a", "b"]),
            Column::new("ds".into(), [1i64, 2, 1, 2]),
            Column::new("y".into(), [10.0, 2.0, 1.0, 20.0]),
            Column::new("price".into(), [5.0, 6.0, 7.0, 8.0]),
        ])
        .unwrap();

        let panel = frame_to_panel(&df, &PanelColumns::default()).unwrap();
        assert_eq!(panel.n_series(), 2);

        let a = panel.get("a").unwrap();
        assert_eq!(a.times, vec![Timestamp::Int(1), Timestamp::Int(2)]);
        assert_eq!(a.target, vec![1.0, 2.0]);
        assert_eq!(a.covariates["price"], vec![7.0, 6.0]);
    }

    #[test]
    fn test_frame_to_panel_rejects_unknown_static_feature() {
        let df = DataFrame::new(vec![
            Column::new("unique_id".into(), ["a"]),
            Column::new("ds".into(), [1i64]),
            Column::new("y".into(), [1.0]),
        ])
        .unwrap();
        let columns = PanelColumns {
            static_features: vec!["store_size".into()],
            ..PanelColumns::default()
        };
        assert!(matches!(
            frame_to_panel(&df, &columns),
            Err(LoaderError::InvalidData(_))
        ));
    }

    #[test]
    fn test_load_panel_from_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "unique_id,ds,y").unwrap();
        writeln!(file, "a,2024-01-01,1.5").unwrap();
        writeln!(file, "a,2024-01-02,2.5").unwrap();
        drop(file);

        let panel = load_panel(&path, &PanelColumns::default()).unwrap();
        let a = panel.get("a").unwrap();
        assert_eq!(a.target, vec![1.5, 2.5]);
        assert_eq!(a.times[0], Timestamp::date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()));
    }

    #[test]
    fn test_frame_to_dynamic() {
        let df = DataFrame::new(vec![
            Column::new("unique_id".into(), ["a", "a"]),
            Column::new("ds".into(), [10i64, 11]),
            Column::new("price".into(), [1.5, 2.5]),
        ])
        .unwrap();
        let frame = frame_to_dynamic(&df, &PanelColumns::default()).unwrap();
        assert_eq!(frame.columns().to_vec(), vec!["price".to_string()]);
        assert_eq!(frame.get("a", Timestamp::Int(11), "price"), Some(2.5));
    }

    #[test]
    fn test_missing_file() {
        let err = read_frame(Path::new("does/not/exist.csv")).unwrap_err();
        assert!(matches!(err, LoaderError::FileNotFound(_)));
    }

    #[test]
    fn test_forecast_to_frame() {
        let table = ForecastTable {
            series_ids: vec!["a".into(), "a".into()],
            times: vec![Timestamp::Int(5), Timestamp::Int(6)],
            columns: vec![("window_0".into(), vec![1.0, 2.0])],
        };
        let df = forecast_to_frame(&table, &PanelColumns::default()).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 3);
        assert!(df.column("window_0").is_ok());
    }
}
