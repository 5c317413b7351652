//! Walk-forward window generation.
//!
//! Splits every series of a panel into `n_windows` consecutive backtest
//! windows. Each window trains on all history up to its cutoff and validates
//! on the next `window_size` periods; the last window ends at the series'
//! final observation.

use serde::Serialize;
use tracing::debug;

use crate::data::{Frequency, Panel, Series, TargetRow, Timestamp};
use crate::error::CvError;

/// One backtest window.
#[derive(Debug, Clone)]
pub struct Window {
    /// Position of the window, earliest cutoff first.
    pub index: usize,
    /// Latest timestamp in the training slice.
    pub cutoff: Timestamp,
    /// Periods forecast for validation.
    pub horizon: usize,
    pub train: Panel,
    pub validation: Panel,
}

impl Window {
    /// Held-out target rows.
    pub fn validation_rows(&self) -> Vec<TargetRow> {
        self.validation.target_rows()
    }

    pub fn summary(&self) -> WindowSummary {
        WindowSummary {
            index: self.index,
            cutoff: self.cutoff,
            train_rows: self.train.n_rows(),
            validation_rows: self.validation.n_rows(),
            validation_start: self.validation.min_time(),
            validation_end: self.validation.max_time(),
        }
    }
}

/// Printable layout of a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSummary {
    pub index: usize,
    pub cutoff: Timestamp,
    pub train_rows: usize,
    pub validation_rows: usize,
    pub validation_start: Option<Timestamp>,
    pub validation_end: Option<Timestamp>,
}

/// Split `panel` into `n_windows` windows of `window_size` periods.
///
/// Integer timestamps step by one whatever `freq` says; calendar panels
/// require `freq`. Fails when a series is too short for the first window to
/// keep a training row, or when a validation slice does not hold exactly
/// `window_size` rows.
pub fn build_windows(
    panel: &Panel,
    n_windows: usize,
    window_size: usize,
    freq: Option<Frequency>,
) -> Result<Vec<Window>, CvError> {
    if n_windows == 0 {
        return Err(CvError::config("n_windows must be at least 1"));
    }
    if window_size == 0 {
        return Err(CvError::config("window_size must be at least 1"));
    }
    if panel.is_empty() {
        return Err(CvError::config("panel has no rows"));
    }

    let step = if panel.has_integer_times() {
        Frequency::UNIT
    } else {
        freq.ok_or_else(|| CvError::config("a frequency is required for calendar timestamps"))?
    };

    let holdout = n_windows * window_size;
    let mut train_parts: Vec<Vec<Series>> = vec![Vec::with_capacity(panel.n_series()); n_windows];
    let mut valid_parts: Vec<Vec<Series>> = vec![Vec::with_capacity(panel.n_series()); n_windows];

    for series in panel.series() {
        if series.len() <= holdout {
            return Err(CvError::config(format!(
                "series '{}' has {} rows; {} windows of size {} need more than {}",
                series.id,
                series.len(),
                n_windows,
                window_size,
                holdout
            )));
        }
        let Some(last) = series.last_time() else {
            continue;
        };

        for k in 0..n_windows {
            let back = ((n_windows - k) * window_size) as i64;
            let train_end = step.shift(last, -back)?;
            let valid_end = step.shift(train_end, window_size as i64)?;

            let train = series.between(None, Some(train_end));
            let validation = series.between(Some(train_end), Some(valid_end));
            if train.is_empty() {
                return Err(CvError::config(format!(
                    "series '{}' has no training rows up to {} (window {})",
                    series.id, train_end, k
                )));
            }
            if validation.len() != window_size {
                return Err(CvError::config(format!(
                    "series '{}' has {} validation rows in ({}, {}], expected {}",
                    series.id,
                    validation.len(),
                    train_end,
                    valid_end,
                    window_size
                )));
            }
            train_parts[k].push(train);
            valid_parts[k].push(validation);
        }
    }

    let windows: Vec<Window> = train_parts
        .into_iter()
        .zip(valid_parts)
        .enumerate()
        .map(|(index, (train, validation))| {
            let train = Panel::from_sorted(train);
            let cutoff = train.max_time().unwrap_or(Timestamp::Int(0));
            Window {
                index,
                cutoff,
                horizon: window_size,
                train,
                validation: Panel::from_sorted(validation),
            }
        })
        .collect();

    for window in &windows {
        debug!(
            "Window {}: cutoff {}, {} train rows, {} validation rows",
            window.index,
            window.cutoff,
            window.train.n_rows(),
            window.validation.n_rows()
        );
    }

    Ok(windows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn int_series(id: &str, start: i64, len: usize) -> Series {
        let times = (start..start + len as i64).map(Timestamp::Int).collect();
        Series::new(id, times, (0..len).map(|i| i as f64).collect())
    }

    #[test]
    fn test_windows_are_contiguous_and_end_at_last_row() {
        let panel = Panel::new(vec![int_series("a", 0, 10)]).unwrap();
        let windows = build_windows(&panel, 3, 2, None).unwrap();

        assert_eq!(windows.len(), 3);
        let cutoffs: Vec<Timestamp> = windows.iter().map(|w| w.cutoff).collect();
        assert_eq!(cutoffs, vec![Timestamp::Int(3), Timestamp::Int(5), Timestamp::Int(7)]);

        let first = &windows[0];
        assert_eq!(first.train.n_rows(), 4);
        assert_eq!(first.validation.series()[0].times, vec![Timestamp::Int(4), Timestamp::Int(5)]);
        assert_eq!(windows[2].validation.max_time(), Some(Timestamp::Int(9)));
    }

    #[test]
    fn test_series_with_different_ends() {
        let panel = Panel::new(vec![int_series("a", 0, 8), int_series("b", 5, 8)]).unwrap();
        let windows = build_windows(&panel, 2, 1, None).unwrap();

        let last = &windows[1];
        assert_eq!(last.validation.get("a").unwrap().times, vec![Timestamp::Int(7)]);
        assert_eq!(last.validation.get("b").unwrap().times, vec![Timestamp::Int(12)]);
        assert_eq!(last.cutoff, Timestamp::Int(11));
    }

    #[test]
    fn test_integer_panel_ignores_calendar_frequency() {
        let panel = Panel::new(vec![int_series("a", 0, 6)]).unwrap();
        let windows = build_windows(&panel, 1, 2, Some(Frequency::Weeks(1))).unwrap();
        assert_eq!(windows[0].cutoff, Timestamp::Int(3));
    }

    #[test]
    fn test_insufficient_history_is_rejected() {
        let panel = Panel::new(vec![int_series("a", 0, 10), int_series("short", 0, 4)]).unwrap();
        let err = build_windows(&panel, 2, 2, None).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("short"));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let panel = Panel::new(vec![int_series("a", 0, 10)]).unwrap();
        assert!(build_windows(&panel, 0, 1, None).unwrap_err().is_configuration());
        assert!(build_windows(&panel, 1, 0, None).unwrap_err().is_configuration());
    }

    #[test]
    fn test_calendar_windows() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let times: Vec<Timestamp> = (0..6)
            .map(|w| Timestamp::date(start + chrono::Duration::weeks(w)))
            .collect();
        let panel = Panel::new(vec![Series::new("a", times, vec![1.0; 6])]).unwrap();

        assert!(build_windows(&panel, 2, 1, None).unwrap_err().is_configuration());

        let windows = build_windows(&panel, 2, 1, Some(Frequency::Weeks(1))).unwrap();
        let expected = NaiveDate::from_ymd_opt(2024, 1, 22).unwrap();
        assert_eq!(windows[0].cutoff, Timestamp::date(expected));

        // Daily frequency over weekly data leaves the validation slices empty.
        assert!(build_windows(&panel, 2, 1, Some(Frequency::Days(1))).is_err());
    }

    #[test]
    fn test_month_end_windows() {
        // Month ends from 2024-01-31 to 2025-03-31.
        let times: Vec<Timestamp> = (0..15u32)
            .map(|m| {
                let first_of_next = NaiveDate::from_ymd_opt(2024 + ((m + 1) / 12) as i32, (m + 1) % 12 + 1, 1).unwrap();
                Timestamp::date(first_of_next.pred_opt().unwrap())
            })
            .collect();
        let panel = Panel::new(vec![Series::new("a", times, vec![1.0; 15])]).unwrap();

        let windows = build_windows(&panel, 2, 1, Some("M".parse().unwrap())).unwrap();
        let day = |y, m, d| Timestamp::date(NaiveDate::from_ymd_opt(y, m, d).unwrap());
        assert_eq!(windows[0].cutoff, day(2025, 1, 31));
        assert_eq!(windows[0].validation.series()[0].times, vec![day(2025, 2, 28)]);
        assert_eq!(windows[1].cutoff, day(2025, 2, 28));
        assert_eq!(windows[1].validation.series()[0].times, vec![day(2025, 3, 31)]);
    }

    #[test]
    fn test_summary() {
        let panel = Panel::new(vec![int_series("a", 0, 5)]).unwrap();
        let windows = build_windows(&panel, 1, 2, None).unwrap();
        let summary = windows[0].summary();
        assert_eq!(summary.train_rows, 3);
        assert_eq!(summary.validation_start, Some(Timestamp::Int(3)));
        assert_eq!(summary.validation_end, Some(Timestamp::Int(4)));
        assert_eq!(windows[0].validation_rows().len(), 2);
    }

    proptest! {
        #[test]
        fn test_window_layout_invariants(
            n_windows in 1usize..5,
            window_size in 1usize..5,
            extra in proptest::collection::vec(1usize..20, 1..4),
        ) {
            let series: Vec<Series> = extra
                .iter()
                .enumerate()
                .map(|(i, e)| int_series(&format!("s{}", i), i as i64 * 3, n_windows * window_size + e))
                .collect();
            let panel = Panel::new(series).unwrap();
            let windows = build_windows(&panel, n_windows, window_size, None).unwrap();

            prop_assert_eq!(windows.len(), n_windows);
            for s in panel.series() {
                let last = s.last_time().unwrap();
                let mut previous_end: Option<Timestamp> = None;
                for w in &windows {
                    let train = w.train.get(&s.id).unwrap();
                    let valid = w.validation.get(&s.id).unwrap();
                    prop_assert_eq!(valid.len(), window_size);
                    prop_assert!(!train.is_empty());
                    prop_assert!(train.last_time().unwrap() < valid.times[0]);
                    // Each validation slice starts right after the previous one.
                    if let Some(end) = previous_end {
                        prop_assert_eq!(train.last_time(), Some(end));
                    }
                    previous_end = valid.last_time();
                }
                prop_assert_eq!(previous_end, Some(last));
            }
        }
    }
}
