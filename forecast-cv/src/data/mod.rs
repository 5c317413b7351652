//! Panel data model and I/O.
//!
//! - Long-format panels of many series with integer or calendar timestamps
//! - Frequency arithmetic for walk-forward windows
//! - CSV / Parquet loading and forecast export via polars

pub mod frequency;
pub mod loader;
pub mod types;

pub use frequency::Frequency;
pub use loader::{
    cv_predictions_to_frame, forecast_to_frame, frame_to_dynamic, frame_to_panel, load_dynamic, load_panel,
    read_frame, write_csv, LoaderError,
};
pub use types::{
    CvPrediction, DynamicFrame, FeatureTable, ForecastTable, Panel, PanelColumns, Scored, Series,
    TargetRow, Timestamp,
};
