//! Walk-forward cross-validation.
//!
//! - Window splits: consecutive backtest windows ending at each series' last row
//! - Lockstep training: every window's model gains the same rounds per step
//! - Early stopping on the weighted validation metric
//! - Finalization: refit on all data or keep the window models

pub mod cv;
pub mod early_stopping;
pub mod parallelism;
pub mod splits;

pub use cv::{CrossValidator, CvConfig};
pub use early_stopping::{EarlyStopping, History, HistoryEntry};
pub use parallelism::Parallelism;
pub use splits::{build_windows, Window, WindowSummary};
