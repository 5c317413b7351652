//! Models trained by the cross-validation engine.
//!
//! - [`traits`]: capability traits the engine is generic over
//! - [`gbdt`]: reference gradient boosted trees trained round by round

pub mod gbdt;
pub mod traits;

pub use gbdt::{GbdtFactory, GbdtParams, GradientBoostedTrees};
pub use traits::{IncrementalModel, ModelFactory, Predictor};
