//! Capability traits for incrementally trainable models.

use crate::data::FeatureTable;
use crate::error::BoxError;

/// Anything that maps a feature table to one prediction per row.
pub trait Predictor: Send + Sync {
    /// Column label used in forecast tables.
    fn name(&self) -> &str;

    /// Predict every row of `features`, in row order.
    fn predict(&self, features: &FeatureTable) -> Result<Vec<f64>, BoxError>;
}

/// A boosted ensemble that gains rounds in place and is never rewound.
pub trait IncrementalModel: Predictor {
    /// Train `rounds` additional boosting iterations.
    fn update(&mut self, rounds: usize) -> Result<(), BoxError>;

    /// Boosting rounds trained so far. Monotonically non-decreasing.
    fn num_rounds(&self) -> usize;

    /// Restrict later predictions to the first `rounds` iterations.
    fn set_best_iteration(&mut self, rounds: usize);

    fn best_iteration(&self) -> Option<usize>;
}

/// Builds models bound to a training table. Carries the hyperparameters.
pub trait ModelFactory: Send + Sync {
    type Model: IncrementalModel + 'static;

    /// A model with zero rounds bound to `train`, using `threads` internally.
    fn bind(&self, train: &FeatureTable, threads: usize) -> Result<Self::Model, BoxError>;

    /// A model trained for exactly `n_estimators` rounds on `train`.
    fn fit_full(&self, train: &FeatureTable, n_estimators: usize, threads: usize) -> Result<Self::Model, BoxError> {
        let mut model = self.bind(train, threads)?;
        model.update(n_estimators)?;
        Ok(model)
    }
}
