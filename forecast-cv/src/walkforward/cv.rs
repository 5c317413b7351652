//! Walk-forward cross-validation of incrementally trained boosters.
//!
//! One model per backtest window is trained in lockstep: every step adds the
//! same number of boosting rounds to all of them, forecasts each window's
//! validation horizon and aggregates the per-window metrics with fixed
//! weights. Early stopping on that aggregate picks the number of rounds used
//! by the final model.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::early_stopping::{EarlyStopping, History};
use super::parallelism::Parallelism;
use super::splits::{build_windows, Window};
use crate::data::{CvPrediction, DynamicFrame, ForecastTable, Frequency, Panel, PanelColumns, Scored, TargetRow};
use crate::error::{CvError, CvResult, Stage};
use crate::features::{FeatureTransform, PredictFn, TransformOptions};
use crate::metrics::Metric;
use crate::model::{IncrementalModel, ModelFactory, Predictor};

/// Cross-validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CvConfig {
    /// Number of backtest windows.
    pub n_windows: usize,
    /// Periods forecast in each window.
    pub window_size: usize,
    /// Frequency of calendar panels. May be left unset when the feature
    /// transform carries one.
    pub freq: Option<Frequency>,
    pub columns: PanelColumns,
    /// Drop feature rows with missing values.
    pub dropna: bool,
    /// Observations per series kept for forecasting.
    pub keep_last_n: Option<usize>,
    /// Per-window metric weights; uniform when absent.
    pub weights: Option<Vec<f64>>,
    pub metric: Metric,
    /// Upper bound on boosting rounds.
    pub num_iterations: usize,
    /// Rounds trained between evaluations.
    pub eval_every: usize,
    pub early_stopping_evals: usize,
    /// Minimum relative improvement over `early_stopping_evals` evaluations.
    pub early_stopping_pct: f64,
    /// Keep the validation forecasts of the best iteration.
    pub compute_cv_preds: bool,
    /// Train one model on the full panel after cross-validation.
    pub fit_on_all: bool,
    /// Windows processed concurrently.
    pub num_threads: usize,
    /// Hardware threads to share; detected when absent.
    pub host_threads: Option<usize>,
    /// Log every evaluation at info level.
    pub verbose_eval: bool,
}

impl Default for CvConfig {
    fn default() -> Self {
        Self {
            n_windows: 1,
            window_size: 1,
            freq: None,
            columns: PanelColumns::default(),
            dropna: true,
            keep_last_n: None,
            weights: None,
            metric: Metric::default(),
            num_iterations: 100,
            eval_every: 10,
            early_stopping_evals: 2,
            early_stopping_pct: 0.01,
            compute_cv_preds: false,
            fit_on_all: false,
            num_threads: 1,
            host_threads: None,
            verbose_eval: true,
        }
    }
}

impl CvConfig {
    pub fn new(n_windows: usize, window_size: usize) -> Self {
        Self {
            n_windows,
            window_size,
            ..Self::default()
        }
    }

    pub fn with_freq(mut self, freq: Frequency) -> Self {
        self.freq = Some(freq);
        self
    }

    pub fn with_weights(mut self, weights: Vec<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    /// Select a built-in metric by name.
    pub fn with_metric_name(mut self, name: &str) -> CvResult<Self> {
        self.metric = Metric::named(name)?;
        Ok(self)
    }

    pub fn with_iterations(mut self, num_iterations: usize, eval_every: usize) -> Self {
        self.num_iterations = num_iterations;
        self.eval_every = eval_every;
        self
    }

    pub fn with_early_stopping(mut self, evals: usize, pct: f64) -> Self {
        self.early_stopping_evals = evals;
        self.early_stopping_pct = pct;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_fit_on_all(mut self, fit_on_all: bool) -> Self {
        self.fit_on_all = fit_on_all;
        self
    }

    pub fn with_cv_preds(mut self, compute_cv_preds: bool) -> Self {
        self.compute_cv_preds = compute_cv_preds;
        self
    }

    pub fn transform_options(&self) -> TransformOptions {
        TransformOptions {
            freq: self.freq,
            static_features: self.columns.static_features.clone(),
            dropna: self.dropna,
            keep_last_n: self.keep_last_n,
        }
    }

    /// The one frequency shared by the window builder and the transform.
    pub fn resolve_freq(&self, transform_freq: Option<Frequency>) -> CvResult<Option<Frequency>> {
        match (self.freq, transform_freq) {
            (Some(own), Some(other)) if own != other => Err(CvError::config(format!(
                "frequency {} conflicts with the feature transform's {}",
                own, other
            ))),
            (own, other) => Ok(own.or(other)),
        }
    }

    /// Window weights, uniform unless configured.
    pub fn resolve_weights(&self) -> CvResult<Vec<f64>> {
        match &self.weights {
            None => Ok(vec![1.0 / self.n_windows as f64; self.n_windows]),
            Some(weights) => {
                if weights.len() != self.n_windows {
                    return Err(CvError::config(format!(
                        "got {} weights for {} windows",
                        weights.len(),
                        self.n_windows
                    )));
                }
                if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
                    return Err(CvError::config(format!("weights must be finite and non-negative, got {}", w)));
                }
                Ok(weights.clone())
            }
        }
    }

    pub fn validate(&self) -> CvResult<()> {
        if self.n_windows == 0 {
            return Err(CvError::config("n_windows must be at least 1"));
        }
        if self.window_size == 0 {
            return Err(CvError::config("window_size must be at least 1"));
        }
        if self.num_iterations == 0 {
            return Err(CvError::config("num_iterations must be at least 1"));
        }
        if self.eval_every == 0 {
            return Err(CvError::config("eval_every must be at least 1"));
        }
        if !self.early_stopping_pct.is_finite() {
            return Err(CvError::config("early_stopping_pct must be finite"));
        }
        if self.num_threads == 0 {
            return Err(CvError::config("num_threads must be at least 1"));
        }
        self.resolve_weights()?;
        Ok(())
    }
}

/// Everything one window needs during the fit loop.
struct CvItem<T, M> {
    transform: T,
    model: M,
    validation: Vec<TargetRow>,
}

/// Forecast one window's validation horizon and join it with the actuals.
fn score_item<T, M>(
    item: &CvItem<T, M>,
    window: usize,
    horizon: usize,
    dynamic: &[DynamicFrame],
    predict_fn: Option<&PredictFn>,
    stage: Stage,
) -> CvResult<Vec<Scored>>
where
    T: FeatureTransform,
    M: IncrementalModel,
{
    let models: [&dyn Predictor; 1] = [&item.model];
    let forecast = item
        .transform
        .predict(&models, horizon, dynamic, predict_fn)
        .map_err(|e| CvError::collaborator(stage, Some(window), e))?;
    let (_, predicted) = forecast
        .columns
        .first()
        .ok_or_else(|| CvError::collaborator(stage, Some(window), "forecast has no prediction column"))?;
    let index = forecast.index();

    item.validation
        .iter()
        .map(|row| {
            let idx = index.get(&(row.series_id.as_str(), row.time)).ok_or_else(|| {
                CvError::collaborator(
                    stage,
                    Some(window),
                    format!("no forecast for series '{}' at {}", row.series_id, row.time),
                )
            })?;
            Ok(Scored {
                series_id: row.series_id.clone(),
                time: row.time,
                actual: row.value,
                predicted: predicted[*idx],
            })
        })
        .collect()
}

/// Walk-forward cross-validator over a feature transform `T` and a model
/// factory `F`.
pub struct CrossValidator<T, F: ModelFactory> {
    config: CvConfig,
    template: T,
    factory: F,
    /// Frequency resolved at setup.
    freq: Option<Frequency>,
    windows: Vec<Window>,
    items: Vec<CvItem<T, F::Model>>,
    weights: Vec<f64>,
    parallelism: Option<Parallelism>,
    pool: Option<ThreadPool>,
    last_metrics: Vec<f64>,
    history: History,
    best_iteration: Option<usize>,
    cv_preds: Option<Vec<CvPrediction>>,
    /// Transform fitted on the full panel, used for out-of-sample forecasts.
    final_transform: Option<T>,
    final_model: Option<F::Model>,
    fitted: bool,
}

impl<T, F> CrossValidator<T, F>
where
    T: FeatureTransform,
    F: ModelFactory,
{
    pub fn new(template: T, factory: F, config: CvConfig) -> Self {
        Self {
            config,
            template,
            factory,
            freq: None,
            windows: Vec::new(),
            items: Vec::new(),
            weights: Vec::new(),
            parallelism: None,
            pool: None,
            last_metrics: Vec::new(),
            history: History::new(),
            best_iteration: None,
            cv_preds: None,
            final_transform: None,
            final_model: None,
            fitted: false,
        }
    }

    /// Build the windows and bind one fresh model to each.
    ///
    /// All configuration errors are raised before any model is built.
    pub fn setup(&mut self, panel: &Panel) -> CvResult<()> {
        self.config.validate()?;
        let weights = self.config.resolve_weights()?;
        let parallelism = Parallelism::resolve(self.config.num_threads, self.config.host_threads)?;
        let freq = self.config.resolve_freq(self.template.frequency())?;
        let windows = build_windows(panel, self.config.n_windows, self.config.window_size, freq)?;

        let pool = if parallelism.is_concurrent() {
            Some(
                ThreadPoolBuilder::new()
                    .num_threads(parallelism.cross_window)
                    .thread_name(|i| format!("cv-window-{}", i))
                    .build()?,
            )
        } else {
            None
        };

        let options = TransformOptions {
            freq,
            ..self.config.transform_options()
        };
        let mut items = Vec::with_capacity(windows.len());
        for window in &windows {
            let mut transform = self.template.clone();
            let table = transform
                .fit_transform(&window.train, &options)
                .map_err(|e| CvError::collaborator(Stage::Setup, Some(window.index), e))?;
            let model = self
                .factory
                .bind(&table, parallelism.model_threads)
                .map_err(|e| CvError::collaborator(Stage::Setup, Some(window.index), e))?;
            debug!(
                "Window {}: cutoff {}, {} training rows, {} features",
                window.index,
                window.cutoff,
                table.n_rows(),
                table.n_features()
            );
            items.push(CvItem {
                transform,
                model,
                validation: window.validation_rows(),
            });
        }

        info!(
            "Set up {} windows of {} periods ({} windows in parallel, {} threads per model)",
            windows.len(),
            self.config.window_size,
            parallelism.cross_window,
            parallelism.model_threads
        );

        self.freq = freq;
        self.windows = windows;
        self.items = items;
        self.weights = weights;
        self.parallelism = Some(parallelism);
        self.pool = pool;
        self.last_metrics.clear();
        self.history = History::new();
        self.best_iteration = None;
        self.cv_preds = None;
        self.final_transform = None;
        self.final_model = None;
        self.fitted = false;
        Ok(())
    }

    /// Train every window's model for `num_new_rounds` more rounds and
    /// return the weighted validation metric.
    pub fn partial_fit(
        &mut self,
        num_new_rounds: usize,
        dynamic: &[DynamicFrame],
        predict_fn: Option<&PredictFn>,
    ) -> CvResult<f64> {
        if self.items.is_empty() {
            return Err(CvError::NotFitted("call setup before partial_fit".to_string()));
        }
        if num_new_rounds == 0 {
            return Err(CvError::config("num_new_rounds must be at least 1"));
        }

        let horizon = self.config.window_size;
        let metric = &self.config.metric;
        let items = &mut self.items;

        let metrics: Vec<f64> = match &self.pool {
            None => {
                let mut metrics = Vec::with_capacity(items.len());
                for (idx, item) in items.iter_mut().enumerate() {
                    item.model
                        .update(num_new_rounds)
                        .map_err(|e| CvError::collaborator(Stage::PartialFit, Some(idx), e))?;
                    let scored = score_item(item, idx, horizon, dynamic, predict_fn, Stage::PartialFit)?;
                    metrics.push(metric.evaluate(&scored));
                }
                metrics
            }
            Some(pool) => {
                let mut slots: Vec<Option<CvResult<f64>>> = (0..items.len()).map(|_| None).collect();
                pool.in_place_scope(|scope| -> CvResult<()> {
                    for ((idx, item), slot) in items.iter_mut().enumerate().zip(slots.iter_mut()) {
                        item.model
                            .update(num_new_rounds)
                            .map_err(|e| CvError::collaborator(Stage::PartialFit, Some(idx), e))?;
                        let item: &CvItem<T, F::Model> = item;
                        scope.spawn(move |_| {
                            let result = score_item(item, idx, horizon, dynamic, predict_fn, Stage::PartialFit)
                                .map(|scored| metric.evaluate(&scored));
                            *slot = Some(result);
                        });
                    }
                    Ok(())
                })?;

                slots
                    .into_iter()
                    .enumerate()
                    .map(|(idx, slot)| {
                        slot.unwrap_or_else(|| {
                            Err(CvError::collaborator(
                                Stage::PartialFit,
                                Some(idx),
                                "prediction task did not complete",
                            ))
                        })
                    })
                    .collect::<CvResult<Vec<f64>>>()?
            }
        };

        for (idx, value) in metrics.iter().enumerate() {
            debug!("Window {} {}: {:.6}", idx, metric.label(), value);
        }
        let aggregate: f64 = metrics.iter().zip(&self.weights).map(|(m, w)| m * w).sum();
        self.last_metrics = metrics;
        Ok(aggregate)
    }

    /// Set up, train until early stopping, then finalize.
    ///
    /// Returns the evaluation history truncated at the best iteration.
    pub fn fit(
        &mut self,
        panel: &Panel,
        dynamic: &[DynamicFrame],
        predict_fn: Option<&PredictFn>,
    ) -> CvResult<History> {
        self.setup(panel)?;

        let stopper = EarlyStopping::new(self.config.early_stopping_evals, self.config.early_stopping_pct);
        let num_iterations = self.config.num_iterations;
        let mut rounds = 0;

        while rounds < num_iterations {
            let batch = self.config.eval_every.min(num_iterations - rounds);
            let value = self.partial_fit(batch, dynamic, predict_fn)?;
            rounds += batch;
            self.history.push(rounds, value);

            if self.config.verbose_eval {
                info!("[{}] {}: {:.6}", rounds, self.config.metric.label(), value);
            } else {
                debug!("[{}] {}: {:.6}", rounds, self.config.metric.label(), value);
            }

            if stopper.should_stop(&self.history) {
                info!("Early stopping at round {}", rounds);
                break;
            }
        }

        let best = stopper.best_iteration(&self.history).unwrap_or(rounds);
        info!("Using best iteration: {}", best);
        self.history.truncate_to(best);
        for item in &mut self.items {
            item.model.set_best_iteration(best);
        }
        self.best_iteration = Some(best);

        if self.config.compute_cv_preds {
            self.cv_preds = Some(self.compute_cv_preds(dynamic, predict_fn)?);
        }

        if self.config.fit_on_all {
            self.refit(panel)?;
            self.items.clear();
        } else {
            let mut transform = self.template.clone();
            transform
                .fit_transform(panel, &self.transform_options())
                .map_err(|e| CvError::collaborator(Stage::Finalize, None, e))?;
            self.final_transform = Some(transform);
        }

        self.fitted = true;
        Ok(self.history.clone())
    }

    /// Forecast every window's validation horizon with its capped model.
    fn compute_cv_preds(&self, dynamic: &[DynamicFrame], predict_fn: Option<&PredictFn>) -> CvResult<Vec<CvPrediction>> {
        let horizon = self.config.window_size;
        let forecast_window = |(idx, item): (usize, &CvItem<T, F::Model>)| -> CvResult<Vec<CvPrediction>> {
            let cutoff = self.windows[idx].cutoff;
            let scored = score_item(item, idx, horizon, dynamic, predict_fn, Stage::Finalize)?;
            Ok(scored
                .into_iter()
                .map(|s| CvPrediction {
                    window: idx,
                    cutoff,
                    series_id: s.series_id,
                    time: s.time,
                    actual: s.actual,
                    predicted: s.predicted,
                })
                .collect())
        };

        let per_window: Vec<Vec<CvPrediction>> = match &self.pool {
            Some(pool) => pool.install(|| {
                self.items
                    .par_iter()
                    .enumerate()
                    .map(forecast_window)
                    .collect::<CvResult<Vec<_>>>()
            })?,
            None => self
                .items
                .iter()
                .enumerate()
                .map(forecast_window)
                .collect::<CvResult<Vec<_>>>()?,
        };
        let preds: Vec<CvPrediction> = per_window.into_iter().flatten().collect();
        info!("Computed {} cross-validation predictions", preds.len());
        Ok(preds)
    }

    /// Train one model on the full panel for the best number of rounds.
    ///
    /// Keeps the per-window models, so `cv_predict` remains available.
    pub fn refit(&mut self, panel: &Panel) -> CvResult<()> {
        let best = self
            .best_iteration
            .ok_or_else(|| CvError::NotFitted("call fit before refit".to_string()))?;
        let threads = self.parallelism.map_or(1, |p| p.host);

        let mut transform = self.template.clone();
        let table = transform
            .fit_transform(panel, &self.transform_options())
            .map_err(|e| CvError::collaborator(Stage::Finalize, None, e))?;
        let model = self
            .factory
            .fit_full(&table, best, threads)
            .map_err(|e| CvError::collaborator(Stage::Finalize, None, e))?;
        info!("Refit on {} rows with {} rounds", table.n_rows(), best);

        self.final_transform = Some(transform);
        self.final_model = Some(model);
        Ok(())
    }

    /// Forecast `horizon` periods past the panel with the refit model.
    pub fn predict(
        &self,
        horizon: usize,
        dynamic: &[DynamicFrame],
        predict_fn: Option<&PredictFn>,
    ) -> CvResult<ForecastTable> {
        let (Some(transform), Some(model)) = (&self.final_transform, &self.final_model) else {
            return Err(CvError::NotFitted(
                "no model trained on all data; fit with fit_on_all, call refit, or use cv_predict".to_string(),
            ));
        };
        let models: [&dyn Predictor; 1] = [model];
        transform
            .predict(&models, horizon, dynamic, predict_fn)
            .map_err(|e| CvError::collaborator(Stage::Predict, None, e))
    }

    /// Forecast `horizon` periods past the panel with every window's model,
    /// one column per window named `window_<index>`.
    pub fn cv_predict(
        &self,
        horizon: usize,
        dynamic: &[DynamicFrame],
        predict_fn: Option<&PredictFn>,
    ) -> CvResult<ForecastTable> {
        if !self.fitted {
            return Err(CvError::NotFitted("call fit before cv_predict".to_string()));
        }
        if self.items.is_empty() {
            return Err(CvError::NotFitted(
                "window models were discarded after fitting on all data".to_string(),
            ));
        }
        let transform = self
            .final_transform
            .as_ref()
            .ok_or_else(|| CvError::NotFitted("no transform fitted on the full panel".to_string()))?;

        let models: Vec<&dyn Predictor> = self.items.iter().map(|item| &item.model as &dyn Predictor).collect();
        let mut forecast = transform
            .predict(&models, horizon, dynamic, predict_fn)
            .map_err(|e| CvError::collaborator(Stage::Predict, None, e))?;
        for (idx, (name, _)) in forecast.columns.iter_mut().enumerate() {
            *name = format!("window_{}", idx);
        }
        Ok(forecast)
    }

    fn transform_options(&self) -> TransformOptions {
        TransformOptions {
            freq: self.freq,
            ..self.config.transform_options()
        }
    }

    pub fn config(&self) -> &CvConfig {
        &self.config
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn metric_label(&self) -> &str {
        self.config.metric.label()
    }

    /// Per-window metrics of the most recent `partial_fit`.
    pub fn last_metrics(&self) -> &[f64] {
        &self.last_metrics
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn best_iteration(&self) -> Option<usize> {
        self.best_iteration
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn cv_preds(&self) -> Option<&[CvPrediction]> {
        self.cv_preds.as_deref()
    }

    pub fn parallelism(&self) -> Option<Parallelism> {
        self.parallelism
    }

    /// Models of the backtest windows, in window order.
    pub fn window_models(&self) -> impl Iterator<Item = &F::Model> {
        self.items.iter().map(|item| &item.model)
    }

    pub fn final_model(&self) -> Option<&F::Model> {
        self.final_model.as_ref()
    }
}
