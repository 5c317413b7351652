use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_relative_eq;

use forecast_cv::metrics::Metric;
use forecast_cv::{
    BoxError, CrossValidator, CvConfig, CvError, FeatureTable, GbdtFactory, GbdtParams, IncrementalModel,
    LagFeatures, LagFeaturesConfig, ModelFactory, Panel, Predictor, Series, Stage, Timestamp,
};

/// Forecasts the previous observation, whatever the number of rounds.
struct LastValue {
    rounds: usize,
    best: Option<usize>,
    fail_on_update: bool,
}

impl Predictor for LastValue {
    fn name(&self) -> &str {
        "last_value"
    }

    fn predict(&self, features: &FeatureTable) -> Result<Vec<f64>, BoxError> {
        let col = features.feature_index("lag1").ok_or("lag1 feature missing")?;
        Ok((0..features.n_rows()).map(|i| features.row(i)[col]).collect())
    }
}

impl IncrementalModel for LastValue {
    fn update(&mut self, rounds: usize) -> Result<(), BoxError> {
        if self.fail_on_update {
            return Err("update rejected".into());
        }
        self.rounds += rounds;
        Ok(())
    }

    fn num_rounds(&self) -> usize {
        self.rounds
    }

    fn set_best_iteration(&mut self, rounds: usize) {
        self.best = Some(rounds);
    }

    fn best_iteration(&self) -> Option<usize> {
        self.best
    }
}

/// Builds [`LastValue`] models; fails updates for windows whose training
/// table is shorter than `fail_below_rows`.
#[derive(Default)]
struct LastValueFactory {
    fail_below_rows: usize,
}

impl ModelFactory for LastValueFactory {
    type Model = LastValue;

    fn bind(&self, train: &FeatureTable, _threads: usize) -> Result<LastValue, BoxError> {
        Ok(LastValue {
            rounds: 0,
            best: None,
            fail_on_update: train.n_rows() < self.fail_below_rows,
        })
    }
}

fn lag1() -> LagFeatures {
    LagFeatures::new(LagFeaturesConfig::default().with_lags(vec![1]))
}

/// Single series over t = 0..9 ending in 1.0, 1.1, 1.4.
fn short_panel() -> Panel {
    let times = (0..10).map(Timestamp::Int).collect();
    let target = vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.1, 1.4];
    Panel::new(vec![Series::new("a", times, target)]).unwrap()
}

/// Several seasonal series with a trend.
fn seasonal_panel(n_series: usize, len: usize) -> Panel {
    let series = (0..n_series)
        .map(|s| {
            let times = (0..len as i64).map(Timestamp::Int).collect();
            let target = (0..len)
                .map(|t| 20.0 + 3.0 * s as f64 + 2.0 * ((t + s) % 7) as f64 + 0.05 * t as f64)
                .collect();
            Series::new(format!("store_{}", s), times, target)
        })
        .collect();
    Panel::new(series).unwrap()
}

/// Metric returning `values` in turn, one per evaluation, then repeating
/// the last one.
fn scripted_metric(values: Vec<f64>) -> Metric {
    let calls = Arc::new(AtomicUsize::new(0));
    Metric::custom(move |_| {
        let i = calls.fetch_add(1, Ordering::SeqCst);
        values[i.min(values.len() - 1)]
    })
}

/// One window, so every evaluation calls the metric exactly once.
fn scripted_validator(values: Vec<f64>) -> CrossValidator<LagFeatures, LastValueFactory> {
    let config = CvConfig::new(1, 1)
        .with_metric(scripted_metric(values))
        .with_iterations(100, 10)
        .with_early_stopping(2, 0.03);
    CrossValidator::new(lag1(), LastValueFactory::default(), config)
}

fn gbdt_validator(config: CvConfig) -> CrossValidator<LagFeatures, GbdtFactory> {
    let features = LagFeatures::new(LagFeaturesConfig::default().with_lags(vec![1, 2, 7]));
    let params = GbdtParams {
        learning_rate: 0.2,
        ..GbdtParams::default()
    };
    CrossValidator::new(features, GbdtFactory::new(params), config)
}

#[test]
fn test_weighted_aggregation_of_window_metrics() {
    for num_threads in [1, 2] {
        let config = CvConfig::new(2, 1)
            .with_weights(vec![0.25, 0.75])
            .with_metric_name("mae")
            .unwrap()
            .with_num_threads(num_threads);
        let mut cv = CrossValidator::new(lag1(), LastValueFactory::default(), config);
        cv.setup(&short_panel()).unwrap();

        let value = cv.partial_fit(1, &[], None).unwrap();
        assert_relative_eq!(cv.last_metrics()[0], 0.1, epsilon = 1e-12);
        assert_relative_eq!(cv.last_metrics()[1], 0.3, epsilon = 1e-12);
        assert_relative_eq!(value, 0.25, epsilon = 1e-12);
    }
}

#[test]
fn test_custom_metric_is_used_and_labelled() {
    let config = CvConfig::new(2, 1).with_metric(Metric::custom(|rows| rows.len() as f64));
    let mut cv = CrossValidator::new(lag1(), LastValueFactory::default(), config);
    cv.setup(&short_panel()).unwrap();

    assert_eq!(cv.metric_label(), "custom_metric");
    // One validation row per window, uniform weights.
    assert_relative_eq!(cv.partial_fit(1, &[], None).unwrap(), 1.0);
}

#[test]
fn test_results_do_not_depend_on_thread_count() {
    let panel = seasonal_panel(4, 60);
    let run = |num_threads: usize| {
        let mut config = CvConfig::new(3, 5)
            .with_iterations(40, 10)
            .with_num_threads(num_threads)
            .with_cv_preds(true);
        config.host_threads = Some(4);
        let mut cv = gbdt_validator(config);
        let history = cv.fit(&panel, &[], None).unwrap();
        let preds: Vec<f64> = cv.cv_preds().unwrap().iter().map(|p| p.predicted).collect();
        (history, cv.best_iteration(), preds)
    };

    let sequential = run(1);
    let concurrent = run(4);
    assert_eq!(sequential.0, concurrent.0);
    assert_eq!(sequential.1, concurrent.1);
    assert_eq!(sequential.2, concurrent.2);
}

#[test]
fn test_history_rounds_step_by_eval_every() {
    let config = CvConfig::new(2, 3).with_iterations(50, 10).with_early_stopping(100, 0.0);
    let mut cv = gbdt_validator(config);
    let history = cv.fit(&seasonal_panel(2, 50), &[], None).unwrap();

    let rounds: Vec<usize> = history.entries().iter().map(|e| e.rounds).collect();
    assert_eq!(rounds[0], 10);
    assert!(rounds.windows(2).all(|w| w[1] == w[0] + 10));
    assert_eq!(rounds.last().copied(), cv.best_iteration());
}

#[test]
fn test_refit_on_all_uses_best_iteration() {
    let config = CvConfig::new(2, 5).with_iterations(60, 10).with_fit_on_all(true);
    let mut cv = gbdt_validator(config);
    cv.fit(&seasonal_panel(3, 60), &[], None).unwrap();

    let best = cv.best_iteration().unwrap();
    assert_eq!(cv.final_model().unwrap().num_rounds(), best);

    let forecast = cv.predict(7, &[], None).unwrap();
    assert_eq!(forecast.n_rows(), 3 * 7);
    assert_eq!(forecast.times[0], Timestamp::Int(60));
    assert!(forecast.columns[0].1.iter().all(|v| v.is_finite()));
}

#[test]
fn test_predict_before_fit_is_not_fitted() {
    let cv = gbdt_validator(CvConfig::new(2, 3));
    assert!(cv.predict(3, &[], None).unwrap_err().is_not_fitted());
    assert!(cv.cv_predict(3, &[], None).unwrap_err().is_not_fitted());
}

#[test]
fn test_failed_update_names_stage_and_window() {
    // After dropping the first row, window 0 trains on 7 rows and window 1 on 8.
    let factory = LastValueFactory { fail_below_rows: 8 };
    let mut cv = CrossValidator::new(lag1(), factory, CvConfig::new(2, 1));
    cv.setup(&short_panel()).unwrap();

    match cv.partial_fit(1, &[], None).unwrap_err() {
        CvError::Collaborator { stage, window, .. } => {
            assert_eq!(stage, Stage::PartialFit);
            assert_eq!(window, Some(0));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_insufficient_history_fails_setup() {
    let mut cv = CrossValidator::new(lag1(), LastValueFactory::default(), CvConfig::new(5, 2));
    assert!(cv.setup(&short_panel()).unwrap_err().is_configuration());
}

#[test]
fn test_fit_stops_when_improvement_stalls() {
    let mut cv = scripted_validator(vec![1.0, 0.96, 0.95, 0.94, 0.5, 0.4]);
    let history = cv.fit(&short_panel(), &[], None).unwrap();

    // 1 - 0.94 / 0.96 falls below 3% at the fourth evaluation.
    let rounds: Vec<usize> = history.entries().iter().map(|e| e.rounds).collect();
    assert_eq!(rounds, vec![10, 20, 30, 40]);
    assert_eq!(cv.best_iteration(), Some(40));
    assert!(cv.window_models().all(|m| m.num_rounds() == 40));
}

#[test]
fn test_fit_keeps_earlier_best_after_overshoot() {
    let mut cv = scripted_validator(vec![1.0, 0.90, 0.95, 0.97, 0.5]);
    let history = cv.fit(&short_panel(), &[], None).unwrap();

    assert_eq!(cv.best_iteration(), Some(20));
    let rounds: Vec<usize> = history.entries().iter().map(|e| e.rounds).collect();
    assert_eq!(rounds, vec![10, 20]);
    assert_eq!(cv.history().last().map(|e| e.rounds), Some(20));
    for model in cv.window_models() {
        assert_eq!(model.num_rounds(), 40);
        assert_eq!(model.best_iteration(), Some(20));
        assert!(model.num_rounds() > 20);
    }
}
