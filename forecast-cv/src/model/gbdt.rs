//! Squared-loss gradient boosted regression trees trained round by round.
//!
//! A [`GradientBoostedTrees`] model owns its training table and the running
//! predictions on it, so each call to `update` fits exactly one tree per
//! round on the current residuals. Split search over features runs on a
//! rayon pool when the model is given more than one thread; a factory hands
//! the same pool to every model it binds with that thread count.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};

use super::traits::{IncrementalModel, ModelFactory, Predictor};
use crate::data::FeatureTable;
use crate::error::BoxError;

/// Hyperparameters of the booster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GbdtParams {
    /// Shrinkage applied to every tree.
    pub learning_rate: f64,
    /// Maximum depth of each tree.
    pub max_depth: usize,
    /// Minimum number of rows in a leaf.
    pub min_samples_leaf: usize,
}

impl Default for GbdtParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            max_depth: 3,
            min_samples_leaf: 1,
        }
    }
}

impl GbdtParams {
    fn validate(&self) -> Result<(), BoxError> {
        if !(self.learning_rate > 0.0) {
            return Err(format!("learning_rate must be > 0, got {}", self.learning_rate).into());
        }
        if self.max_depth == 0 {
            return Err("max_depth must be > 0".into());
        }
        if self.min_samples_leaf == 0 {
            return Err("min_samples_leaf must be > 0".into());
        }
        Ok(())
    }
}

/// Factory binding boosters to training tables.
///
/// Split-search pools are built once per thread count and shared by every
/// model the factory (or any of its clones) binds.
#[derive(Debug, Clone, Default)]
pub struct GbdtFactory {
    params: GbdtParams,
    pools: Arc<Mutex<HashMap<usize, Arc<ThreadPool>>>>,
}

impl GbdtFactory {
    pub fn new(params: GbdtParams) -> Self {
        Self {
            params,
            pools: Arc::default(),
        }
    }

    pub fn params(&self) -> &GbdtParams {
        &self.params
    }

    /// Pool of `threads` workers, `None` for single-threaded models.
    fn pool(&self, threads: usize) -> Result<Option<Arc<ThreadPool>>, BoxError> {
        if threads <= 1 {
            return Ok(None);
        }
        let mut pools = self.pools.lock().map_err(|_| "thread pool cache is poisoned")?;
        if let Some(pool) = pools.get(&threads) {
            return Ok(Some(Arc::clone(pool)));
        }
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("gbdt-split-{}", i))
                .build()?,
        );
        pools.insert(threads, Arc::clone(&pool));
        Ok(Some(pool))
    }
}

impl ModelFactory for GbdtFactory {
    type Model = GradientBoostedTrees;

    fn bind(&self, train: &FeatureTable, threads: usize) -> Result<Self::Model, BoxError> {
        GradientBoostedTrees::bind(self.params.clone(), train, self.pool(threads)?)
    }
}

#[derive(Debug, Clone)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf(f64),
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf(value) => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

/// Best split found for one feature: `(gain, threshold)`.
type Candidate = Option<(f64, f64)>;

/// Training data bound to a booster.
struct TrainSet {
    values: Vec<f64>,
    n_features: usize,
    target: Vec<f64>,
}

impl TrainSet {
    fn value(&self, row: usize, feature: usize) -> f64 {
        self.values[row * self.n_features + feature]
    }

    fn row(&self, row: usize) -> &[f64] {
        &self.values[row * self.n_features..(row + 1) * self.n_features]
    }
}

/// Incrementally trained gradient boosted regression trees.
pub struct GradientBoostedTrees {
    params: GbdtParams,
    feature_names: Vec<String>,
    train: TrainSet,
    /// Running predictions on the training rows.
    fitted: Vec<f64>,
    base_score: f64,
    trees: Vec<Tree>,
    best_iteration: Option<usize>,
    threads: usize,
    pool: Option<Arc<ThreadPool>>,
}

impl GradientBoostedTrees {
    /// Bind an untrained booster to `train`, searching splits on `pool`
    /// when one is given.
    pub fn bind(params: GbdtParams, train: &FeatureTable, pool: Option<Arc<ThreadPool>>) -> Result<Self, BoxError> {
        params.validate()?;
        if train.is_empty() {
            return Err("cannot bind a booster to an empty feature table".into());
        }
        if train.target.len() != train.n_rows() {
            return Err(format!(
                "feature table has {} rows but {} target values",
                train.n_rows(),
                train.target.len()
            )
            .into());
        }

        let base_score = train.target.iter().sum::<f64>() / train.target.len() as f64;
        let threads = pool.as_ref().map_or(1, |p| p.current_num_threads());
        // A single feature leaves nothing to search in parallel.
        let pool = pool.filter(|_| train.n_features() > 1);

        Ok(Self {
            params,
            feature_names: train.feature_names.clone(),
            train: TrainSet {
                values: train.values.clone(),
                n_features: train.n_features(),
                target: train.target.clone(),
            },
            fitted: vec![base_score; train.n_rows()],
            base_score,
            trees: Vec::new(),
            best_iteration: None,
            threads,
            pool,
        })
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Trees used at prediction time.
    fn active_trees(&self) -> &[Tree] {
        let n = self.best_iteration.unwrap_or(self.trees.len()).min(self.trees.len());
        &self.trees[..n]
    }

    fn predict_row(&self, row: &[f64]) -> f64 {
        let shrink = self.params.learning_rate;
        self.base_score + self.active_trees().iter().map(|t| shrink * t.predict(row)).sum::<f64>()
    }

    fn boost_one_round(&mut self) {
        let residuals: Vec<f64> = self
            .train
            .target
            .iter()
            .zip(&self.fitted)
            .map(|(y, f)| y - f)
            .collect();
        let rows: Vec<usize> = (0..residuals.len()).collect();

        let mut nodes = Vec::new();
        self.grow(&residuals, &rows, 0, &mut nodes);
        let tree = Tree { nodes };

        let shrink = self.params.learning_rate;
        for (i, fitted) in self.fitted.iter_mut().enumerate() {
            *fitted += shrink * tree.predict(self.train.row(i));
        }
        self.trees.push(tree);
    }

    fn grow(&self, residuals: &[f64], rows: &[usize], depth: usize, nodes: &mut Vec<Node>) -> usize {
        let leaf = rows.iter().map(|&r| residuals[r]).sum::<f64>() / rows.len().max(1) as f64;
        let idx = nodes.len();

        if depth >= self.params.max_depth || rows.len() < 2 * self.params.min_samples_leaf {
            nodes.push(Node::Leaf(leaf));
            return idx;
        }

        let Some((feature, threshold)) = self.best_split(residuals, rows) else {
            nodes.push(Node::Leaf(leaf));
            return idx;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&r| self.train.value(r, feature) <= threshold);
        if left_rows.is_empty() || right_rows.is_empty() {
            nodes.push(Node::Leaf(leaf));
            return idx;
        }

        // Placeholder until both children exist.
        nodes.push(Node::Leaf(leaf));
        let left = self.grow(residuals, &left_rows, depth + 1, nodes);
        let right = self.grow(residuals, &right_rows, depth + 1, nodes);
        nodes[idx] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        idx
    }

    /// Highest-gain split across features; ties keep the lowest feature index.
    fn best_split(&self, residuals: &[f64], rows: &[usize]) -> Option<(usize, f64)> {
        let n_features = self.train.n_features;
        let candidates: Vec<Candidate> = match &self.pool {
            Some(pool) => pool.install(|| {
                (0..n_features)
                    .into_par_iter()
                    .map(|f| self.best_split_for_feature(residuals, rows, f))
                    .collect()
            }),
            None => (0..n_features)
                .map(|f| self.best_split_for_feature(residuals, rows, f))
                .collect(),
        };

        let mut best: Option<(usize, f64, f64)> = None;
        for (feature, candidate) in candidates.into_iter().enumerate() {
            if let Some((gain, threshold)) = candidate {
                if best.map_or(true, |(_, best_gain, _)| gain > best_gain) {
                    best = Some((feature, gain, threshold));
                }
            }
        }
        best.map(|(feature, _, threshold)| (feature, threshold))
    }

    /// Variance-reduction split on one feature using running sums.
    fn best_split_for_feature(&self, residuals: &[f64], rows: &[usize], feature: usize) -> Candidate {
        let mut pairs: Vec<(f64, f64)> = rows
            .iter()
            .map(|&r| (self.train.value(r, feature), residuals[r]))
            .filter(|(x, _)| !x.is_nan())
            .collect();
        if pairs.len() < 2 {
            return None;
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        let n = pairs.len();
        let total: f64 = pairs.iter().map(|p| p.1).sum();
        let parent = total * total / n as f64;
        let min_leaf = self.params.min_samples_leaf;

        let mut best: Candidate = None;
        let mut left_sum = 0.0;
        for i in 0..n - 1 {
            left_sum += pairs[i].1;
            let left_n = i + 1;
            let right_n = n - left_n;
            if pairs[i].0 == pairs[i + 1].0 || left_n < min_leaf || right_n < min_leaf {
                continue;
            }
            let right_sum = total - left_sum;
            let gain = left_sum * left_sum / left_n as f64 + right_sum * right_sum / right_n as f64 - parent;
            if gain > 1e-12 && best.map_or(true, |(g, _)| gain > g) {
                best = Some((gain, (pairs[i].0 + pairs[i + 1].0) / 2.0));
            }
        }
        best
    }
}

impl Predictor for GradientBoostedTrees {
    fn name(&self) -> &str {
        "GradientBoostedTrees"
    }

    fn predict(&self, features: &FeatureTable) -> Result<Vec<f64>, BoxError> {
        if features.feature_names != self.feature_names {
            return Err(format!(
                "feature mismatch: trained on {:?}, got {:?}",
                self.feature_names, features.feature_names
            )
            .into());
        }
        Ok((0..features.n_rows()).map(|i| self.predict_row(features.row(i))).collect())
    }
}

impl IncrementalModel for GradientBoostedTrees {
    fn update(&mut self, rounds: usize) -> Result<(), BoxError> {
        for _ in 0..rounds {
            self.boost_one_round();
        }
        Ok(())
    }

    fn num_rounds(&self) -> usize {
        self.trees.len()
    }

    fn set_best_iteration(&mut self, rounds: usize) {
        self.best_iteration = Some(rounds);
    }

    fn best_iteration(&self) -> Option<usize> {
        self.best_iteration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Timestamp;

    /// y = 2 * x on a single feature.
    fn linear_table(n: usize) -> FeatureTable {
        let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
        FeatureTable {
            series_ids: vec!["a".to_string(); n],
            times: (0..n as i64).map(Timestamp::Int).collect(),
            feature_names: vec!["x".to_string()],
            target: xs.iter().map(|x| 2.0 * x).collect(),
            values: xs,
        }
    }

    fn train_mse(model: &GradientBoostedTrees, table: &FeatureTable) -> f64 {
        let preds = model.predict(table).unwrap();
        preds
            .iter()
            .zip(&table.target)
            .map(|(p, y)| (p - y).powi(2))
            .sum::<f64>()
            / preds.len() as f64
    }

    #[test]
    fn test_bind_starts_with_zero_rounds() {
        let table = linear_table(20);
        let model = GbdtFactory::default().bind(&table, 1).unwrap();
        assert_eq!(model.num_rounds(), 0);
        // Untrained model predicts the target mean.
        let preds = model.predict(&table).unwrap();
        assert!(preds.iter().all(|p| (p - 19.0).abs() < 1e-9));
    }

    #[test]
    fn test_update_is_incremental_and_reduces_error() {
        let table = linear_table(50);
        let mut model = GbdtFactory::default().bind(&table, 1).unwrap();

        model.update(5).unwrap();
        assert_eq!(model.num_rounds(), 5);
        let early = train_mse(&model, &table);

        model.update(45).unwrap();
        assert_eq!(model.num_rounds(), 50);
        assert!(train_mse(&model, &table) < early);
    }

    #[test]
    fn test_best_iteration_caps_prediction() {
        let table = linear_table(30);
        let factory = GbdtFactory::default();

        let mut long = factory.bind(&table, 1).unwrap();
        long.update(40).unwrap();
        long.set_best_iteration(10);

        let short = factory.fit_full(&table, 10, 1).unwrap();
        assert_eq!(short.num_rounds(), 10);
        assert_eq!(long.predict(&table).unwrap(), short.predict(&table).unwrap());
    }

    #[test]
    fn test_threaded_split_search_matches_sequential() {
        let n = 40;
        let mut table = linear_table(n);
        table.feature_names = vec!["x".into(), "noise".into()];
        table.values = (0..n).flat_map(|i| [i as f64, ((i * 7) % 11) as f64]).collect();

        let factory = GbdtFactory::default();
        let single = factory.fit_full(&table, 15, 1).unwrap();
        let multi = factory.fit_full(&table, 15, 3).unwrap();
        assert_eq!(multi.threads(), 3);
        assert_eq!(single.predict(&table).unwrap(), multi.predict(&table).unwrap());
    }

    #[test]
    fn test_models_share_one_pool_per_thread_count() {
        let n = 20;
        let mut table = linear_table(n);
        table.feature_names = vec!["x".into(), "noise".into()];
        table.values = (0..n).flat_map(|i| [i as f64, (i % 3) as f64]).collect();

        let factory = GbdtFactory::default();
        let first = factory.bind(&table, 2).unwrap();
        let second = factory.clone().bind(&table, 2).unwrap();
        let (Some(a), Some(b)) = (&first.pool, &second.pool) else {
            panic!("expected split-search pools");
        };
        assert!(Arc::ptr_eq(a, b));

        let wider = factory.bind(&table, 4).unwrap();
        assert!(!Arc::ptr_eq(a, wider.pool.as_ref().unwrap()));
        assert!(factory.bind(&table, 1).unwrap().pool.is_none());
        assert_eq!(factory.pools.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_rejects_feature_mismatch_and_bad_params() {
        let table = linear_table(10);
        let model = GbdtFactory::default().bind(&table, 1).unwrap();
        let mut other = table.clone();
        other.feature_names = vec!["z".into()];
        assert!(model.predict(&other).is_err());

        let params = GbdtParams {
            learning_rate: 0.0,
            ..GbdtParams::default()
        };
        assert!(GbdtFactory::new(params).bind(&table, 1).is_err());
        assert!(GbdtFactory::default().bind(&FeatureTable::default(), 1).is_err());
    }
}
