pub mod data;
pub mod error;
pub mod features;
pub mod metrics;
pub mod model;
pub mod walkforward;

// Re-export commonly used types
pub use data::{DynamicFrame, FeatureTable, ForecastTable, Frequency, Panel, PanelColumns, Series, Timestamp};
pub use error::{BoxError, CvError, CvResult, Stage};
pub use features::{FeatureTransform, LagFeatures, LagFeaturesConfig, PredictFn, TransformOptions};
pub use metrics::{Metric, MetricName};
pub use model::{GbdtFactory, GbdtParams, GradientBoostedTrees, IncrementalModel, ModelFactory, Predictor};
pub use walkforward::{CrossValidator, CvConfig, EarlyStopping, History, Parallelism, Window};
