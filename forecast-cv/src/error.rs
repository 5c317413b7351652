//! Error taxonomy for the cross-validation engine.

use std::fmt;

use thiserror::Error;

/// Boxed error returned by external collaborators (feature transforms,
/// models, custom prediction functions).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stage of the engine in which a collaborator failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    PartialFit,
    Finalize,
    Predict,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::PartialFit => "partial_fit",
            Stage::Finalize => "finalize",
            Stage::Predict => "predict",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum CvError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not fitted: {0}")]
    NotFitted(String),

    #[error("{stage} failed{}: {source}", window_suffix(.window))]
    Collaborator {
        stage: Stage,
        window: Option<usize>,
        #[source]
        source: BoxError,
    },

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

fn window_suffix(window: &Option<usize>) -> String {
    match window {
        Some(idx) => format!(" in window {}", idx),
        None => String::new(),
    }
}

impl CvError {
    pub fn config(msg: impl Into<String>) -> Self {
        CvError::Configuration(msg.into())
    }

    /// Attribute a collaborator failure to a stage and, optionally, a window.
    pub fn collaborator(stage: Stage, window: Option<usize>, source: impl Into<BoxError>) -> Self {
        CvError::Collaborator {
            stage,
            window,
            source: source.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, CvError::Configuration(_))
    }

    pub fn is_not_fitted(&self) -> bool {
        matches!(self, CvError::NotFitted(_))
    }
}

pub type CvResult<T> = Result<T, CvError>;
