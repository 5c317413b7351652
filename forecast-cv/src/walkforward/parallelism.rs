//! Thread budget shared between backtest windows and the models they train.

use serde::Serialize;

use crate::error::CvError;

/// Resolved once at setup and never re-queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Parallelism {
    /// Hardware threads available to the process.
    pub host: usize,
    /// Windows predicted concurrently.
    pub cross_window: usize,
    /// Threads handed to each model.
    pub model_threads: usize,
}

impl Parallelism {
    /// Split `host` threads (detected when `None`) across `num_threads`
    /// concurrent windows.
    pub fn resolve(num_threads: usize, host: Option<usize>) -> Result<Self, CvError> {
        if num_threads == 0 {
            return Err(CvError::config("num_threads must be at least 1"));
        }
        if host == Some(0) {
            return Err(CvError::config("host_threads must be at least 1"));
        }
        let host = host.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        Ok(Self {
            host,
            cross_window: num_threads,
            model_threads: (host / num_threads).max(1),
        })
    }

    pub fn is_concurrent(&self) -> bool {
        self.cross_window > 1
    }
}
