//! # Cross-validate a booster on a panel and write the window forecasts
//! forecast-cv cv --data data/sales.csv --config config/run.json --cv-preds results/cv.csv
//!
//! # Forecast 14 periods ahead with the model refit on all data
//! forecast-cv cv --data data/sales.csv --config config/run.json --horizon 14 --output results/forecast.csv
//!
//! # Inspect the backtest windows
//! forecast-cv windows --data data/sales.csv --config config/run.json

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;

use forecast_cv::data::{
    cv_predictions_to_frame, forecast_to_frame, load_dynamic, load_panel, write_csv, DynamicFrame,
};
use forecast_cv::walkforward::build_windows;
use forecast_cv::{CrossValidator, CvConfig, GbdtFactory, GbdtParams, LagFeatures, LagFeaturesConfig};

const SEPARATOR: &str = "============================================================";

/// Everything needed for one cross-validation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct RunConfig {
    cv: CvConfig,
    features: LagFeaturesConfig,
    model: GbdtParams,
}

impl RunConfig {
    fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid run config {}", path.display()))
    }
}

#[derive(Parser)]
#[command(name = "forecast-cv")]
#[command(about = "Walk-forward cross-validation for incrementally trained boosters")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cross-validate, pick the best iteration and optionally forecast
    Cv {
        /// Panel file (CSV or Parquet)
        #[arg(short, long)]
        data: PathBuf,

        /// Run configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Override the number of windows trained concurrently
        #[arg(long)]
        num_threads: Option<usize>,

        /// Write the validation forecasts of every window here
        #[arg(long)]
        cv_preds: Option<PathBuf>,

        /// Periods to forecast past the end of the panel
        #[arg(long, default_value_t = 0)]
        horizon: usize,

        /// Future values of dynamic covariates (CSV or Parquet)
        #[arg(long)]
        future: Option<PathBuf>,

        /// Forecast output file
        #[arg(short, long, default_value = "forecast.csv")]
        output: PathBuf,
    },

    /// Print the backtest window layout
    Windows {
        /// Panel file (CSV or Parquet)
        #[arg(short, long)]
        data: PathBuf,

        /// Run configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn cmd_cv(
    data: &Path,
    run: RunConfig,
    cv_preds: Option<PathBuf>,
    horizon: usize,
    future: Option<PathBuf>,
    output: &Path,
) -> Result<()> {
    let columns = run.cv.columns.clone();
    let panel = load_panel(data, &columns).with_context(|| format!("Failed to load {}", data.display()))?;
    info!("Loaded {} series, {} rows", panel.n_series(), panel.n_rows());

    let mut cv_config = run.cv;
    cv_config.compute_cv_preds |= cv_preds.is_some();
    let fit_on_all = cv_config.fit_on_all;

    // Observed covariates cover every validation horizon.
    let observed = DynamicFrame::from_panel(&panel, &columns.static_features);
    let mut dynamic = Vec::new();
    if !observed.is_empty() {
        dynamic.push(observed);
    }

    let mut cv = CrossValidator::new(LagFeatures::new(run.features), GbdtFactory::new(run.model), cv_config);
    let history = cv.fit(&panel, &dynamic, None).context("Cross-validation failed")?;

    println!("{}", SEPARATOR);
    println!("Cross-validation ({} windows, metric {})", cv.windows().len(), cv.metric_label());
    println!("{}", SEPARATOR);
    for entry in history.entries() {
        println!("[{:>6}] {}: {:.6}", entry.rounds, cv.metric_label(), entry.metric);
    }
    if let Some(best) = cv.best_iteration() {
        println!("Best iteration: {}", best);
    }
    println!("{}", SEPARATOR);

    if let (Some(path), Some(preds)) = (cv_preds, cv.cv_preds()) {
        let mut df = cv_predictions_to_frame(preds, &columns)?;
        write_csv(&mut df, &path).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {} cross-validation predictions to {}", preds.len(), path.display());
    }

    if horizon > 0 {
        let mut future_frames = Vec::new();
        if let Some(path) = future {
            future_frames.push(load_dynamic(&path, &columns).with_context(|| format!("Failed to load {}", path.display()))?);
        }
        let forecast = if fit_on_all {
            cv.predict(horizon, &future_frames, None)
        } else {
            cv.cv_predict(horizon, &future_frames, None)
        }
        .context("Forecasting failed")?;

        let mut df = forecast_to_frame(&forecast, &columns)?;
        write_csv(&mut df, output).with_context(|| format!("Failed to write {}", output.display()))?;
        info!("Wrote {} forecast rows to {}", forecast.n_rows(), output.display());
    }

    Ok(())
}

fn cmd_windows(data: &Path, run: RunConfig) -> Result<()> {
    let panel = load_panel(data, &run.cv.columns).with_context(|| format!("Failed to load {}", data.display()))?;
    let freq = run.cv.resolve_freq(run.features.freq)?;
    let windows =
        build_windows(&panel, run.cv.n_windows, run.cv.window_size, freq).context("Invalid window layout")?;

    println!("{}", SEPARATOR);
    println!(
        "{} windows of {} periods over {} series",
        windows.len(),
        run.cv.window_size,
        panel.n_series()
    );
    println!("{}", SEPARATOR);
    println!("| Window | Cutoff | Train rows | Validation rows | Validation range |");
    println!("|--------|--------|------------|-----------------|------------------|");
    for window in &windows {
        let summary = window.summary();
        let range = match (summary.validation_start, summary.validation_end) {
            (Some(start), Some(end)) => format!("{} .. {}", start, end),
            _ => "-".to_string(),
        };
        println!(
            "| {:>6} | {} | {:>10} | {:>15} | {} |",
            summary.index, summary.cutoff, summary.train_rows, summary.validation_rows, range
        );
    }

    Ok(())
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("forecast_cv=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Cv {
            data,
            config,
            num_threads,
            cv_preds,
            horizon,
            future,
            output,
        } => {
            let mut run = RunConfig::load(&config)?;
            if let Some(n) = num_threads {
                run.cv.num_threads = n;
            }
            cmd_cv(&data, run, cv_preds, horizon, future, &output)?;
        }
        Commands::Windows { data, config } => {
            let run = RunConfig::load(&config)?;
            cmd_windows(&data, run)?;
        }
    }

    Ok(())
}
