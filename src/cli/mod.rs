//! Command-line parsing for the county growth analysis.
//!
//! The goal of this module is to keep **argument parsing** and **command dispatch**
//! separate from the modeling/math code.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::{DEFAULT_HIGH_RISK_ELDERLY_PCT, DEFAULT_STATE, SampleMode, SamplerControl};
use crate::eval::{DEFAULT_K_THRESHOLD, DEFAULT_NOISE_SE};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(
    name = "cg",
    version,
    about = "Hierarchical negative-binomial models of county COVID-19 case growth"
)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load and transform the input tables, print what was kept.
    Prepare(PrepareArgs),
    /// Prior predictive check for one model of the ladder.
    Prior(PriorArgs),
    /// Fit the model ladder, compare by LOO and choose a model.
    Fit(FitArgs),
    /// Re-print a summary saved by `cg fit --export-summary`.
    Show(ShowArgs),
    /// Check interval coverage of the baseline model on synthetic data.
    Simulate(SimulateArgs),
}

/// Where the input tables live and which rows to keep.
#[derive(Debug, Args, Clone)]
pub struct DataArgs {
    /// Directory holding cases.csv, population.csv, census.csv, metro.csv and mobility.csv.
    ///
    /// Falls back to COUNTY_GROWTH_DATA_DIR, then the current directory.
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// State whose counties are analysed.
    #[arg(long, default_value = DEFAULT_STATE)]
    pub state: String,

    /// Share of residents aged 65+ (percent) above which a county is high-risk.
    #[arg(long, default_value_t = DEFAULT_HIGH_RISK_ELDERLY_PCT)]
    pub high_risk_pct: f64,
}

/// Controls for the posterior sampler.
#[derive(Debug, Args, Clone)]
pub struct SamplerArgs {
    /// Number of chains.
    #[arg(long, default_value_t = SamplerControl::default().chains)]
    pub chains: usize,

    /// Warmup (adaptation) iterations per chain.
    #[arg(long, default_value_t = SamplerControl::default().warmup)]
    pub warmup: usize,

    /// Kept draws per chain.
    #[arg(long, default_value_t = SamplerControl::default().draws)]
    pub draws: usize,

    /// Keep every n-th iteration after warmup.
    #[arg(long, default_value_t = SamplerControl::default().thin)]
    pub thin: usize,

    /// Target acceptance rate for the adaptive proposals.
    #[arg(long, default_value_t = SamplerControl::default().target_accept)]
    pub target_accept: f64,

    /// Random seed (chains and predictive replicates derive from it).
    #[arg(long, default_value_t = SamplerControl::default().seed)]
    pub seed: u64,
}

impl SamplerArgs {
    pub fn control(&self) -> SamplerControl {
        SamplerControl {
            chains: self.chains,
            warmup: self.warmup,
            draws: self.draws,
            thin: self.thin,
            target_accept: self.target_accept,
            seed: self.seed,
        }
    }
}

#[derive(Debug, Parser, Clone)]
pub struct PrepareArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Export the derived per-county-day dataset to CSV.
    #[arg(long, value_name = "CSV")]
    pub export: Option<PathBuf>,
}

#[derive(Debug, Parser, Clone)]
pub struct PriorArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[command(flatten)]
    pub sampler: SamplerArgs,

    /// Ladder model whose priors are checked.
    #[arg(long, default_value = "time")]
    pub model: String,
}

/// Options for fitting and comparing the ladder.
#[derive(Debug, Parser, Clone)]
pub struct FitArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[command(flatten)]
    pub sampler: SamplerArgs,

    /// Comma-separated ladder models to fit (all when omitted).
    #[arg(long, value_delimiter = ',')]
    pub models: Vec<String>,

    /// Which rows each model is evaluated on.
    #[arg(long = "sample", value_enum, default_value_t = SampleMode::Common)]
    pub sample_mode: SampleMode,

    /// ELPD differences within this many standard errors count as ties.
    #[arg(long, default_value_t = DEFAULT_NOISE_SE)]
    pub noise_se: f64,

    /// Pareto k above which an observation is reported as influential.
    #[arg(long, default_value_t = DEFAULT_K_THRESHOLD)]
    pub k_threshold: f64,

    /// Show at most this many high-k observations per model.
    #[arg(long, default_value_t = 10)]
    pub top: usize,

    /// Render an ASCII plot in the terminal (enabled by default).
    #[arg(long, default_value_t = true)]
    pub plot: bool,

    /// Disable the terminal plot.
    #[arg(long)]
    pub no_plot: bool,

    /// Plot width (columns).
    #[arg(long, default_value_t = 100)]
    pub width: usize,

    /// Plot height (rows).
    #[arg(long, default_value_t = 25)]
    pub height: usize,

    /// Export the model ranking to CSV.
    #[arg(long, value_name = "CSV")]
    pub export: Option<PathBuf>,

    /// Export the full run summary to JSON.
    #[arg(long = "export-summary", value_name = "JSON")]
    pub export_summary: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct ShowArgs {
    /// Summary JSON file produced by `cg fit --export-summary`.
    #[arg(long, value_name = "JSON")]
    pub summary: PathBuf,
}

#[derive(Debug, Parser, Clone)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub sampler: SamplerArgs,

    /// Number of synthetic datasets.
    #[arg(long, default_value_t = 20)]
    pub replications: usize,

    /// Counties per synthetic dataset.
    #[arg(long, default_value_t = 3)]
    pub counties: usize,

    /// Days per county.
    #[arg(long, default_value_t = 30)]
    pub days: usize,
}
