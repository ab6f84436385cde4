//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments and sets up logging
//! - resolves input paths from flags, the environment and `.env`
//! - runs the pipeline stages each subcommand needs
//! - prints reports/plots
//! - writes optional exports

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Command, DataArgs, FitArgs, PrepareArgs, PriorArgs, ShowArgs, SimulateArgs};
use crate::data::{SyntheticConfig, TransformOptions};
use crate::domain::{DataPaths, FitConfig};
use crate::error::AppError;
use crate::fit::AdaptiveMetropolis;
use crate::models::{model_ladder, select_models};

pub mod pipeline;

/// Environment variable naming the directory of input tables.
pub const DATA_DIR_VAR: &str = "COUNTY_GROWTH_DATA_DIR";

/// Entry point for the `cg` binary.
pub fn run() -> Result<(), AppError> {
    let cli = crate::cli::Cli::parse();
    // `.env` may set RUST_LOG, so it has to be loaded before the subscriber.
    dotenvy::dotenv().ok();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Prepare(args) => handle_prepare(args),
        Command::Prior(args) => handle_prior(args),
        Command::Fit(args) => handle_fit(args),
        Command::Show(args) => handle_show(args),
        Command::Simulate(args) => handle_simulate(args),
    }
}

/// Log to stderr.
fn init_tracing(verbosity: u8) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbosity, rust_log.as_deref()))
        .with_writer(std::io::stderr)
        .init();
}

/// `RUST_LOG` when set and valid, else `warn`. Each `-v` adds a global level
/// on top; without `-v` the environment is used as is.
fn log_filter(verbosity: u8, rust_log: Option<&str>) -> EnvFilter {
    let filter = rust_log
        .filter(|s| !s.trim().is_empty())
        .and_then(|s| EnvFilter::try_new(s).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    let level = match verbosity {
        0 => return filter,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    filter.add_directive(level.into())
}

fn handle_prepare(args: PrepareArgs) -> Result<(), AppError> {
    let paths = data_paths(args.data.data_dir.as_deref());
    let prepared = pipeline::prepare(&paths, &transform_options(&args.data))?;

    println!("{}", crate::report::format_prepare(&prepared));

    if let Some(path) = &args.export {
        crate::io::write_dataset_csv(path, &prepared.dataset.observations)?;
        tracing::info!(path = %path.display(), "dataset exported");
    }
    Ok(())
}

fn handle_prior(args: PriorArgs) -> Result<(), AppError> {
    let paths = data_paths(args.data.data_dir.as_deref());
    let prepared = pipeline::prepare(&paths, &transform_options(&args.data))?;
    let selected = select_models(&model_ladder(), std::slice::from_ref(&args.model))?;
    let spec = selected
        .first()
        .ok_or_else(|| AppError::input(format!("Unknown model '{}'.", args.model)))?;

    let check = pipeline::prior_check(
        &AdaptiveMetropolis::default(),
        &prepared.dataset.observations,
        spec,
        &args.sampler.control(),
    )?;
    println!("{}", crate::report::format_prior_check(&check));
    Ok(())
}

fn handle_fit(args: FitArgs) -> Result<(), AppError> {
    let config = fit_config_from_args(&args)?;
    let prepared = pipeline::prepare(
        &config.paths,
        &TransformOptions {
            state: config.state.clone(),
            high_risk_elderly_pct: config.high_risk_elderly_pct,
        },
    )?;
    let ladder = select_models(&model_ladder(), &config.models)?;

    let run = pipeline::run_ladder(
        &AdaptiveMetropolis::default(),
        &prepared.dataset.observations,
        &ladder,
        &config,
    )?;

    for model in &run.models {
        println!(
            "{}",
            crate::report::format_model_summary(&model.summary, &model.loo.high_k, config.top_n)
        );
    }
    println!(
        "{}",
        crate::report::format_ranking(&run.ranking, &run.chosen, config.noise_se, config.sample_mode)
    );

    if config.plot {
        println!(
            "{}",
            crate::plot::render_daily_plot(&run.daily, config.plot_width, config.plot_height)
        );
    }

    if let Some(path) = &config.export_ranking {
        crate::io::write_ranking_csv(path, &run.ranking, &run.chosen)?;
    }
    if let Some(path) = &config.export_summary {
        let summary = pipeline::summary_file(&config, &prepared.dataset, &run);
        crate::io::write_summary_json(path, &summary)?;
    }
    Ok(())
}

fn handle_show(args: ShowArgs) -> Result<(), AppError> {
    let summary = crate::io::read_summary_json(&args.summary)?;
    println!("{}", crate::report::format_summary_file(&summary));
    Ok(())
}

fn handle_simulate(args: SimulateArgs) -> Result<(), AppError> {
    let config = pipeline::SimulationConfig {
        replications: args.replications,
        synthetic: SyntheticConfig {
            counties: args.counties,
            days: args.days,
            seed: args.sampler.seed,
            ..SyntheticConfig::default()
        },
        control: args.sampler.control(),
    };
    let report = pipeline::calibration_study(&AdaptiveMetropolis::default(), &config)?;
    println!("{}", crate::report::format_calibration(&report));
    Ok(())
}

pub fn fit_config_from_args(args: &FitArgs) -> Result<FitConfig, AppError> {
    if !(args.noise_se.is_finite() && args.noise_se >= 0.0) {
        return Err(AppError::input("--noise-se must be a non-negative number."));
    }
    if !(args.k_threshold.is_finite() && args.k_threshold > 0.0) {
        return Err(AppError::input("--k-threshold must be positive."));
    }
    let plot = args.plot && !args.no_plot;
    if plot && (args.width < 10 || args.height < 5) {
        return Err(AppError::input("Plot needs --width >= 10 and --height >= 5."));
    }

    Ok(FitConfig {
        paths: data_paths(args.data.data_dir.as_deref()),
        state: args.data.state.clone(),
        high_risk_elderly_pct: args.data.high_risk_pct,
        models: args.models.clone(),
        sample_mode: args.sample_mode,
        control: args.sampler.control(),
        noise_se: args.noise_se,
        k_threshold: args.k_threshold,
        top_n: args.top,
        plot,
        plot_width: args.width,
        plot_height: args.height,
        export_ranking: args.export.clone(),
        export_summary: args.export_summary.clone(),
    })
}

fn transform_options(data: &DataArgs) -> TransformOptions {
    TransformOptions {
        state: data.state.clone(),
        high_risk_elderly_pct: data.high_risk_pct,
    }
}

/// Resolve the five input tables.
///
/// The directory comes from `--data-dir`, else `COUNTY_GROWTH_DATA_DIR`, else
/// the working directory. Each file name may be replaced through
/// `COUNTY_GROWTH_<TABLE>_FILE`; absolute overrides ignore the directory.
pub fn data_paths(data_dir: Option<&Path>) -> DataPaths {
    let dir = data_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(DATA_DIR_VAR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    let table = |name: &str| {
        let var = format!("COUNTY_GROWTH_{}_FILE", name.to_ascii_uppercase());
        let file = std::env::var_os(var)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("{name}.csv")));
        dir.join(file)
    };

    DataPaths {
        cases: table("cases"),
        population: table("population"),
        census: table("census"),
        metro: table("metro"),
        mobility: table("mobility"),
    }
}
