//! Shared analysis pipeline used by every subcommand.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! load -> transform -> (per model) frame -> fit -> predictive check -> LOO -> rank
//!
//! Each stage is a plain function of its inputs; the CLI layer only decides
//! what to print.

use crate::data::{Dataset, SyntheticConfig, TransformOptions, generate_observations, transform};
use crate::domain::{
    Covariate, DataPaths, FitConfig, ModelSpecification, ModelSummary, Observation, ParameterSummary,
    PredictiveSummary, RankEntry, SampleMode, SamplerControl, SummaryFile,
};
use crate::error::AppError;
use crate::eval::{DailyTotal, LooResult, ModelLoo, choose_model, daily_totals, predictive_check, psis_loo, rank_models};
use crate::fit::{PosteriorSampler, sampler_diagnostics, summarize_parameters};
use crate::io::ingest::{IngestedData, load_dataset};
use crate::models::{ModelFrame, build_frame, build_frame_with, ensure_nested, model_ladder, union_covariates};

/// Replicated counts above population in more than this share of prior draws
/// trigger a warning.
const PRIOR_EXCEED_WARN: f64 = 0.01;

/// Loaded and transformed input data.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub ingest: IngestedData,
    pub dataset: Dataset,
    /// Observations with every covariate of the full ladder, i.e. the size of
    /// the common evaluation sample.
    pub common_rows: usize,
}

/// Everything computed for one model of the ladder.
#[derive(Debug, Clone)]
pub struct ModelRun {
    pub spec: ModelSpecification,
    pub frame: ModelFrame,
    pub summary: ModelSummary,
    pub loo: LooResult,
    /// Posterior mean of expected cases per frame row.
    pub expected: Vec<f64>,
}

/// All computed outputs of a `cg fit` run.
#[derive(Debug, Clone)]
pub struct LadderRun {
    pub models: Vec<ModelRun>,
    pub ranking: Vec<RankEntry>,
    pub chosen: String,
    /// Observed vs expected daily totals under the chosen model.
    pub daily: Vec<DailyTotal>,
}

/// Prior predictive check for one specification.
#[derive(Debug, Clone)]
pub struct PriorCheck {
    pub model: String,
    pub n_obs: usize,
    pub draws: usize,
    pub parameters: Vec<ParameterSummary>,
    pub predictive: PredictiveSummary,
}

/// Settings for the synthetic calibration study.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub replications: usize,
    pub synthetic: SyntheticConfig,
    pub control: SamplerControl,
}

/// How often one parameter's 95% interval covered its true value.
#[derive(Debug, Clone)]
pub struct CoverageRow {
    pub name: String,
    pub truth: f64,
    pub covered: usize,
}

#[derive(Debug, Clone)]
pub struct CalibrationReport {
    pub replications: usize,
    pub rows: Vec<CoverageRow>,
    pub max_rhat: f64,
}

/// Load the five tables and derive observations.
pub fn prepare(paths: &DataPaths, opts: &TransformOptions) -> Result<PreparedData, AppError> {
    let ingest = load_dataset(paths)?;
    if !ingest.row_errors.is_empty() {
        tracing::warn!(count = ingest.row_errors.len(), "rows skipped during ingest");
    }
    let dataset = transform(&ingest.rows, opts)?;
    let union = union_covariates(&model_ladder());
    let common_rows = dataset
        .observations
        .iter()
        .filter(|o| union.iter().all(|&c| o.covariate(c).is_some_and(f64::is_finite)))
        .count();
    tracing::info!(
        observations = dataset.observations.len(),
        counties = dataset.stats.counties,
        clamped = dataset.stats.clamped_rows,
        common_rows,
        "dataset prepared"
    );
    Ok(PreparedData {
        ingest,
        dataset,
        common_rows,
    })
}

/// Fit one specification and evaluate it.
///
/// `also_required` lists covariates whose presence is required on top of the
/// model's own (used to share one evaluation sample across models).
pub fn fit_model<S: PosteriorSampler + ?Sized>(
    sampler: &S,
    observations: &[Observation],
    spec: &ModelSpecification,
    also_required: &[Covariate],
    control: &SamplerControl,
    k_threshold: f64,
) -> Result<ModelRun, AppError> {
    let frame = build_frame_with(observations, spec, also_required)?;
    let draws = sampler.fit(&frame, spec, control)?;

    let parameters = summarize_parameters(&draws, spec);
    let diagnostics = sampler_diagnostics(&draws, &parameters);
    if !diagnostics.converged() {
        tracing::warn!(
            model = %spec.name,
            max_rhat = diagnostics.max_rhat,
            non_finite = diagnostics.non_finite_proposals,
            "sampler did not converge cleanly"
        );
    }

    let params = draws.params();
    let check = predictive_check(&frame, &params, control.seed)?;
    if check.summary.n_exceeding_population > 0 {
        tracing::warn!(
            model = %spec.name,
            rows = check.summary.n_exceeding_population,
            "expected cases exceed population"
        );
    }

    let loo = psis_loo(&frame, &params, k_threshold)?;
    if loo.summary.n_high_k > 0 {
        tracing::warn!(
            model = %spec.name,
            count = loo.summary.n_high_k,
            max_k = loo.summary.max_k,
            "observations with high Pareto k"
        );
    }

    let summary = ModelSummary {
        name: spec.name.clone(),
        complexity: spec.complexity,
        fixed: spec.fixed.clone(),
        random: spec.random.clone(),
        n_obs: frame.n_obs(),
        dropped_rows: frame.dropped_rows,
        parameters,
        diagnostics,
        predictive: check.summary,
        loo: loo.summary.clone(),
    };

    Ok(ModelRun {
        spec: spec.clone(),
        frame,
        summary,
        loo,
        expected: check.expected,
    })
}

/// Fit every specification of `ladder`, rank them and pick one.
pub fn run_ladder<S: PosteriorSampler + ?Sized>(
    sampler: &S,
    observations: &[Observation],
    ladder: &[ModelSpecification],
    config: &FitConfig,
) -> Result<LadderRun, AppError> {
    ensure_nested(ladder)?;

    let also_required = match config.sample_mode {
        SampleMode::Common => union_covariates(ladder),
        SampleMode::PerModel => Vec::new(),
    };

    let mut models = Vec::with_capacity(ladder.len());
    for spec in ladder {
        let run = fit_model(sampler, observations, spec, &also_required, &config.control, config.k_threshold)?;
        tracing::info!(
            model = %spec.name,
            elpd_loo = run.loo.summary.elpd_loo,
            se = run.loo.summary.se_elpd_loo,
            "model evaluated"
        );
        models.push(run);
    }

    let loos: Vec<ModelLoo> = models
        .iter()
        .map(|m| ModelLoo {
            name: m.spec.name.clone(),
            complexity: m.spec.complexity,
            loo: m.loo.clone(),
        })
        .collect();
    let ranking = rank_models(&loos)?;
    let chosen = choose_model(&ranking, config.noise_se)
        .map(|e| e.name.clone())
        .ok_or_else(|| AppError::insufficient("No model could be chosen."))?;

    let daily = models
        .iter()
        .find(|m| m.spec.name == chosen)
        .map(|m| daily_totals(&m.frame, &m.expected))
        .unwrap_or_default();

    Ok(LadderRun {
        models,
        ranking,
        chosen,
        daily,
    })
}

/// Prior predictive check for `spec` on the observed design.
pub fn prior_check<S: PosteriorSampler + ?Sized>(
    sampler: &S,
    observations: &[Observation],
    spec: &ModelSpecification,
    control: &SamplerControl,
) -> Result<PriorCheck, AppError> {
    let frame = build_frame(observations, spec)?;
    let draws = sampler.sample_prior_only(&frame, spec, control)?;
    let params = draws.params();
    let check = predictive_check(&frame, &params, control.seed)?;

    if check.summary.replicate_exceed_fraction > PRIOR_EXCEED_WARN {
        tracing::warn!(
            model = %spec.name,
            fraction = check.summary.replicate_exceed_fraction,
            "prior predictive counts exceed population"
        );
    }

    Ok(PriorCheck {
        model: spec.name.clone(),
        n_obs: frame.n_obs(),
        draws: draws.total_draws(),
        parameters: summarize_parameters(&draws, spec),
        predictive: check.summary,
    })
}

/// Fit the baseline model to replicated synthetic datasets and count how often
/// the 95% intervals cover the generating values.
pub fn calibration_study<S: PosteriorSampler + ?Sized>(
    sampler: &S,
    config: &SimulationConfig,
) -> Result<CalibrationReport, AppError> {
    if config.replications == 0 {
        return Err(AppError::input("Replications must be > 0."));
    }
    let ladder = model_ladder();
    let spec = ladder
        .first()
        .ok_or_else(|| AppError::input("The model ladder is empty."))?;

    let truths = [
        ("intercept", config.synthetic.intercept),
        ("b_time", config.synthetic.beta_time),
        ("b_time_sq", config.synthetic.beta_time_sq),
        ("shape", config.synthetic.shape),
        ("sd_county__intercept", config.synthetic.county_sd),
    ];
    let mut rows: Vec<CoverageRow> = truths
        .iter()
        .map(|(name, truth)| CoverageRow {
            name: (*name).to_string(),
            truth: *truth,
            covered: 0,
        })
        .collect();
    let mut max_rhat = f64::NEG_INFINITY;

    for rep in 0..config.replications {
        let offset = rep as u64;
        let synthetic = SyntheticConfig {
            seed: config.synthetic.seed.wrapping_add(offset),
            ..config.synthetic.clone()
        };
        let control = SamplerControl {
            seed: config.control.seed.wrapping_add(offset),
            ..config.control
        };

        let data = generate_observations(&synthetic)?;
        let frame = build_frame(&data.observations, spec)?;
        let draws = sampler.fit(&frame, spec, &control)?;
        let parameters = summarize_parameters(&draws, spec);
        max_rhat = max_rhat.max(sampler_diagnostics(&draws, &parameters).max_rhat);

        for row in rows.iter_mut() {
            if let Some(p) = parameters.iter().find(|p| p.name == row.name) {
                if p.q2_5 <= row.truth && row.truth <= p.q97_5 {
                    row.covered += 1;
                }
            }
        }
        tracing::debug!(replication = rep, "calibration replication done");
    }

    Ok(CalibrationReport {
        replications: config.replications,
        rows,
        max_rhat,
    })
}

/// Build the JSON summary of a ladder run.
pub fn summary_file(config: &FitConfig, dataset: &Dataset, run: &LadderRun) -> SummaryFile {
    SummaryFile {
        tool: "cg".to_string(),
        state: config.state.clone(),
        date_range: (dataset.stats.first_date, dataset.stats.last_date),
        sample_mode: config.sample_mode,
        control: config.control,
        noise_se: config.noise_se,
        k_threshold: config.k_threshold,
        models: run.models.iter().map(|m| m.summary.clone()).collect(),
        ranking: run.ranking.clone(),
        chosen: run.chosen.clone(),
    }
}
