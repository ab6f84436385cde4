//! Predictive checks on posterior or prior draws.
//!
//! For each observation and draw we compute `mu = exp(log mu)` and simulate a
//! replicated count `y_rep ~ NB(mu, phi)` through its Gamma–Poisson mixture.
//! The same machinery serves both checks:
//!
//! - posterior: are the per-capita rates plausible, and do central predictive
//!   intervals cover the observed counts at their nominal rate?
//! - prior: how often do the priors alone imply more cases than residents?

use std::collections::BTreeMap;

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{Gamma, Poisson};
use rayon::prelude::*;

use crate::domain::PredictiveSummary;
use crate::error::AppError;
use crate::math::{quantile_sorted, sample_quantiles};
use crate::models::{ModelFrame, ModelParams, log_mean};

/// Above this Poisson mean the draw is replaced by the mean itself.
const POISSON_DIRECT_LIMIT: f64 = 1e12;

#[derive(Debug, Clone)]
pub struct PredictiveCheck {
    pub summary: PredictiveSummary,
    /// `E[mu_i]` over draws, per frame row.
    pub expected: Vec<f64>,
}

/// Observed and expected totals per elapsed day, summed over counties.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyTotal {
    pub t: u32,
    pub observed: f64,
    pub expected: f64,
}

struct RowCheck {
    expected: f64,
    exceed: usize,
    in_50: bool,
    in_90: bool,
}

/// Run the predictive check for `params` (posterior or prior draws).
pub fn predictive_check(frame: &ModelFrame, params: &[ModelParams], seed: u64) -> Result<PredictiveCheck, AppError> {
    if params.is_empty() {
        return Err(AppError::numeric("Predictive check needs at least one draw."));
    }
    let rows = (0..frame.n_obs())
        .into_par_iter()
        .map(|i| check_row(frame, params, i, seed))
        .collect::<Result<Vec<_>, AppError>>()?;

    let n = rows.len();
    let expected: Vec<f64> = rows.iter().map(|r| r.expected).collect();
    let rates: Vec<f64> = expected
        .iter()
        .zip(&frame.population)
        .map(|(e, pop)| e / pop)
        .collect();
    let n_exceeding_population = expected
        .iter()
        .zip(&frame.population)
        .filter(|(e, pop)| *e > *pop)
        .count();
    let exceed: usize = rows.iter().map(|r| r.exceed).sum();

    let summary = PredictiveSummary {
        rate_quantiles: sample_quantiles(&rates),
        n_exceeding_population,
        replicate_exceed_fraction: exceed as f64 / (n * params.len()) as f64,
        coverage_50: rows.iter().filter(|r| r.in_50).count() as f64 / n as f64,
        coverage_90: rows.iter().filter(|r| r.in_90).count() as f64 / n as f64,
    };

    Ok(PredictiveCheck { summary, expected })
}

fn check_row(frame: &ModelFrame, params: &[ModelParams], i: usize, seed: u64) -> Result<RowCheck, AppError> {
    let mut rng = StdRng::seed_from_u64(seed ^ (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    let population = frame.population[i];
    let mut sum_mu = 0.0;
    let mut exceed = 0usize;
    let mut reps = Vec::with_capacity(params.len());

    for p in params {
        let mu = log_mean(frame, i, p).exp();
        sum_mu += mu;
        let y_rep = replicate_count(&mut rng, mu, p.shape)?;
        if y_rep > population {
            exceed += 1;
        }
        reps.push(y_rep);
    }
    reps.sort_by(f64::total_cmp);

    let y = frame.y[i] as f64;
    let within = |lo: f64, hi: f64| quantile_sorted(&reps, lo) <= y && y <= quantile_sorted(&reps, hi);

    Ok(RowCheck {
        expected: sum_mu / params.len() as f64,
        exceed,
        in_50: within(0.25, 0.75),
        in_90: within(0.05, 0.95),
    })
}

/// One `NB(mu, phi)` draw as a Gamma–Poisson mixture.
pub fn replicate_count<R: Rng + ?Sized>(rng: &mut R, mu: f64, phi: f64) -> Result<f64, AppError> {
    if !mu.is_finite() {
        return Ok(f64::INFINITY);
    }
    if mu <= 0.0 {
        return Ok(0.0);
    }
    let gamma = Gamma::new(phi, mu / phi)
        .map_err(|e| AppError::numeric(format!("Invalid negative-binomial draw (mu={mu}, phi={phi}): {e}")))?;
    let lambda: f64 = gamma.sample(rng);
    if !lambda.is_finite() {
        return Ok(f64::INFINITY);
    }
    if lambda <= 0.0 {
        return Ok(0.0);
    }
    if lambda > POISSON_DIRECT_LIMIT {
        return Ok(lambda.round());
    }
    let poisson = Poisson::new(lambda).map_err(|e| AppError::numeric(format!("Invalid Poisson mean {lambda}: {e}")))?;
    Ok(poisson.sample(rng))
}

/// State-level observed and expected daily totals, ordered by `t`.
pub fn daily_totals(frame: &ModelFrame, expected: &[f64]) -> Vec<DailyTotal> {
    let mut by_day: BTreeMap<u32, (f64, f64)> = BTreeMap::new();
    for (i, e) in expected.iter().enumerate() {
        let entry = by_day.entry(frame.t[i]).or_insert((0.0, 0.0));
        entry.0 += frame.y[i] as f64;
        entry.1 += e;
    }
    by_day
        .into_iter()
        .map(|(t, (observed, expected))| DailyTotal { t, observed, expected })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::{SyntheticConfig, generate_observations};
    use crate::models::{build_frame, model_ladder};
    use nalgebra::DMatrix;

    fn params_for(frame: &ModelFrame, intercept: f64, beta: Vec<f64>, shape: f64) -> ModelParams {
        ModelParams {
            intercept,
            beta,
            shape,
            random_sd: vec![0.1],
            corr_chol: DMatrix::identity(1, 1),
            county_effects: DMatrix::zeros(frame.n_groups(), 1),
        }
    }

    #[test]
    fn replicate_count_has_negative_binomial_moments() {
        let mut rng = StdRng::seed_from_u64(5);
        let draws: Vec<f64> = (0..20_000)
            .map(|_| replicate_count(&mut rng, 10.0, 5.0).unwrap())
            .collect();
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        let var = draws.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / draws.len() as f64;
        assert!((mean - 10.0).abs() < 0.2, "mean {mean}");
        assert!((var - 30.0).abs() < 2.0, "var {var}");
    }

    #[test]
    fn infinite_mean_replicates_exceed_population() {
        let mut rng = StdRng::seed_from_u64(6);
        assert_eq!(replicate_count(&mut rng, f64::INFINITY, 2.0).unwrap(), f64::INFINITY);
        assert_eq!(replicate_count(&mut rng, 0.0, 2.0).unwrap(), 0.0);
    }

    #[test]
    fn true_parameters_give_near_nominal_coverage() {
        let config = SyntheticConfig {
            counties: 10,
            days: 60,
            ..SyntheticConfig::default()
        };
        let data = generate_observations(&config).unwrap();
        let spec = &model_ladder()[0];
        let frame = build_frame(&data.observations, spec).unwrap();
        let mut p = params_for(&frame, data.truth.intercept, data.truth.beta.clone(), data.truth.shape);
        p.county_effects = DMatrix::from_fn(frame.n_groups(), 1, |g, _| data.truth.county_intercepts[g]);
        let params = vec![p; 400];

        let check = predictive_check(&frame, &params, 9).unwrap();
        // Inclusive bounds on discrete counts over-cover slightly.
        assert!(check.summary.coverage_90 > 0.84 && check.summary.coverage_90 < 0.99, "{:?}", check.summary);
        assert!(check.summary.coverage_50 > 0.40 && check.summary.coverage_50 < 0.72, "{:?}", check.summary);
        assert_eq!(check.summary.n_exceeding_population, 0);
    }

    #[test]
    fn daily_totals_sum_over_counties() {
        let data = generate_observations(&SyntheticConfig::default()).unwrap();
        let spec = &model_ladder()[0];
        let frame = build_frame(&data.observations, spec).unwrap();
        let expected = vec![1.0; frame.n_obs()];
        let totals = daily_totals(&frame, &expected);
        assert_eq!(totals.len(), SyntheticConfig::default().days);
        assert!(totals.iter().all(|d| d.expected == SyntheticConfig::default().counties as f64));
        let observed: f64 = totals.iter().map(|d| d.observed).sum();
        assert_eq!(observed, frame.y.iter().sum::<u64>() as f64);
    }
}
