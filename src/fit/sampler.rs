//! Posterior sampling.
//!
//! [`PosteriorSampler`] is the seam between the pipeline and whatever draws
//! from the posterior. The in-crate engine, [`AdaptiveMetropolis`], is a
//! Metropolis-within-Gibbs scheme:
//!
//! - the global block (intercept, β, log φ, log sd, CPCs) moves jointly with a
//!   Gaussian random walk whose covariance is learned during warmup
//! - the same block moves a second time with `u` re-solved so that every
//!   county keeps its total coefficients ([`LogDensity::recenter`])
//! - each standardized county coordinate moves on its own, re-evaluating only
//!   that county's rows
//!
//! The first global move mixes well when counties carry little data, the
//! second when they carry a lot; in between both contribute. Step sizes are tuned by Robbins–Monro towards `target_accept` during warmup
//! and frozen afterwards. Chains run in parallel, each with its own seed.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use nalgebra::{DMatrix, DVector};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{Gamma, Normal};
use rayon::prelude::*;

use crate::domain::{ModelSpecification, PriorTable, SamplerControl};
use crate::error::AppError;
use crate::fit::density::{DensityState, LogDensity};
use crate::fit::params::{ParamLayout, unpack};
use crate::math::{log_rate_regression, sample_lkj_cpcs};
use crate::models::{ModelFrame, ModelParams};

/// Acceptance bookkeeping for one chain (sampling phase only).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainStats {
    pub global_accepted: usize,
    pub global_proposed: usize,
    pub centered_accepted: usize,
    pub centered_proposed: usize,
    pub local_accepted: usize,
    pub local_proposed: usize,
    /// Proposals rejected because their log density was not finite.
    pub non_finite: usize,
}

impl ChainStats {
    fn merge(self, other: ChainStats) -> ChainStats {
        ChainStats {
            global_accepted: self.global_accepted + other.global_accepted,
            global_proposed: self.global_proposed + other.global_proposed,
            centered_accepted: self.centered_accepted + other.centered_accepted,
            centered_proposed: self.centered_proposed + other.centered_proposed,
            local_accepted: self.local_accepted + other.local_accepted,
            local_proposed: self.local_proposed + other.local_proposed,
            non_finite: self.non_finite + other.non_finite,
        }
    }

    pub fn global_accept_rate(&self) -> f64 {
        rate(self.global_accepted, self.global_proposed)
    }

    pub fn centered_accept_rate(&self) -> f64 {
        rate(self.centered_accepted, self.centered_proposed)
    }

    pub fn local_accept_rate(&self) -> f64 {
        rate(self.local_accepted, self.local_proposed)
    }
}

fn rate(accepted: usize, proposed: usize) -> f64 {
    if proposed == 0 { f64::NAN } else { accepted as f64 / proposed as f64 }
}

/// Kept draws of one chain, on the unconstrained scale.
#[derive(Debug, Clone)]
pub struct ChainDraws {
    pub theta: Vec<Vec<f64>>,
    pub stats: ChainStats,
}

/// Draws from every chain of one fit.
#[derive(Debug, Clone)]
pub struct PosteriorDraws {
    pub layout: ParamLayout,
    pub chains: Vec<ChainDraws>,
    /// `true` when the draws come from the prior alone.
    pub prior_only: bool,
}

impl PosteriorDraws {
    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn draws_per_chain(&self) -> usize {
        self.chains.iter().map(|c| c.theta.len()).min().unwrap_or(0)
    }

    pub fn total_draws(&self) -> usize {
        self.chains.iter().map(|c| c.theta.len()).sum()
    }

    /// Constrained parameters for every draw, chain by chain.
    pub fn params(&self) -> Vec<ModelParams> {
        self.chains
            .par_iter()
            .flat_map_iter(|c| c.theta.iter().map(|theta| unpack(&self.layout, theta)))
            .collect()
    }

    pub fn stats(&self) -> ChainStats {
        self.chains
            .iter()
            .fold(ChainStats::default(), |acc, c| acc.merge(c.stats))
    }
}

/// A posterior sampling engine.
pub trait PosteriorSampler: Sync {
    fn fit(
        &self,
        frame: &ModelFrame,
        spec: &ModelSpecification,
        control: &SamplerControl,
    ) -> Result<PosteriorDraws, AppError>;

    /// Independent draws from the prior (the likelihood is ignored).
    fn sample_prior_only(
        &self,
        frame: &ModelFrame,
        spec: &ModelSpecification,
        control: &SamplerControl,
    ) -> Result<PosteriorDraws, AppError> {
        draw_from_prior(frame, &spec.priors, control)
    }
}

/// Adaptive random-walk Metropolis-within-Gibbs.
#[derive(Debug, Clone)]
pub struct AdaptiveMetropolis {
    /// Standard deviation of the jitter added to the starting point.
    pub init_jitter: f64,
    /// Jittered restarts tried before giving up on a chain.
    pub max_init_attempts: usize,
    /// Starting random-walk scale for each standardized county coordinate.
    pub initial_local_step: f64,
}

impl Default for AdaptiveMetropolis {
    fn default() -> Self {
        Self {
            init_jitter: 0.1,
            max_init_attempts: 50,
            initial_local_step: 0.5,
        }
    }
}

pub fn validate_control(control: &SamplerControl) -> Result<(), AppError> {
    if control.chains == 0 || control.draws == 0 || control.thin == 0 {
        return Err(AppError::input("Chains, draws and thin must all be > 0."));
    }
    if !(control.target_accept > 0.0 && control.target_accept < 1.0) {
        return Err(AppError::input(format!(
            "Target acceptance must lie in (0, 1), got {}.",
            control.target_accept
        )));
    }
    Ok(())
}

impl PosteriorSampler for AdaptiveMetropolis {
    fn fit(
        &self,
        frame: &ModelFrame,
        spec: &ModelSpecification,
        control: &SamplerControl,
    ) -> Result<PosteriorDraws, AppError> {
        validate_control(control)?;
        let density = LogDensity::new(frame, &spec.priors);
        let start = initial_point(frame, &spec.priors, &density.layout);

        tracing::info!(
            model = %spec.name,
            chains = control.chains,
            warmup = control.warmup,
            draws = control.draws,
            dims = density.layout.len(),
            "sampling posterior"
        );

        let chains = (0..control.chains)
            .into_par_iter()
            .map(|chain| self.run_chain(&density, &start, control, chain, &spec.name))
            .collect::<Result<Vec<_>, AppError>>()?;

        Ok(PosteriorDraws {
            layout: density.layout,
            chains,
            prior_only: false,
        })
    }
}

impl AdaptiveMetropolis {
    fn run_chain(
        &self,
        density: &LogDensity<'_>,
        start: &[f64],
        control: &SamplerControl,
        chain: usize,
        model: &str,
    ) -> Result<ChainDraws, AppError> {
        let layout = density.layout;
        let mut rng = StdRng::seed_from_u64(chain_seed(control.seed, chain, model));
        let normal = Normal::new(0.0, 1.0).map_err(|e| AppError::numeric(format!("Normal distribution error: {e}")))?;

        let mut state = self.initial_state(density, start, &mut rng, &normal).ok_or_else(|| {
            AppError::numeric(format!(
                "Chain {chain} of model '{model}' found no starting point with finite log density."
            ))
        })?;

        let d = layout.global_len();
        let base_log_scale = (2.38 / (d as f64).sqrt()).ln();
        let mut log_scale = base_log_scale;
        let mut centered_log_scale = base_log_scale;
        let mut chol = DMatrix::<f64>::identity(d, d) * 0.1;
        let mut local_log_scale = vec![self.initial_local_step.ln(); layout.n_groups * layout.n_random];
        let mut moments = RunningMoments::new(d);

        let target = control.target_accept;
        let warmup = control.warmup;
        let total = warmup + control.draws * control.thin;
        let mut stats = ChainStats::default();
        let mut kept = Vec::with_capacity(control.draws);

        for iter in 0..total {
            let adapting = iter < warmup;
            let gain = (1.0 + iter as f64).powf(-0.6);

            // Global block, county effects held in standardized form.
            let z = DVector::from_fn(d, |_, _| normal.sample(&mut rng));
            let step = &chol * z * log_scale.exp();
            let mut proposal = state.theta.clone();
            for (slot, s) in proposal.iter_mut().zip(step.iter()) {
                *slot += s;
            }
            let candidate = density.evaluate(proposal).map(|c| (c, 0.0));
            let accepted = metropolis(&mut rng, &mut state, candidate, adapting, &mut stats);
            if adapting {
                log_scale += gain * (f64::from(u8::from(accepted)) - target);
            } else {
                stats.global_proposed += 1;
                stats.global_accepted += usize::from(accepted);
            }

            // Global block again, county totals held fixed.
            let z = DVector::from_fn(d, |_, _| normal.sample(&mut rng));
            let step = &chol * z * centered_log_scale.exp();
            let global: Vec<f64> = state.theta[..d].iter().zip(step.iter()).map(|(v, s)| v + s).collect();
            let candidate = density
                .recenter(&state, &global)
                .and_then(|(theta, log_jacobian)| density.evaluate(theta).map(|c| (c, log_jacobian)));
            let accepted = metropolis(&mut rng, &mut state, candidate, adapting, &mut stats);
            if adapting {
                centered_log_scale += gain * (f64::from(u8::from(accepted)) - target);
            } else {
                stats.centered_proposed += 1;
                stats.centered_accepted += usize::from(accepted);
            }

            // County coordinates.
            for g in 0..layout.n_groups {
                for k in 0..layout.n_random {
                    let slot = g * layout.n_random + k;
                    let current = state.theta[layout.u(g, k)];
                    let value = current + local_log_scale[slot].exp() * normal.sample(&mut rng);
                    let accepted = match density.propose_local(&state, g, k, value) {
                        Some(p) => {
                            let ok = rng.r#gen::<f64>().ln() < p.delta;
                            if ok {
                                density.accept_local(&mut state, g, k, p);
                            }
                            ok
                        }
                        None => {
                            if !adapting {
                                stats.non_finite += 1;
                            }
                            false
                        }
                    };
                    if adapting {
                        local_log_scale[slot] += gain * (f64::from(u8::from(accepted)) - target);
                    } else {
                        stats.local_proposed += 1;
                        stats.local_accepted += usize::from(accepted);
                    }
                }
            }

            if adapting {
                if iter >= warmup / 4 {
                    moments.push(&state.theta[..d]);
                }
                // The last quarter of warmup tunes the scales against the final covariance.
                let checkpoint = iter + 1 == warmup / 2 || iter + 1 == (3 * warmup) / 4;
                if checkpoint && moments.count >= 2 * d {
                    if let Some(l) = moments.proposal_cholesky() {
                        chol = l;
                        log_scale = base_log_scale;
                        centered_log_scale = base_log_scale;
                    }
                }
            } else if (iter - warmup + 1) % control.thin == 0 {
                kept.push(state.theta.clone());
            }
        }

        tracing::debug!(
            model,
            chain,
            global_accept = stats.global_accept_rate(),
            centered_accept = stats.centered_accept_rate(),
            local_accept = stats.local_accept_rate(),
            non_finite = stats.non_finite,
            "chain finished"
        );

        Ok(ChainDraws { theta: kept, stats })
    }

    fn initial_state(
        &self,
        density: &LogDensity<'_>,
        start: &[f64],
        rng: &mut StdRng,
        normal: &Normal<f64>,
    ) -> Option<DensityState> {
        for _ in 0..self.max_init_attempts {
            let theta: Vec<f64> = start
                .iter()
                .map(|v| v + self.init_jitter * normal.sample(rng))
                .collect();
            if let Some(state) = density.evaluate(theta) {
                return Some(state);
            }
        }
        None
    }
}

/// Metropolis accept/reject for a full-density candidate carrying its log
/// Jacobian. A missing candidate counts as a non-finite rejection after warmup.
fn metropolis(
    rng: &mut StdRng,
    state: &mut DensityState,
    candidate: Option<(DensityState, f64)>,
    adapting: bool,
    stats: &mut ChainStats,
) -> bool {
    match candidate {
        Some((candidate, log_jacobian)) => {
            let ok = rng.r#gen::<f64>().ln() < candidate.log_density - state.log_density + log_jacobian;
            if ok {
                *state = candidate;
            }
            ok
        }
        None => {
            if !adapting {
                stats.non_finite += 1;
            }
            false
        }
    }
}

fn chain_seed(seed: u64, chain: usize, model: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    chain.hash(&mut hasher);
    model.hash(&mut hasher);
    hasher.finish()
}

/// Starting point: least squares on the empirical log rate for the intercept
/// and β, prior centres for everything else.
pub fn initial_point(frame: &ModelFrame, priors: &PriorTable, layout: &ParamLayout) -> Vec<f64> {
    let mut theta = vec![0.0; layout.len()];

    let p = frame.n_fixed();
    match log_rate_regression(&frame.x, &frame.y, &frame.population) {
        Some(b) => {
            theta[layout.intercept()] = b[0];
            for j in 0..p {
                theta[layout.beta(j)] = b[j + 1];
            }
        }
        None => {
            theta[layout.intercept()] = priors.intercept.mean;
            for (j, c) in priors.coefficients.iter().enumerate().take(p) {
                theta[layout.beta(j)] = c.prior.mean;
            }
        }
    }

    theta[layout.log_shape()] = (priors.shape.shape / priors.shape.rate).ln();
    for k in 0..layout.n_random {
        theta[layout.log_sd(k)] = (0.5 * priors.random_sd.sd).ln();
    }
    theta
}

/// Welford accumulator for the proposal covariance.
struct RunningMoments {
    count: usize,
    mean: DVector<f64>,
    m2: DMatrix<f64>,
}

impl RunningMoments {
    fn new(d: usize) -> Self {
        Self {
            count: 0,
            mean: DVector::zeros(d),
            m2: DMatrix::zeros(d, d),
        }
    }

    fn push(&mut self, x: &[f64]) {
        self.count += 1;
        let x = DVector::from_column_slice(x);
        let delta = &x - &self.mean;
        self.mean += &delta / self.count as f64;
        let delta_after = &x - &self.mean;
        self.m2 += &delta * delta_after.transpose();
    }

    fn proposal_cholesky(&self) -> Option<DMatrix<f64>> {
        if self.count < 2 {
            return None;
        }
        let d = self.mean.len();
        let cov = &self.m2 / (self.count as f64 - 1.0) + DMatrix::<f64>::identity(d, d) * 1e-6;
        cov.cholesky().map(|c| c.l())
    }
}

/// Exact independent draws from the prior, stored on the unconstrained scale
/// so they flow through the same evaluation code as posterior draws.
pub fn draw_from_prior(
    frame: &ModelFrame,
    priors: &PriorTable,
    control: &SamplerControl,
) -> Result<PosteriorDraws, AppError> {
    validate_control(control)?;
    let layout = ParamLayout::for_frame(frame);
    let dist_err = |e: rand_distr::NormalError| AppError::input(format!("Invalid prior: {e}"));

    let intercept = Normal::new(priors.intercept.mean, priors.intercept.sd).map_err(dist_err)?;
    let betas = priors
        .coefficients
        .iter()
        .map(|c| Normal::new(c.prior.mean, c.prior.sd).map_err(dist_err))
        .collect::<Result<Vec<_>, _>>()?;
    let sd = Normal::new(0.0, priors.random_sd.sd).map_err(dist_err)?;
    let std_normal = Normal::new(0.0, 1.0).map_err(dist_err)?;
    let shape = Gamma::new(priors.shape.shape, 1.0 / priors.shape.rate)
        .map_err(|e| AppError::input(format!("Invalid shape prior: {e}")))?;

    let chains = (0..control.chains)
        .into_par_iter()
        .map(|chain| -> Result<ChainDraws, AppError> {
            let mut rng = StdRng::seed_from_u64(chain_seed(control.seed, chain, "prior"));
            let mut theta_draws = Vec::with_capacity(control.draws);
            for _ in 0..control.draws {
                let mut theta = vec![0.0; layout.len()];
                theta[layout.intercept()] = intercept.sample(&mut rng);
                for (j, b) in betas.iter().enumerate() {
                    theta[layout.beta(j)] = b.sample(&mut rng);
                }
                theta[layout.log_shape()] = shape.sample(&mut rng).max(f64::MIN_POSITIVE).ln();
                for k in 0..layout.n_random {
                    theta[layout.log_sd(k)] = sd.sample(&mut rng).abs().max(f64::MIN_POSITIVE).ln();
                }
                let cpcs = sample_lkj_cpcs(&mut rng, layout.n_random, priors.random_corr.eta)?;
                for (i, c) in cpcs.iter().enumerate() {
                    theta[layout.cpc_start() + i] = c.clamp(-1.0 + 1e-12, 1.0 - 1e-12).atanh();
                }
                for slot in theta.iter_mut().skip(layout.global_len()) {
                    *slot = std_normal.sample(&mut rng);
                }
                theta_draws.push(theta);
            }
            Ok(ChainDraws {
                theta: theta_draws,
                stats: ChainStats::default(),
            })
        })
        .collect::<Result<Vec<_>, AppError>>()?;

    Ok(PosteriorDraws {
        layout,
        chains,
        prior_only: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::{SyntheticConfig, generate_observations};
    use crate::models::{build_frame, model_ladder};

    fn small_control() -> SamplerControl {
        SamplerControl {
            chains: 2,
            warmup: 200,
            draws: 100,
            thin: 1,
            target_accept: 0.3,
            seed: 11,
        }
    }

    #[test]
    fn fit_returns_requested_draws() {
        let data = generate_observations(&SyntheticConfig::default()).unwrap();
        let spec = &model_ladder()[0];
        let frame = build_frame(&data.observations, spec).unwrap();
        let draws = AdaptiveMetropolis::default().fit(&frame, spec, &small_control()).unwrap();
        assert_eq!(draws.n_chains(), 2);
        assert_eq!(draws.draws_per_chain(), 100);
        assert!(!draws.prior_only);
        let stats = draws.stats();
        assert_eq!(stats.global_proposed, 200);
        assert_eq!(stats.centered_proposed, 200);
        assert!(stats.global_accept_rate() > 0.05);
        assert!(stats.centered_accept_rate() > 0.05);
        assert!(draws.params().iter().all(|p| p.shape > 0.0));
    }

    #[test]
    fn fit_is_reproducible_for_a_seed() {
        let data = generate_observations(&SyntheticConfig::default()).unwrap();
        let spec = &model_ladder()[0];
        let frame = build_frame(&data.observations, spec).unwrap();
        let control = SamplerControl {
            warmup: 50,
            draws: 20,
            ..small_control()
        };
        let a = AdaptiveMetropolis::default().fit(&frame, spec, &control).unwrap();
        let b = AdaptiveMetropolis::default().fit(&frame, spec, &control).unwrap();
        assert_eq!(a.chains[1].theta, b.chains[1].theta);
    }

    #[test]
    fn prior_draws_follow_prior_scales() {
        let data = generate_observations(&SyntheticConfig::default()).unwrap();
        let spec = &model_ladder()[0];
        let frame = build_frame(&data.observations, spec).unwrap();
        let control = SamplerControl {
            chains: 1,
            draws: 4000,
            ..small_control()
        };
        let draws = AdaptiveMetropolis::default().sample_prior_only(&frame, spec, &control).unwrap();
        assert!(draws.prior_only);
        let params = draws.params();
        let mean_time = params.iter().map(|p| p.beta[0]).sum::<f64>() / params.len() as f64;
        let mean_shape = params.iter().map(|p| p.shape).sum::<f64>() / params.len() as f64;
        assert!((mean_time - 1.0).abs() < 0.05);
        assert!((mean_shape - 20.0).abs() < 1.5);
    }

    #[test]
    fn invalid_control_is_an_input_error() {
        let control = SamplerControl {
            target_accept: 1.5,
            ..SamplerControl::default()
        };
        assert_eq!(validate_control(&control).unwrap_err().exit_code(), 2);
    }

    #[test]
    fn running_moments_recover_covariance() {
        let mut m = RunningMoments::new(2);
        for (a, b) in [(1.0, 2.0), (2.0, 4.0), (3.0, 6.5), (4.0, 7.5)] {
            m.push(&[a, b]);
        }
        let l = m.proposal_cholesky().unwrap();
        let cov = &l * l.transpose();
        assert!((cov[(0, 0)] - (5.0 / 3.0 + 1e-6)).abs() < 1e-9);
    }
}
