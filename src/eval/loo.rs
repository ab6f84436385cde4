//! Pareto-smoothed importance-sampling leave-one-out (PSIS-LOO).
//!
//! For observation `i` the raw importance ratios over posterior draws are
//! `r_s = 1 / p(y_i | θ_s)`. The largest `M = ceil(min(0.2 S, 3 √S))` ratios
//! are replaced by expected order statistics of a generalized Pareto fit, then
//! the weights are truncated at the largest raw ratio and normalized:
//!
//! ```text
//! elpd_i = log Σ_s w_s p(y_i | θ_s)
//! ```
//!
//! The fitted shape `k` is the reliability diagnostic: above 0.7 the estimate
//! for that observation should not be trusted.

use rayon::prelude::*;

use crate::domain::{LooSummary, ObservationKey};
use crate::error::AppError;
use crate::math::{log_sum_exp, mean_var};
use crate::models::{ModelFrame, ModelParams, log_lik};

/// Conventional reliability threshold for Pareto `k`.
pub const DEFAULT_K_THRESHOLD: f64 = 0.7;

const MIN_TAIL_LEN: usize = 5;

#[derive(Debug, Clone)]
pub struct LooResult {
    pub keys: Vec<ObservationKey>,
    pub pointwise_elpd: Vec<f64>,
    pub pareto_k: Vec<f64>,
    pub summary: LooSummary,
    /// Observations with `k` above the threshold.
    pub high_k: Vec<ObservationKey>,
}

/// Pointwise log likelihood, one row of `S` draws per observation.
pub fn log_lik_matrix(frame: &ModelFrame, params: &[ModelParams]) -> Vec<Vec<f64>> {
    (0..frame.n_obs())
        .into_par_iter()
        .map(|i| params.iter().map(|p| log_lik(frame, i, p)).collect())
        .collect()
}

/// PSIS-LOO for a fitted frame.
pub fn psis_loo(frame: &ModelFrame, params: &[ModelParams], k_threshold: f64) -> Result<LooResult, AppError> {
    let ll = log_lik_matrix(frame, params);
    loo_from_log_lik(&frame.keys, &ll, k_threshold)
}

/// PSIS-LOO from a pointwise log-likelihood matrix (`keys.len()` rows).
pub fn loo_from_log_lik(keys: &[ObservationKey], ll: &[Vec<f64>], k_threshold: f64) -> Result<LooResult, AppError> {
    if ll.is_empty() || keys.len() != ll.len() {
        return Err(AppError::insufficient("No observations to evaluate."));
    }
    let s = ll[0].len();
    if s < 2 || ll.iter().any(|row| row.len() != s) {
        return Err(AppError::numeric("Log-likelihood matrix needs at least two draws per observation."));
    }
    if ll.iter().flatten().any(|v| !v.is_finite()) {
        return Err(AppError::numeric("Non-finite pointwise log likelihood."));
    }

    let pointwise: Vec<(f64, f64, f64)> = ll
        .par_iter()
        .map(|row| {
            let raw: Vec<f64> = row.iter().map(|v| -v).collect();
            let (lw, k) = psis_smooth(&raw);
            let weighted: Vec<f64> = lw.iter().zip(row).map(|(w, l)| w + l).collect();
            let elpd = log_sum_exp(&weighted);
            let lpd = log_sum_exp(row) - (s as f64).ln();
            (elpd, lpd, k)
        })
        .collect();

    let n = pointwise.len();
    let pointwise_elpd: Vec<f64> = pointwise.iter().map(|p| p.0).collect();
    let pareto_k: Vec<f64> = pointwise.iter().map(|p| p.2).collect();
    let elpd_loo: f64 = pointwise_elpd.iter().sum();
    let lpd: f64 = pointwise.iter().map(|p| p.1).sum();
    let (_, var) = mean_var(&pointwise_elpd);

    let high_k: Vec<ObservationKey> = keys
        .iter()
        .zip(&pareto_k)
        .filter(|(_, k)| **k > k_threshold)
        .map(|(key, _)| *key)
        .collect();
    let max_k = pareto_k.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    Ok(LooResult {
        keys: keys.to_vec(),
        summary: LooSummary {
            n_obs: n,
            elpd_loo,
            se_elpd_loo: (n as f64 * var).sqrt(),
            p_loo: lpd - elpd_loo,
            looic: -2.0 * elpd_loo,
            n_high_k: high_k.len(),
            max_k,
        },
        pointwise_elpd,
        pareto_k,
        high_k,
    })
}

/// Pareto-smooth log importance ratios.
///
/// Returns normalized log weights and the Pareto shape estimate. When the
/// tail is too short to fit, the weights are only truncated and normalized
/// and `k` is infinite.
pub fn psis_smooth(log_ratios: &[f64]) -> (Vec<f64>, f64) {
    let s = log_ratios.len();
    let max = log_ratios.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut lw: Vec<f64> = log_ratios.iter().map(|r| r - max).collect();

    let tail_len = (0.2 * s as f64).min(3.0 * (s as f64).sqrt()).ceil() as usize;
    let mut k = f64::INFINITY;

    if tail_len >= MIN_TAIL_LEN && tail_len < s {
        let mut order: Vec<usize> = (0..s).collect();
        order.sort_by(|&a, &b| lw[a].total_cmp(&lw[b]));
        let tail_ids = &order[s - tail_len..];
        let cutoff = lw[order[s - tail_len - 1]];
        let exp_cutoff = cutoff.exp();

        let excess: Vec<f64> = tail_ids.iter().map(|&i| lw[i].exp() - exp_cutoff).collect();
        if excess.last().is_some_and(|v| *v > 0.0) {
            let (shape, sigma) = gpd_fit(&excess);
            k = shape;
            if shape.is_finite() {
                for (rank, &i) in tail_ids.iter().enumerate() {
                    let p = (rank as f64 + 0.5) / tail_len as f64;
                    lw[i] = (gpd_quantile(p, shape, sigma) + exp_cutoff).ln();
                }
            }
        } else {
            // Flat tail: all ratios at the cutoff.
            k = 0.0;
        }
    }

    for v in lw.iter_mut() {
        *v = v.min(0.0);
    }
    let total = log_sum_exp(&lw);
    for v in lw.iter_mut() {
        *v -= total;
    }
    (lw, k)
}

/// Zhang–Stephens estimate of a generalized Pareto distribution for ascending
/// exceedances `x`, with the weakly informative shrinkage of `k` towards 0.5.
///
/// Returns `(k, sigma)`.
pub fn gpd_fit(x: &[f64]) -> (f64, f64) {
    const PRIOR: f64 = 3.0;
    const MIN_GRID_POINTS: usize = 30;

    let n = x.len();
    if n == 0 {
        return (f64::INFINITY, f64::NAN);
    }
    let nf = n as f64;
    let m = MIN_GRID_POINTS + nf.sqrt().floor() as usize;
    let quartile_idx = ((nf / 4.0 + 0.5).floor() as usize).clamp(1, n) - 1;
    let x_star = x[quartile_idx];
    let x_max = x[n - 1];

    let theta: Vec<f64> = (1..=m)
        .map(|j| 1.0 / x_max + (1.0 - (m as f64 / (j as f64 - 0.5)).sqrt()) / PRIOR / x_star)
        .collect();
    let profile: Vec<f64> = theta.iter().map(|&t| nf * profile_log_lik(t, x)).collect();
    let norm = log_sum_exp(&profile);
    let theta_hat: f64 = theta
        .iter()
        .zip(&profile)
        .map(|(t, l)| t * (l - norm).exp())
        .sum();

    let k = x.iter().map(|v| (-theta_hat * v).ln_1p()).sum::<f64>() / nf;
    let sigma = -k / theta_hat;
    let k = k * nf / (nf + 10.0) + 0.5 * 10.0 / (nf + 10.0);

    if k.is_nan() { (f64::INFINITY, sigma) } else { (k, sigma) }
}

fn profile_log_lik(theta: f64, x: &[f64]) -> f64 {
    let b = -theta;
    let k = x.iter().map(|v| (b * v).ln_1p()).sum::<f64>() / x.len() as f64;
    (b / k).ln() - k - 1.0
}

/// Quantile function of the generalized Pareto distribution (location 0).
pub fn gpd_quantile(p: f64, k: f64, sigma: f64) -> f64 {
    if k.abs() < 1e-12 {
        -sigma * (-p).ln_1p()
    } else {
        sigma * (-k * (-p).ln_1p()).exp_m1() / k
    }
}
