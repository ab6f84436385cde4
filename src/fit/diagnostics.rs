//! Convergence diagnostics and parameter summaries.
//!
//! - split R-hat: each chain is cut in half and the halves are compared as
//!   separate chains
//! - effective sample size: Geyer's initial monotone sequence on the
//!   multi-chain autocorrelation estimate

use rayon::prelude::*;

use crate::domain::{ModelSpecification, ParameterSummary, SamplerDiagnostics};
use crate::fit::params::{summary_names, summary_values, unpack};
use crate::fit::sampler::PosteriorDraws;
use crate::math::{mean_var, quantile_sorted};

/// Split R-hat over `chains` (each a sequence of draws of one scalar).
pub fn split_rhat(chains: &[Vec<f64>]) -> f64 {
    let halves = split_chains(chains);
    let m = halves.len();
    let n = halves.first().map_or(0, Vec::len);
    if m < 2 || n < 2 {
        return f64::NAN;
    }

    let stats: Vec<(f64, f64)> = halves.iter().map(|h| mean_var(h)).collect();
    let means: Vec<f64> = stats.iter().map(|s| s.0).collect();
    let w = stats.iter().map(|s| s.1).sum::<f64>() / m as f64;
    let (_, var_means) = mean_var(&means);
    let b = n as f64 * var_means;

    if w <= 0.0 {
        return if b <= 0.0 { 1.0 } else { f64::INFINITY };
    }
    let var_plus = (n as f64 - 1.0) / n as f64 * w + b / n as f64;
    (var_plus / w).sqrt()
}

/// Effective sample size of a scalar across chains.
pub fn effective_sample_size(chains: &[Vec<f64>]) -> f64 {
    let m = chains.len();
    let n = chains.iter().map(Vec::len).min().unwrap_or(0);
    if m == 0 || n < 4 {
        return f64::NAN;
    }
    let chains: Vec<&[f64]> = chains.iter().map(|c| &c[..n]).collect();

    let acov: Vec<Vec<f64>> = chains.iter().map(|c| autocovariance(c)).collect();
    let mean_acov = |lag: usize| acov.iter().map(|a| a[lag]).sum::<f64>() / m as f64;
    let means: Vec<f64> = chains.iter().map(|c| c.iter().sum::<f64>() / n as f64).collect();
    let var_between = if m > 1 { mean_var(&means).1 } else { 0.0 };

    let acov0 = mean_acov(0);
    let var_plus = acov0 * n as f64 / (n as f64 - 1.0) + var_between;
    if var_plus <= 0.0 {
        return (m * n) as f64;
    }
    let rho = |lag: usize| 1.0 - (acov0 - mean_acov(lag)) / var_plus;

    // Sum of positive, monotone pair sums.
    let mut tau = -1.0;
    let mut prev_pair = f64::INFINITY;
    let mut lag = 0;
    while lag + 1 < n {
        let pair = (rho(lag) + rho(lag + 1)).min(prev_pair);
        if pair <= 0.0 {
            break;
        }
        tau += 2.0 * pair;
        prev_pair = pair;
        lag += 2;
    }

    let total = (m * n) as f64;
    let ess = total / tau.max(1.0 / total.log10().max(1.0));
    ess.min(total * total.log10().max(1.0))
}

fn split_chains(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = chains.iter().map(Vec::len).min().unwrap_or(0);
    let half = n / 2;
    let mut out = Vec::with_capacity(chains.len() * 2);
    for c in chains {
        // Odd lengths drop the middle draw.
        out.push(c[..half].to_vec());
        out.push(c[n - half..n].to_vec());
    }
    out
}

/// Biased autocovariance for every lag.
fn autocovariance(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    let mean = x.iter().sum::<f64>() / n as f64;
    let centered: Vec<f64> = x.iter().map(|v| v - mean).collect();
    (0..n)
        .map(|lag| {
            centered[..n - lag]
                .iter()
                .zip(&centered[lag..])
                .map(|(a, b)| a * b)
                .sum::<f64>()
                / n as f64
        })
        .collect()
}

/// Per-parameter summaries (constrained scale) with R-hat and ESS.
pub fn summarize_parameters(draws: &PosteriorDraws, spec: &ModelSpecification) -> Vec<ParameterSummary> {
    let names = summary_names(spec);
    let n = draws.draws_per_chain();

    // values[chain][draw][param]
    let values: Vec<Vec<Vec<f64>>> = draws
        .chains
        .par_iter()
        .map(|c| {
            c.theta[..n]
                .iter()
                .map(|theta| summary_values(&unpack(&draws.layout, theta)))
                .collect()
        })
        .collect();

    names
        .into_par_iter()
        .enumerate()
        .map(|(j, name)| {
            let per_chain: Vec<Vec<f64>> = values.iter().map(|c| c.iter().map(|v| v[j]).collect()).collect();
            let mut pooled: Vec<f64> = per_chain.iter().flatten().copied().collect();
            let (mean, var) = mean_var(&pooled);
            pooled.sort_by(f64::total_cmp);
            ParameterSummary {
                name,
                mean,
                sd: var.sqrt(),
                q2_5: quantile_sorted(&pooled, 0.025),
                q97_5: quantile_sorted(&pooled, 0.975),
                rhat: split_rhat(&per_chain),
                ess: effective_sample_size(&per_chain),
            }
        })
        .collect()
}

/// Sampler health for a fit, from its draws and parameter summaries.
pub fn sampler_diagnostics(draws: &PosteriorDraws, parameters: &[ParameterSummary]) -> SamplerDiagnostics {
    let stats = draws.stats();
    let max_rhat = parameters
        .iter()
        .map(|p| if p.rhat.is_nan() { f64::INFINITY } else { p.rhat })
        .fold(f64::NEG_INFINITY, f64::max);
    let min_ess = parameters.iter().map(|p| p.ess).fold(f64::INFINITY, f64::min);
    SamplerDiagnostics {
        chains: draws.n_chains(),
        draws_per_chain: draws.draws_per_chain(),
        max_rhat,
        min_ess,
        non_finite_proposals: stats.non_finite,
        global_accept_rate: stats.global_accept_rate(),
        centered_accept_rate: stats.centered_accept_rate(),
        local_accept_rate: stats.local_accept_rate(),
    }
}
