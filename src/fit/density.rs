//! Log posterior density with per-row caching.
//!
//! A full evaluation touches every row. A move of one standardized county
//! coordinate `u[g][k]` only changes county `g`'s effect, so
//! [`LogDensity::propose_local`] re-evaluates just that county's rows and
//! returns the density difference.
//!
//! [`LogDensity::recenter`] supports the sampler's second global move, which
//! changes the global block while holding every county's total coefficients
//! (population-level plus county effect, taken at the county's mean
//! covariates) where they are. That move walks along the ridges between the
//! intercept and the summed county intercepts and between each `sd` and its
//! column of `u`.

use nalgebra::DMatrix;

use crate::domain::PriorTable;
use crate::fit::params::{GlobalParams, ParamLayout, global_log_prior, u_log_prior, unpack_global, unpack_u};
use crate::math::{neg_binomial_log_kernel, neg_binomial_log_norm};
use crate::models::{ModelFrame, county_effect, county_effects, fixed_predictor, random_predictor_with};

pub struct LogDensity<'a> {
    pub frame: &'a ModelFrame,
    pub priors: &'a PriorTable,
    pub layout: ParamLayout,
    /// Mean of each fixed-effect column over each county's rows, `G × p`.
    county_means: DMatrix<f64>,
}

/// Current point of a chain with cached pieces of its density.
#[derive(Debug, Clone)]
pub struct DensityState {
    pub theta: Vec<f64>,
    pub log_density: f64,
    global: GlobalParams,
    effects: DMatrix<f64>,
    fixed_eta: Vec<f64>,
    row_norm: Vec<f64>,
    row_ll: Vec<f64>,
}

/// A candidate value for one `u` coordinate.
#[derive(Debug, Clone)]
pub struct LocalProposal {
    pub value: f64,
    /// Change in log density if accepted.
    pub delta: f64,
    effect: Vec<f64>,
    row_ll: Vec<f64>,
}

impl<'a> LogDensity<'a> {
    pub fn new(frame: &'a ModelFrame, priors: &'a PriorTable) -> Self {
        let p = frame.n_fixed();
        let mut county_means = DMatrix::<f64>::zeros(frame.n_groups(), p);
        for (g, rows) in frame.group_rows.iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            for j in 0..p {
                county_means[(g, j)] = rows.iter().map(|&i| frame.x[(i, j)]).sum::<f64>() / rows.len() as f64;
            }
        }
        Self {
            frame,
            priors,
            layout: ParamLayout::for_frame(frame),
            county_means,
        }
    }

    /// Evaluate from scratch. `None` when the density is not finite.
    pub fn evaluate(&self, theta: Vec<f64>) -> Option<DensityState> {
        let layout = &self.layout;
        let global = unpack_global(layout, &theta);
        let global_lp = global_log_prior(self.priors, &global);
        if !global_lp.is_finite() {
            return None;
        }

        let u = unpack_u(layout, &theta);
        let u_lp: f64 = u.iter().map(|v| u_log_prior(*v)).sum();
        let effects = county_effects(&global.random_sd, &global.corr_chol, &u);

        let n = self.frame.n_obs();
        let mut fixed_eta = Vec::with_capacity(n);
        let mut row_norm = Vec::with_capacity(n);
        let mut row_ll = Vec::with_capacity(n);
        let mut effect = vec![0.0; layout.n_random];
        for i in 0..n {
            let eta = fixed_predictor(self.frame, i, global.intercept, &global.beta);
            let g = self.frame.group[i];
            for (k, e) in effect.iter_mut().enumerate() {
                *e = effects[(g, k)];
            }
            let y = self.frame.y[i];
            let norm = neg_binomial_log_norm(y, global.shape);
            let ll = norm + neg_binomial_log_kernel(y, eta + random_predictor_with(self.frame, i, &effect), global.shape);
            fixed_eta.push(eta);
            row_norm.push(norm);
            row_ll.push(ll);
        }

        let log_density = global_lp + u_lp + row_ll.iter().sum::<f64>();
        if !log_density.is_finite() {
            return None;
        }

        Some(DensityState {
            theta,
            log_density,
            global,
            effects,
            fixed_eta,
            row_norm,
            row_ll,
        })
    }

    /// Density change from setting `u[group][k] = value`, holding everything
    /// else fixed. `None` when the result is not finite.
    pub fn propose_local(&self, state: &DensityState, group: usize, k: usize, value: f64) -> Option<LocalProposal> {
        let layout = &self.layout;
        let start = layout.u(group, 0);
        let mut u_row = state.theta[start..start + layout.n_random].to_vec();
        let old = u_row[k];
        u_row[k] = value;

        let mut effect = vec![0.0; layout.n_random];
        county_effect(&state.global.random_sd, &state.global.corr_chol, &u_row, &mut effect);

        let mut delta = u_log_prior(value) - u_log_prior(old);
        let rows = &self.frame.group_rows[group];
        let mut row_ll = Vec::with_capacity(rows.len());
        for &i in rows {
            let eta = state.fixed_eta[i] + random_predictor_with(self.frame, i, &effect);
            let ll = state.row_norm[i] + neg_binomial_log_kernel(self.frame.y[i], eta, state.global.shape);
            delta += ll - state.row_ll[i];
            row_ll.push(ll);
        }

        delta.is_finite().then_some(LocalProposal {
            value,
            delta,
            effect,
            row_ll,
        })
    }

    /// Point with the global block set to `global_theta` and every `u_g`
    /// solved so that each county keeps its total coefficients, plus the log
    /// Jacobian of that map.
    ///
    /// For county `g` the intercept total is taken at the county's mean
    /// covariates, so a change in a coefficient without a county-varying
    /// partner moves the county intercept the other way. Coefficients with a
    /// partner keep `β_j + b_g[k]` fixed instead. The map is a per-county
    /// affine change of `u`, so the Jacobian only depends on the scales and
    /// the diagonal of the correlation factor.
    pub fn recenter(&self, state: &DensityState, global_theta: &[f64]) -> Option<(Vec<f64>, f64)> {
        let layout = &self.layout;
        let k_dim = layout.n_random;
        let old = &state.global;
        let next = unpack_global(layout, global_theta);

        let mut coef_shift = vec![0.0; k_dim];
        coef_shift[0] = old.intercept - next.intercept;
        let mut level_beta: Vec<f64> = old.beta.iter().zip(&next.beta).map(|(a, b)| a - b).collect();
        for (k, partner) in self.frame.random_fixed.iter().enumerate() {
            if let Some(j) = *partner {
                coef_shift[k] = level_beta[j];
                level_beta[j] = 0.0;
            }
        }

        let mut theta = Vec::with_capacity(layout.len());
        theta.extend_from_slice(global_theta);
        let mut target = vec![0.0; k_dim];
        for g in 0..layout.n_groups {
            for (k, t) in target.iter_mut().enumerate() {
                *t = state.effects[(g, k)] + coef_shift[k];
            }
            target[0] += level_beta
                .iter()
                .enumerate()
                .map(|(j, d)| self.county_means[(g, j)] * d)
                .sum::<f64>();

            // diag(sd) · L · u_g = target, L lower triangular
            let start = theta.len();
            for a in 0..k_dim {
                let mut acc = target[a] / next.random_sd[a];
                for b in 0..a {
                    acc -= next.corr_chol[(a, b)] * theta[start + b];
                }
                theta.push(acc / next.corr_chol[(a, a)]);
            }
        }

        let log_scale = |t: &[f64], l: &DMatrix<f64>| -> f64 {
            (0..k_dim).map(|k| t[layout.log_sd(k)] + l[(k, k)].ln()).sum()
        };
        let log_jacobian = -(layout.n_groups as f64)
            * (log_scale(global_theta, &next.corr_chol) - log_scale(&state.theta, &old.corr_chol));

        (log_jacobian.is_finite() && theta.iter().all(|v| v.is_finite())).then_some((theta, log_jacobian))
    }

    pub fn accept_local(&self, state: &mut DensityState, group: usize, k: usize, proposal: LocalProposal) {
        state.theta[self.layout.u(group, k)] = proposal.value;
        for (a, e) in proposal.effect.iter().enumerate() {
            state.effects[(group, a)] = *e;
        }
        for (&i, ll) in self.frame.group_rows[group].iter().zip(proposal.row_ll) {
            state.row_ll[i] = ll;
        }
        state.log_density += proposal.delta;
    }
}
