//! Unconstrained parameter vector layout.
//!
//! The sampler moves on `R^d`. Positions in the vector are:
//!
//! ```text
//! [ intercept | β (p) | log φ | log sd (K) | atanh-CPC (K(K-1)/2) | u (G × K, row-major) ]
//! ```
//!
//! Everything before `u` is the "global" block, proposed jointly. The `u`
//! block holds the standardized county effects, updated one coordinate at a
//! time because each coordinate only touches one county's rows.

use nalgebra::DMatrix;

use crate::domain::{ModelSpecification, PriorTable};
use crate::math::{
    corr_cholesky_from_unconstrained, correlation_from_cholesky, cpc_len, gamma_log_pdf, half_normal_log_pdf,
    lkj_corr_cholesky_log_pdf, normal_log_pdf,
};
use crate::models::{ModelFrame, ModelParams, county_effects};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamLayout {
    pub n_fixed: usize,
    pub n_random: usize,
    pub n_groups: usize,
}

impl ParamLayout {
    pub fn new(n_fixed: usize, n_random: usize, n_groups: usize) -> Self {
        Self {
            n_fixed,
            n_random,
            n_groups,
        }
    }

    pub fn for_frame(frame: &ModelFrame) -> Self {
        Self::new(frame.n_fixed(), frame.n_random(), frame.n_groups())
    }

    pub fn intercept(&self) -> usize {
        0
    }

    pub fn beta(&self, j: usize) -> usize {
        1 + j
    }

    pub fn log_shape(&self) -> usize {
        1 + self.n_fixed
    }

    pub fn log_sd(&self, k: usize) -> usize {
        2 + self.n_fixed + k
    }

    pub fn cpc_start(&self) -> usize {
        2 + self.n_fixed + self.n_random
    }

    pub fn n_cpc(&self) -> usize {
        cpc_len(self.n_random)
    }

    /// Length of the jointly proposed block.
    pub fn global_len(&self) -> usize {
        self.cpc_start() + self.n_cpc()
    }

    pub fn u(&self, group: usize, k: usize) -> usize {
        self.global_len() + group * self.n_random + k
    }

    pub fn len(&self) -> usize {
        self.global_len() + self.n_groups * self.n_random
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Global parameters on the constrained scale plus the log Jacobian of the
/// transform.
#[derive(Debug, Clone)]
pub struct GlobalParams {
    pub intercept: f64,
    pub beta: Vec<f64>,
    pub shape: f64,
    pub random_sd: Vec<f64>,
    pub corr_chol: DMatrix<f64>,
    pub log_jacobian: f64,
}

pub fn unpack_global(layout: &ParamLayout, theta: &[f64]) -> GlobalParams {
    let beta = (0..layout.n_fixed).map(|j| theta[layout.beta(j)]).collect();
    let log_shape = theta[layout.log_shape()];
    let log_sd: Vec<f64> = (0..layout.n_random).map(|k| theta[layout.log_sd(k)]).collect();
    let start = layout.cpc_start();
    let (corr_chol, corr_jac) = corr_cholesky_from_unconstrained(layout.n_random, &theta[start..start + layout.n_cpc()]);

    GlobalParams {
        intercept: theta[layout.intercept()],
        beta,
        shape: log_shape.exp(),
        random_sd: log_sd.iter().map(|v| v.exp()).collect(),
        corr_chol,
        log_jacobian: log_shape + log_sd.iter().sum::<f64>() + corr_jac,
    }
}

/// Standardized county effects `u` as a `G × K` matrix.
pub fn unpack_u(layout: &ParamLayout, theta: &[f64]) -> DMatrix<f64> {
    let start = layout.global_len();
    DMatrix::from_row_slice(layout.n_groups, layout.n_random, &theta[start..layout.len()])
}

/// Full constrained parameters for one draw.
pub fn unpack(layout: &ParamLayout, theta: &[f64]) -> ModelParams {
    let global = unpack_global(layout, theta);
    let u = unpack_u(layout, theta);
    let effects = county_effects(&global.random_sd, &global.corr_chol, &u);
    ModelParams {
        intercept: global.intercept,
        beta: global.beta,
        shape: global.shape,
        random_sd: global.random_sd,
        corr_chol: global.corr_chol,
        county_effects: effects,
    }
}

/// Log prior of the global block on the unconstrained scale (Jacobian
/// included).
pub fn global_log_prior(priors: &PriorTable, global: &GlobalParams) -> f64 {
    let mut lp = normal_log_pdf(global.intercept, priors.intercept.mean, priors.intercept.sd);
    for (b, c) in global.beta.iter().zip(&priors.coefficients) {
        lp += normal_log_pdf(*b, c.prior.mean, c.prior.sd);
    }
    lp += gamma_log_pdf(global.shape, priors.shape.shape, priors.shape.rate);
    for sd in &global.random_sd {
        lp += half_normal_log_pdf(*sd, priors.random_sd.sd);
    }
    lp += lkj_corr_cholesky_log_pdf(&global.corr_chol, priors.random_corr.eta);
    lp + global.log_jacobian
}

/// Standard normal log density of one `u` coordinate, without the constant.
pub fn u_log_prior(u: f64) -> f64 {
    -0.5 * u * u
}

/// Names of the summarized (constrained) parameters, in the order produced by
/// [`summary_values`].
pub fn summary_names(spec: &ModelSpecification) -> Vec<String> {
    let mut names = vec!["intercept".to_string()];
    names.extend(spec.fixed.iter().map(|c| format!("b_{}", c.label())));
    names.push("shape".to_string());
    let labels = spec.random_labels();
    names.extend(labels.iter().map(|l| format!("sd_county__{l}")));
    for a in 0..labels.len() {
        for b in (a + 1)..labels.len() {
            names.push(format!("cor_county__{}__{}", labels[a], labels[b]));
        }
    }
    names
}

/// Constrained values matching [`summary_names`].
pub fn summary_values(params: &ModelParams) -> Vec<f64> {
    let mut out = Vec::with_capacity(2 + params.beta.len() + params.random_sd.len() * 2);
    out.push(params.intercept);
    out.extend_from_slice(&params.beta);
    out.push(params.shape);
    out.extend_from_slice(&params.random_sd);
    let corr = correlation_from_cholesky(&params.corr_chol);
    let k = corr.nrows();
    for a in 0..k {
        for b in (a + 1)..k {
            out.push(corr[(a, b)]);
        }
    }
    out
}
