//! Model evaluation for the hierarchical negative-binomial regression.
//!
//! The sampler, the evaluator and the synthetic-data generator rely on two
//! primitive operations:
//! - build per-county effects `b_g = diag(sd) · L · u_g` from standardized
//!   draws `u_g`
//! - compute the log mean `log mu_i` of one frame row
//!
//! These are implemented here as small, pure functions.

use nalgebra::DMatrix;

use crate::math::neg_binomial_log_pmf;
use crate::models::frame::ModelFrame;

/// Constrained parameter values for one posterior (or prior) draw.
#[derive(Debug, Clone)]
pub struct ModelParams {
    pub intercept: f64,
    pub beta: Vec<f64>,
    /// Negative-binomial shape `phi`.
    pub shape: f64,
    pub random_sd: Vec<f64>,
    /// Cholesky factor of the random-effect correlation.
    pub corr_chol: DMatrix<f64>,
    /// County effects, `G × K`.
    pub county_effects: DMatrix<f64>,
}

/// `b_g = diag(sd) · L · u_g` for every county row of `u` (`G × K`).
pub fn county_effects(sd: &[f64], corr_chol: &DMatrix<f64>, u: &DMatrix<f64>) -> DMatrix<f64> {
    let (g, k) = u.shape();
    let mut out = DMatrix::<f64>::zeros(g, k);
    let mut u_row = vec![0.0; k];
    let mut effect = vec![0.0; k];
    for row in 0..g {
        for (b, v) in u_row.iter_mut().enumerate() {
            *v = u[(row, b)];
        }
        county_effect(sd, corr_chol, &u_row, &mut effect);
        for (a, e) in effect.iter().enumerate() {
            out[(row, a)] = *e;
        }
    }
    out
}

/// Effect of a single county from its standardized draws.
pub fn county_effect(sd: &[f64], corr_chol: &DMatrix<f64>, u_row: &[f64], out: &mut [f64]) {
    for (a, slot) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (b, u) in u_row.iter().enumerate().take(a + 1) {
            acc += corr_chol[(a, b)] * u;
        }
        *slot = sd[a] * acc;
    }
}

/// Fixed part of the linear predictor for row `i` (offset + intercept + Xβ).
pub fn fixed_predictor(frame: &ModelFrame, i: usize, intercept: f64, beta: &[f64]) -> f64 {
    let mut eta = frame.offset[i] + intercept;
    for (j, b) in beta.iter().enumerate() {
        eta += frame.x[(i, j)] * b;
    }
    eta
}

/// County-varying part of the linear predictor for row `i`.
pub fn random_predictor(frame: &ModelFrame, i: usize, county_effects: &DMatrix<f64>) -> f64 {
    let g = frame.group[i];
    (0..frame.z.ncols()).map(|k| frame.z[(i, k)] * county_effects[(g, k)]).sum()
}

/// Like [`random_predictor`], for an explicit effect vector of row `i`'s county.
pub fn random_predictor_with(frame: &ModelFrame, i: usize, effect: &[f64]) -> f64 {
    effect.iter().enumerate().map(|(k, e)| frame.z[(i, k)] * e).sum()
}

/// `log mu_i` for row `i`.
pub fn log_mean(frame: &ModelFrame, i: usize, params: &ModelParams) -> f64 {
    fixed_predictor(frame, i, params.intercept, &params.beta) + random_predictor(frame, i, &params.county_effects)
}

/// Pointwise log likelihood of row `i`.
pub fn log_lik(frame: &ModelFrame, i: usize, params: &ModelParams) -> f64 {
    neg_binomial_log_pmf(frame.y[i], log_mean(frame, i, params), params.shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MobilityRecord, Observation};
    use crate::models::{build_frame, model_ladder};
    use chrono::NaiveDate;

    #[test]
    fn county_effects_apply_scale_and_correlation() {
        let l = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.6, 0.8]);
        let u = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        let b = county_effects(&[2.0, 0.5], &l, &u);
        assert!((b[(0, 0)] - 2.0).abs() < 1e-12);
        assert!((b[(0, 1)] - 0.5 * (0.6 + 1.6)).abs() < 1e-12);
    }

    #[test]
    fn log_mean_adds_offset_fixed_and_county_parts() {
        let observation = Observation {
            fips: 26163,
            county: "Wayne".to_string(),
            date: NaiveDate::from_ymd_opt(2020, 4, 1).unwrap(),
            t: 30,
            new_cases: 4,
            population: 1000.0,
            log_population: 1000f64.ln(),
            log_density: None,
            elderly_pct: None,
            near_city: true,
            high_risk: false,
            mobility: MobilityRecord::default(),
        };
        let frame = build_frame(&[observation], &model_ladder()[0]).unwrap();
        let params = ModelParams {
            intercept: -5.0,
            beta: vec![0.5, -0.25],
            shape: 10.0,
            random_sd: vec![1.0],
            corr_chol: DMatrix::identity(1, 1),
            county_effects: DMatrix::from_element(1, 1, 0.3),
        };
        let expected = 1000f64.ln() - 5.0 + 0.5 * 1.0 - 0.25 * 1.0 + 0.3;
        assert!((log_mean(&frame, 0, &params) - expected).abs() < 1e-12);
        assert!(log_lik(&frame, 0, &params) < 0.0);
    }
}
