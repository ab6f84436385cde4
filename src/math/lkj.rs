//! Correlation matrices via canonical partial correlations (CPCs).
//!
//! A `K × K` correlation matrix is parameterized by its lower-triangular
//! Cholesky factor `L`, which in turn is built from `K(K-1)/2` CPCs in
//! `(-1, 1)`, ordered column by column (rows `1..K` of column 0, then rows
//! `2..K` of column 1, ...). For the sampler the CPCs come from unconstrained
//! reals via `tanh`.
//!
//! Row `i` of `L` is built left to right:
//!
//! ```text
//! L[i][j] = cpc(i, j) * sqrt(1 - Σ_{c<j} L[i][c]²)    (j < i)
//! L[i][i] = sqrt(1 - Σ_{c<i} L[i][c]²)
//! ```
//!
//! so every row has unit norm and `L Lᵀ` has a unit diagonal.

use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::{Beta, Distribution};

use crate::error::AppError;

/// Number of CPCs for a `k × k` correlation matrix.
pub fn cpc_len(k: usize) -> usize {
    k * k.saturating_sub(1) / 2
}

/// Build `L` from unconstrained values.
///
/// Returns the factor and the log absolute Jacobian of the map
/// `unconstrained → L` (the tanh step plus the row-norm scaling).
pub fn corr_cholesky_from_unconstrained(k: usize, raw: &[f64]) -> (DMatrix<f64>, f64) {
    let mut log_jac = 0.0;
    let cpcs: Vec<f64> = raw
        .iter()
        .map(|&y| {
            let z = y.tanh();
            // d tanh(y)/dy = 1 - tanh(y)^2; use a stable form for large |y|.
            log_jac += log1m_tanh_sq(y);
            z
        })
        .collect();
    let (l, scale_jac) = build_factor(k, &cpcs);
    (l, log_jac + scale_jac)
}

/// Build `L` directly from CPCs (no Jacobian needed by the caller).
pub fn corr_cholesky_from_cpcs(k: usize, cpcs: &[f64]) -> DMatrix<f64> {
    build_factor(k, cpcs).0
}

fn build_factor(k: usize, cpcs: &[f64]) -> (DMatrix<f64>, f64) {
    debug_assert_eq!(cpcs.len(), cpc_len(k));
    let mut l = DMatrix::<f64>::zeros(k, k);
    if k == 0 {
        return (l, 0.0);
    }

    // Remaining squared norm per row; starts at 1 for every row.
    let mut remaining = vec![1.0_f64; k];
    let mut log_jac = 0.0;
    let mut pos = 0usize;

    l[(0, 0)] = 1.0;
    for col in 0..k {
        if col > 0 {
            l[(col, col)] = remaining[col].max(0.0).sqrt();
        }
        for row in (col + 1)..k {
            let z = cpcs[pos];
            pos += 1;
            let scale = remaining[row].max(0.0).sqrt();
            if col > 0 {
                log_jac += 0.5 * remaining[row].max(f64::MIN_POSITIVE).ln();
            }
            l[(row, col)] = z * scale;
            remaining[row] *= 1.0 - z * z;
        }
    }

    (l, log_jac)
}

/// `log(1 - tanh(y)^2)` computed without cancellation for large `|y|`.
fn log1m_tanh_sq(y: f64) -> f64 {
    // 1 - tanh² = sech² = 4 / (e^{y} + e^{-y})²
    let a = y.abs();
    std::f64::consts::LN_2 * 2.0 - 2.0 * (a + (-2.0 * a).exp().ln_1p())
}

/// Unnormalized `LKJ(eta)` log density of a correlation Cholesky factor.
pub fn lkj_corr_cholesky_log_pdf(l: &DMatrix<f64>, eta: f64) -> f64 {
    let k = l.nrows();
    let mut out = 0.0;
    for i in 1..k {
        let power = (k - i - 1) as f64 + 2.0 * (eta - 1.0);
        out += power * l[(i, i)].ln();
    }
    out
}

/// Draw canonical partial correlations of an `LKJ(eta)` matrix (C-vine
/// construction), in the column order used by [`corr_cholesky_from_cpcs`].
pub fn sample_lkj_cpcs<R: Rng + ?Sized>(rng: &mut R, k: usize, eta: f64) -> Result<Vec<f64>, AppError> {
    if !(eta.is_finite() && eta > 0.0) {
        return Err(AppError::input(format!("LKJ shape must be positive, got {eta}.")));
    }
    let mut cpcs = Vec::with_capacity(cpc_len(k));
    let mut alpha = eta + 0.5 * (k as f64 - 1.0);
    for col in 0..k.saturating_sub(1) {
        alpha -= 0.5;
        let beta = Beta::new(alpha, alpha)
            .map_err(|e| AppError::numeric(format!("LKJ beta distribution error: {e}")))?;
        for _ in (col + 1)..k {
            cpcs.push(2.0 * beta.sample(rng) - 1.0);
        }
    }
    Ok(cpcs)
}

/// Correlation matrix `L Lᵀ`.
pub fn correlation_from_cholesky(l: &DMatrix<f64>) -> DMatrix<f64> {
    l * l.transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn factor_rows_have_unit_norm() {
        let raw = [0.3, -1.2, 2.0, 0.1, -0.4, 0.9];
        let (l, jac) = corr_cholesky_from_unconstrained(4, &raw);
        let corr = correlation_from_cholesky(&l);
        for i in 0..4 {
            assert!((corr[(i, i)] - 1.0).abs() < 1e-12);
            for j in 0..4 {
                assert!(corr[(i, j)].abs() <= 1.0 + 1e-12);
            }
        }
        assert!(jac.is_finite());
    }

    #[test]
    fn two_by_two_correlation_equals_cpc() {
        let l = corr_cholesky_from_cpcs(2, &[0.6]);
        let corr = correlation_from_cholesky(&l);
        assert!((corr[(0, 1)] - 0.6).abs() < 1e-12);
        assert!((l[(1, 1)] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn scalar_case_is_identity() {
        let (l, jac) = corr_cholesky_from_unconstrained(1, &[]);
        assert_eq!(l[(0, 0)], 1.0);
        assert_eq!(jac, 0.0);
        assert_eq!(lkj_corr_cholesky_log_pdf(&l, 2.0), 0.0);
    }

    #[test]
    fn log1m_tanh_sq_matches_direct_form() {
        for y in [-3.0_f64, -0.5, 0.0, 0.7, 2.5] {
            let direct = (1.0 - y.tanh().powi(2)).ln();
            assert!((log1m_tanh_sq(y) - direct).abs() < 1e-10);
        }
        assert!(log1m_tanh_sq(400.0).is_finite());
    }

    #[test]
    fn lkj_draws_are_valid_and_centered() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut sum = 0.0;
        let n = 2000;
        for _ in 0..n {
            let cpcs = sample_lkj_cpcs(&mut rng, 3, 2.0).unwrap();
            let l = corr_cholesky_from_cpcs(3, &cpcs);
            let corr = correlation_from_cholesky(&l);
            for i in 0..3 {
                assert!((corr[(i, i)] - 1.0).abs() < 1e-12);
            }
            sum += corr[(2, 1)];
        }
        // LKJ is symmetric around zero off the diagonal.
        assert!((sum / n as f64).abs() < 0.05);
    }
}
