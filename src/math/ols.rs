//! Least squares on the empirical log rate.
//!
//! Chains start near a crude point estimate rather than at zero. We regress
//!
//! ```text
//! r_i = log((y_i + 0.5) / N_i)   on   [1, x_i]
//! ```
//!
//! which lands the intercept and time coefficients within a few posterior
//! standard deviations of the mode. The half count keeps zero days finite.

use nalgebra::{DMatrix, DVector};

/// Singular values below this fraction of the largest are treated as zero.
const RELATIVE_RANK_TOL: f64 = 1e-9;

/// Intercept followed by one coefficient per column of `x`.
///
/// Returns `None` for empty or mismatched inputs and when the solution is not
/// finite.
pub fn log_rate_regression(x: &DMatrix<f64>, counts: &[u64], population: &[f64]) -> Option<DVector<f64>> {
    let n = x.nrows();
    if n == 0 || counts.len() != n || population.len() != n {
        return None;
    }

    let design = DMatrix::from_fn(n, x.ncols() + 1, |i, j| if j == 0 { 1.0 } else { x[(i, j - 1)] });
    let target = DVector::from_fn(n, |i, _| ((counts[i] as f64 + 0.5) / population[i]).ln());
    if target.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let svd = design.svd(true, true);
    let largest = svd.singular_values.max();
    if !(largest.is_finite() && largest > 0.0) {
        return None;
    }
    // Near-collinear columns (time and time² over a short window) fall back
    // to the minimum-norm solution.
    let beta = svd.solve(&target, largest * RELATIVE_RANK_TOL).ok()?;
    beta.iter().all(|v| v.is_finite()).then_some(beta)
}
