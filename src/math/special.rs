//! Log densities and small numeric helpers.
//!
//! Everything here works on the log scale. The negative-binomial mean is passed
//! as `log_mu` because linear predictors can be large enough that `exp` would
//! overflow before the terms cancel.

use statrs::function::gamma::ln_gamma;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// `log(exp(a) + exp(b))` without overflow.
pub fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// `log Σ exp(x_i)`. Returns `-∞` for an empty slice.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Negative-binomial (mean/shape) log pmf: `var = mu + mu² / phi`.
pub fn neg_binomial_log_pmf(y: u64, log_mu: f64, phi: f64) -> f64 {
    neg_binomial_log_norm(y, phi) + neg_binomial_log_kernel(y, log_mu, phi)
}

/// The part of [`neg_binomial_log_pmf`] that does not depend on the mean.
pub fn neg_binomial_log_norm(y: u64, phi: f64) -> f64 {
    let yf = y as f64;
    ln_gamma(yf + phi) - ln_gamma(phi) - ln_gamma(yf + 1.0)
}

/// The mean-dependent part of [`neg_binomial_log_pmf`].
pub fn neg_binomial_log_kernel(y: u64, log_mu: f64, phi: f64) -> f64 {
    let log_phi = phi.ln();
    let log_denom = log_add_exp(log_phi, log_mu);
    phi * (log_phi - log_denom) + y as f64 * (log_mu - log_denom)
}

pub fn normal_log_pdf(x: f64, mean: f64, sd: f64) -> f64 {
    let z = (x - mean) / sd;
    -0.5 * z * z - sd.ln() - LN_SQRT_2PI
}

/// Half-normal log density on `x >= 0`.
pub fn half_normal_log_pdf(x: f64, sd: f64) -> f64 {
    if x < 0.0 {
        return f64::NEG_INFINITY;
    }
    std::f64::consts::LN_2 + normal_log_pdf(x, 0.0, sd)
}

/// `Gamma(shape, rate)` log density on `x > 0`.
pub fn gamma_log_pdf(x: f64, shape: f64, rate: f64) -> f64 {
    if x <= 0.0 {
        return f64::NEG_INFINITY;
    }
    shape * rate.ln() - ln_gamma(shape) + (shape - 1.0) * x.ln() - rate * x
}

/// Linear-interpolation quantile of an ascending slice.
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = p.clamp(0.0, 1.0) * (n as f64 - 1.0);
            let lo = h.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
        }
    }
}

/// Min, 5%, 50%, 95% and max of a sample.
pub fn sample_quantiles(values: &[f64]) -> [f64; 5] {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    [0.0, 0.05, 0.5, 0.95, 1.0].map(|p| quantile_sorted(&sorted, p))
}

/// Sample mean and (n − 1) variance.
pub fn mean_var(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    if n == 1 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    (mean, var)
}
