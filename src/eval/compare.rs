//! Model comparison on pointwise LOO predictive density.
//!
//! Selection rule:
//! 1. rank models by their summed pointwise `elpd` over the observations
//!    every model shares (higher is better)
//! 2. any model whose difference to the top model is within `noise_se`
//!    standard errors of that difference is treated as tied with it
//! 3. among the tied models, choose the simplest (earliest in the ladder)
//!
//! With a common evaluation sample the shared observations are all of them.
//! When each model keeps its own complete cases the totals cover different
//! rows, so ranking on them would favour whichever model dropped the most.

use std::collections::HashMap;

use crate::domain::{ObservationKey, RankEntry};
use crate::error::AppError;
use crate::eval::loo::LooResult;
use crate::math::mean_var;

/// Default number of standard errors treated as noise.
pub const DEFAULT_NOISE_SE: f64 = 2.0;

/// Paired difference between two models.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    /// `Σ (elpd_a - elpd_b)` over matched observations.
    pub elpd_diff: f64,
    pub se_diff: f64,
    pub n_matched: usize,
    /// Observations present in only one of the two results.
    pub n_unmatched: usize,
}

/// A model's LOO result together with its ladder position.
#[derive(Debug, Clone)]
pub struct ModelLoo {
    pub name: String,
    pub complexity: usize,
    pub loo: LooResult,
}

fn pointwise_index(loo: &LooResult) -> HashMap<ObservationKey, f64> {
    loo.keys.iter().copied().zip(loo.pointwise_elpd.iter().copied()).collect()
}

/// Standard error of a summed paired difference.
fn paired_se(a: &[f64], b: &[f64]) -> f64 {
    let diffs: Vec<f64> = a.iter().zip(b).map(|(x, y)| x - y).collect();
    let (_, var) = mean_var(&diffs);
    (diffs.len() as f64 * var).sqrt()
}

/// Compare `a` against `b` observation by observation.
pub fn compare(a: &LooResult, b: &LooResult) -> Result<Comparison, AppError> {
    let index = pointwise_index(b);
    let (ea, eb): (Vec<f64>, Vec<f64>) = a
        .keys
        .iter()
        .zip(&a.pointwise_elpd)
        .filter_map(|(key, ea)| index.get(key).map(|eb| (*ea, *eb)))
        .unzip();

    let n = ea.len();
    if n == 0 {
        return Err(AppError::insufficient("The compared models share no observations."));
    }

    Ok(Comparison {
        elpd_diff: ea.iter().zip(&eb).map(|(x, y)| x - y).sum(),
        se_diff: paired_se(&ea, &eb),
        n_matched: n,
        n_unmatched: (a.keys.len() - n) + (b.keys.len() - n),
    })
}

/// Rank models on the observations they all share, each compared against
/// the top model. Every entry after the first has `elpd_diff <= 0`.
pub fn rank_models(models: &[ModelLoo]) -> Result<Vec<RankEntry>, AppError> {
    let Some(first) = models.first() else {
        return Err(AppError::insufficient("No models to rank."));
    };

    let indexes: Vec<HashMap<ObservationKey, f64>> = models.iter().map(|m| pointwise_index(&m.loo)).collect();
    let shared: Vec<ObservationKey> = first
        .loo
        .keys
        .iter()
        .filter(|key| indexes.iter().all(|index| index.contains_key(*key)))
        .copied()
        .collect();
    if shared.is_empty() {
        return Err(AppError::insufficient("The ranked models share no observations."));
    }
    for m in models {
        if m.loo.keys.len() > shared.len() {
            tracing::warn!(
                model = %m.name,
                rows = m.loo.keys.len(),
                shared = shared.len(),
                "ranking uses only the observations shared by every model"
            );
        }
    }

    let aligned: Vec<Vec<f64>> = indexes
        .iter()
        .map(|index| shared.iter().filter_map(|key| index.get(key).copied()).collect())
        .collect();
    let totals: Vec<f64> = aligned.iter().map(|v| v.iter().sum()).collect();

    let mut order: Vec<usize> = (0..models.len()).collect();
    order.sort_by(|&a, &b| {
        totals[b]
            .total_cmp(&totals[a])
            .then(models[a].complexity.cmp(&models[b].complexity))
    });
    let best = order[0];

    Ok(order
        .into_iter()
        .map(|i| {
            let m = &models[i];
            let (elpd_diff, se_diff) = if i == best {
                (0.0, 0.0)
            } else {
                (totals[i] - totals[best], paired_se(&aligned[i], &aligned[best]))
            };
            RankEntry {
                name: m.name.clone(),
                complexity: m.complexity,
                elpd_loo: m.loo.summary.elpd_loo,
                se_elpd_loo: m.loo.summary.se_elpd_loo,
                elpd_diff,
                se_diff,
                n_matched: shared.len(),
            }
        })
        .collect())
}

/// Apply the selection rule to a ranking (top model first).
pub fn choose_model(ranking: &[RankEntry], noise_se: f64) -> Option<&RankEntry> {
    let best = ranking.first()?;
    ranking
        .iter()
        .filter(|e| std::ptr::eq(*e, best) || -e.elpd_diff <= noise_se * e.se_diff)
        .min_by_key(|e| e.complexity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::loo::loo_from_log_lik;
    use chrono::NaiveDate;

    fn key(i: u32) -> ObservationKey {
        ObservationKey {
            fips: 26000 + i,
            date: NaiveDate::from_ymd_opt(2020, 6, 1).unwrap(),
        }
    }

    fn loo_with(pointwise: &[f64]) -> LooResult {
        let keys: Vec<ObservationKey> = (0..pointwise.len() as u32).map(key).collect();
        let ll: Vec<Vec<f64>> = pointwise.iter().map(|v| vec![*v; 100]).collect();
        loo_from_log_lik(&keys, &ll, 0.7).unwrap()
    }

    fn entry(name: &str, complexity: usize, elpd_diff: f64, se_diff: f64) -> RankEntry {
        RankEntry {
            name: name.to_string(),
            complexity,
            elpd_loo: -100.0 + elpd_diff,
            se_elpd_loo: 5.0,
            elpd_diff,
            se_diff,
            n_matched: 50,
        }
    }

    #[test]
    fn compare_is_antisymmetric() {
        let a = loo_with(&[-1.0, -2.0, -1.5, -3.0]);
        let b = loo_with(&[-1.2, -1.8, -2.5, -2.0]);
        let ab = compare(&a, &b).unwrap();
        let ba = compare(&b, &a).unwrap();
        assert!((ab.elpd_diff + ba.elpd_diff).abs() < 1e-12);
        assert!((ab.se_diff - ba.se_diff).abs() < 1e-12);
        assert_eq!(ab.n_matched, 4);
    }

    #[test]
    fn compare_matches_by_key() {
        let a = loo_with(&[-1.0, -2.0, -3.0]);
        let mut b = loo_with(&[-1.0, -2.0]);
        b.keys.reverse();
        b.pointwise_elpd.reverse();
        let c = compare(&a, &b).unwrap();
        assert_eq!(c.n_matched, 2);
        assert_eq!(c.n_unmatched, 1);
        assert!(c.elpd_diff.abs() < 1e-12);
    }

    #[test]
    fn ranking_puts_best_first_with_zero_difference() {
        let models = vec![
            ModelLoo {
                name: "time".into(),
                complexity: 0,
                loo: loo_with(&[-3.0, -3.0, -3.0]),
            },
            ModelLoo {
                name: "census".into(),
                complexity: 1,
                loo: loo_with(&[-1.0, -1.5, -1.0]),
            },
        ];
        let ranking = rank_models(&models).unwrap();
        assert_eq!(ranking[0].name, "census");
        assert_eq!(ranking[0].elpd_diff, 0.0);
        assert!(ranking[1].elpd_diff < 0.0);
    }

    fn loo_on(pointwise: &[(u32, f64)]) -> LooResult {
        let keys: Vec<ObservationKey> = pointwise.iter().map(|(i, _)| key(*i)).collect();
        let ll: Vec<Vec<f64>> = pointwise.iter().map(|(_, v)| vec![*v; 100]).collect();
        loo_from_log_lik(&keys, &ll, 0.7).unwrap()
    }

    #[test]
    fn ranking_ignores_rows_only_some_models_kept() {
        // The mobility model lost two rows; its raw total looks better but it
        // is worse on every row both models have.
        let time: Vec<(u32, f64)> = (0..6).map(|i| (i, -2.0)).collect();
        let mobility: Vec<(u32, f64)> = (2..6).map(|i| (i, -2.1 - 0.01 * f64::from(i))).collect();
        let models = vec![
            ModelLoo {
                name: "time".into(),
                complexity: 0,
                loo: loo_on(&time),
            },
            ModelLoo {
                name: "mobility".into(),
                complexity: 2,
                loo: loo_on(&mobility),
            },
        ];
        assert!(models[1].loo.summary.elpd_loo > models[0].loo.summary.elpd_loo);

        let ranking = rank_models(&models).unwrap();
        assert_eq!(ranking[0].name, "time");
        assert_eq!(ranking[0].elpd_diff, 0.0);
        assert!(ranking.iter().skip(1).all(|e| e.elpd_diff <= 0.0));
        assert!((ranking[1].elpd_diff + 0.54).abs() < 1e-6);
        assert!(ranking.iter().all(|e| e.n_matched == 4));
        assert!((ranking[1].elpd_loo - models[1].loo.summary.elpd_loo).abs() < 1e-12);
    }

    #[test]
    fn disjoint_models_cannot_be_ranked() {
        let models = vec![
            ModelLoo {
                name: "time".into(),
                complexity: 0,
                loo: loo_on(&[(0, -1.0), (1, -1.0)]),
            },
            ModelLoo {
                name: "census".into(),
                complexity: 1,
                loo: loo_on(&[(2, -1.0)]),
            },
        ];
        assert_eq!(rank_models(&models).unwrap_err().exit_code(), 3);
    }

    #[test]
    fn simpler_model_wins_within_noise() {
        let ranking = vec![entry("mobility", 2, 0.0, 0.0), entry("census", 1, -3.0, 2.0)];
        assert_eq!(choose_model(&ranking, DEFAULT_NOISE_SE).unwrap().name, "census");
    }

    #[test]
    fn clear_winner_is_kept() {
        let ranking = vec![entry("mobility", 2, 0.0, 0.0), entry("census", 1, -30.0, 5.0)];
        assert_eq!(choose_model(&ranking, DEFAULT_NOISE_SE).unwrap().name, "mobility");
        assert!(choose_model(&[], DEFAULT_NOISE_SE).is_none());
    }
}
