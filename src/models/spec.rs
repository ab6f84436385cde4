//! The model ladder: five strictly nested specifications.
//!
//! | # | name                | fixed                                 | county-varying |
//! |---|---------------------|---------------------------------------|----------------|
//! | 1 | `time`              | time, time²                           | intercept      |
//! | 2 | `census`            | + log density, elderly, near city     | intercept      |
//! | 3 | `mobility`          | + retail, workplaces, residential     | intercept      |
//! | 4 | `county_mobility_1` | same as 3                             | + retail       |
//! | 5 | `county_mobility_3` | same as 3                             | + all three    |
//!
//! Priors on the quadratic time terms are deliberately informative: with a
//! flat prior the implied prior predictive regularly produces daily counts
//! larger than the county population. `time ~ normal(1, 0.5)` and
//! `time_sq ~ normal(-0.3, 0.2)` encode an epidemic curve that rises and then
//! turns over within a few months.

use crate::domain::{
    CoefficientPrior, Covariate, GammaPrior, HalfNormalPrior, LkjPrior, MobilityKind, ModelSpecification,
    NormalPrior, PriorTable,
};
use crate::error::AppError;

/// Mobility categories that enter the ladder.
pub const LADDER_MOBILITY: [MobilityKind; 3] = [
    MobilityKind::RetailRecreation,
    MobilityKind::Workplaces,
    MobilityKind::Residential,
];

const CENSUS: [Covariate; 3] = [Covariate::LogDensity, Covariate::Elderly, Covariate::NearCity];

/// Normal prior for a fixed-effect coefficient.
pub fn coefficient_prior(covariate: Covariate) -> NormalPrior {
    match covariate {
        Covariate::Time => NormalPrior { mean: 1.0, sd: 0.5 },
        Covariate::TimeSq => NormalPrior { mean: -0.3, sd: 0.2 },
        _ => NormalPrior { mean: 0.0, sd: 1.0 },
    }
}

/// Prior table for a set of fixed covariates.
pub fn default_priors(fixed: &[Covariate]) -> PriorTable {
    PriorTable {
        // Daily cases per capita around e^-9 (≈ 1 per 8,000 residents).
        intercept: NormalPrior { mean: -9.0, sd: 2.0 },
        coefficients: fixed
            .iter()
            .map(|&covariate| CoefficientPrior {
                covariate,
                prior: coefficient_prior(covariate),
            })
            .collect(),
        random_sd: HalfNormalPrior { sd: 1.0 },
        random_corr: LkjPrior { eta: 2.0 },
        shape: GammaPrior { shape: 2.0, rate: 0.1 },
    }
}

fn specification(name: &str, complexity: usize, fixed: Vec<Covariate>, random: Vec<Covariate>) -> ModelSpecification {
    let priors = default_priors(&fixed);
    ModelSpecification {
        name: name.to_string(),
        complexity,
        fixed,
        random,
        priors,
    }
}

/// The ordered ladder of candidate specifications.
pub fn model_ladder() -> Vec<ModelSpecification> {
    let time = vec![Covariate::Time, Covariate::TimeSq];
    let census: Vec<Covariate> = time.iter().copied().chain(CENSUS).collect();
    let mobility: Vec<Covariate> = census
        .iter()
        .copied()
        .chain(LADDER_MOBILITY.map(Covariate::Mobility))
        .collect();

    vec![
        specification("time", 0, time, Vec::new()),
        specification("census", 1, census, Vec::new()),
        specification("mobility", 2, mobility.clone(), Vec::new()),
        specification(
            "county_mobility_1",
            3,
            mobility.clone(),
            vec![Covariate::Mobility(MobilityKind::RetailRecreation)],
        ),
        specification(
            "county_mobility_3",
            4,
            mobility,
            LADDER_MOBILITY.map(Covariate::Mobility).to_vec(),
        ),
    ]
}

/// Whether every covariate of `inner` (fixed and county-varying) also appears
/// in `outer`.
pub fn is_nested(inner: &ModelSpecification, outer: &ModelSpecification) -> bool {
    inner.fixed.iter().all(|c| outer.fixed.contains(c)) && inner.random.iter().all(|c| outer.random.contains(c))
}

/// Check that each specification nests the previous one and adds something.
pub fn ensure_nested(ladder: &[ModelSpecification]) -> Result<(), AppError> {
    for pair in ladder.windows(2) {
        let (inner, outer) = (&pair[0], &pair[1]);
        let grows = outer.fixed.len() + outer.random.len() > inner.fixed.len() + inner.random.len();
        if !is_nested(inner, outer) || !grows {
            return Err(AppError::input(format!(
                "Model '{}' does not strictly extend '{}'.",
                outer.name, inner.name
            )));
        }
    }
    Ok(())
}

/// Pick ladder entries by name, preserving ladder order. Empty selects all.
pub fn select_models(ladder: &[ModelSpecification], names: &[String]) -> Result<Vec<ModelSpecification>, AppError> {
    if names.is_empty() {
        return Ok(ladder.to_vec());
    }
    for name in names {
        if !ladder.iter().any(|m| m.name == *name) {
            let known: Vec<&str> = ladder.iter().map(|m| m.name.as_str()).collect();
            return Err(AppError::input(format!(
                "Unknown model '{name}'. Known models: {}.",
                known.join(", ")
            )));
        }
    }
    Ok(ladder
        .iter()
        .filter(|m| names.contains(&m.name))
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_is_strictly_nested() {
        let ladder = model_ladder();
        assert_eq!(ladder.len(), 5);
        ensure_nested(&ladder).unwrap();
        for later in &ladder[1..] {
            assert!(is_nested(&ladder[0], later));
        }
    }

    #[test]
    fn ladder_complexity_follows_order() {
        let ladder = model_ladder();
        for (i, m) in ladder.iter().enumerate() {
            assert_eq!(m.complexity, i);
            assert_eq!(m.priors.coefficients.len(), m.fixed.len());
        }
        assert!(!ladder[1].uses_mobility());
        assert!(ladder[2].uses_mobility());
        assert_eq!(ladder[4].random_dim(), 4);
    }

    #[test]
    fn time_priors_encode_rise_then_fall() {
        let priors = default_priors(&[Covariate::Time, Covariate::TimeSq]);
        assert!(priors.coefficient(Covariate::Time).unwrap().mean > 0.0);
        assert!(priors.coefficient(Covariate::TimeSq).unwrap().mean < 0.0);
        assert_eq!(priors.random_corr.eta, 2.0);
    }

    #[test]
    fn ensure_nested_rejects_reordered_ladder() {
        let mut ladder = model_ladder();
        ladder.swap(0, 1);
        assert_eq!(ensure_nested(&ladder).unwrap_err().exit_code(), 2);
    }

    #[test]
    fn select_models_keeps_ladder_order() {
        let ladder = model_ladder();
        let picked = select_models(&ladder, &["mobility".to_string(), "time".to_string()]).unwrap();
        let names: Vec<&str> = picked.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["time", "mobility"]);
        assert!(select_models(&ladder, &["nope".to_string()]).is_err());
    }
}
