//! Property-based tests for the data transform, the ladder and model comparison.

use chrono::{Duration, NaiveDate};
use county_growth::data::{TransformOptions, is_near_city, transform};
use county_growth::domain::{
    CaseRow, CountyAttributes, JoinedRow, MobilityKind, MobilityRecord, NEAR_CITY_FIPS, ObservationKey,
};
use county_growth::eval::{compare, loo_from_log_lik};
use county_growth::models::{build_frame, ensure_nested, is_nested, model_ladder};
use proptest::prelude::*;

fn joined(fips: u32, day: i64, cumulative: i64, mobility: bool) -> JoinedRow {
    let start = NaiveDate::from_ymd_opt(2020, 3, 1).unwrap();
    JoinedRow {
        case: CaseRow {
            date: start + Duration::days(day),
            county: format!("County {fips}"),
            state: "Michigan".to_string(),
            fips,
            cumulative_cases: cumulative,
            deaths: None,
        },
        attributes: CountyAttributes {
            population: Some(50_000.0),
            density: Some(300.0),
            elderly_pct: Some(17.0),
            metro: Some(true),
        },
        mobility: mobility.then(|| {
            MobilityKind::ALL
                .into_iter()
                .fold(MobilityRecord::default(), |m, k| m.with(k, -12.0))
        }),
    }
}

fn options() -> TransformOptions {
    TransformOptions {
        state: "Michigan".to_string(),
        high_risk_elderly_pct: 20.0,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_new_cases_never_negative(
        steps in prop::collection::vec(-50i64..200, 2..40),
    ) {
        // Property: daily counts are non-negative whatever the cumulative series does
        let mut cumulative = 10i64;
        let rows: Vec<JoinedRow> = steps
            .iter()
            .enumerate()
            .map(|(day, s)| {
                cumulative = (cumulative + s).max(2);
                joined(26125, day as i64, cumulative, true)
            })
            .collect();

        let dataset = transform(&rows, &options()).unwrap();
        prop_assert!(dataset.observations.iter().all(|o| o.population > 0.0));
        prop_assert!(dataset.observations.iter().all(|o| o.log_population.is_finite()));
        let negative_steps = rows.windows(2)
            .filter(|w| w[1].case.cumulative_cases < w[0].case.cumulative_cases)
            .count();
        prop_assert_eq!(dataset.stats.clamped_rows, negative_steps);
    }

    #[test]
    fn prop_near_city_only_for_listed_codes(fips in 1000u32..60000) {
        prop_assert_eq!(is_near_city(fips), NEAR_CITY_FIPS.contains(&fips));
    }

    #[test]
    fn prop_missing_mobility_rows_drop_only_from_mobility_models(
        has_mobility in prop::collection::vec(any::<bool>(), 5..30),
    ) {
        let rows: Vec<JoinedRow> = has_mobility
            .iter()
            .enumerate()
            .map(|(day, m)| joined(26049, day as i64, 10 + 5 * day as i64, *m))
            .collect();
        let dataset = transform(&rows, &options()).unwrap();
        let ladder = model_ladder();

        let time = build_frame(&dataset.observations, &ladder[0]).unwrap();
        prop_assert_eq!(time.n_obs(), has_mobility.len());

        let with_mobility = has_mobility.iter().filter(|m| **m).count();
        match build_frame(&dataset.observations, &ladder[2]) {
            Ok(frame) => prop_assert_eq!(frame.n_obs(), with_mobility),
            Err(err) => {
                prop_assert_eq!(with_mobility, 0);
                prop_assert_eq!(err.exit_code(), 3);
            }
        }
    }

    #[test]
    fn prop_compare_is_antisymmetric(
        values in prop::collection::vec((-8.0f64..-0.1, -8.0f64..-0.1), 2..40),
        jitter in 0.01f64..0.5,
    ) {
        let date = NaiveDate::from_ymd_opt(2020, 5, 1).unwrap();
        let keys: Vec<ObservationKey> = (0..values.len() as u32)
            .map(|i| ObservationKey { fips: 26000 + i, date })
            .collect();
        // Small spread across draws keeps every pointwise weight finite.
        let ll = |pick: fn(&(f64, f64)) -> f64| -> Vec<Vec<f64>> {
            values
                .iter()
                .map(|v| (0..50).map(|s| pick(v) + jitter * ((s % 5) as f64 - 2.0) / 2.0).collect())
                .collect()
        };
        let a = loo_from_log_lik(&keys, &ll(|v| v.0), 0.7).unwrap();
        let b = loo_from_log_lik(&keys, &ll(|v| v.1), 0.7).unwrap();

        let ab = compare(&a, &b).unwrap();
        let ba = compare(&b, &a).unwrap();
        prop_assert!((ab.elpd_diff + ba.elpd_diff).abs() < 1e-9);
        prop_assert!((ab.se_diff - ba.se_diff).abs() < 1e-9);
        prop_assert_eq!(ab.n_matched, values.len());
        prop_assert_eq!(ab.n_unmatched, 0);
    }
}

#[test]
fn ladder_is_strictly_nested() {
    let ladder = model_ladder();
    assert_eq!(ladder.len(), 5);
    ensure_nested(&ladder).unwrap();
    for pair in ladder.windows(2) {
        assert!(is_nested(&pair[0], &pair[1]));
        assert!(!is_nested(&pair[1], &pair[0]));
        assert!(pair[0].complexity < pair[1].complexity);
    }
}
