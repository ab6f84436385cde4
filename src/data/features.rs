//! Feature derivation: joined rows → modeling observations.
//!
//! Steps, in order:
//!
//! 1. keep the target state
//! 2. difference cumulative counts into daily new cases per county, clamping
//!    negative corrections (reporting revisions) to zero
//! 3. keep rows with cumulative cases > 1, a known positive population, and a
//!    metropolitan flag
//! 4. derive elapsed epidemic day, log population, log density and flags
//!
//! Mobility is carried through untouched; missing mobility is handled per
//! model when the design matrix is built.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::domain::{JoinedRow, NEAR_CITY_FIPS, Observation};
use crate::error::AppError;

/// Filters applied by the transformer.
#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub state: String,
    pub high_risk_elderly_pct: f64,
}

/// What the transformer kept and changed.
#[derive(Debug, Clone)]
pub struct TransformStats {
    pub rows_in: usize,
    pub rows_in_state: usize,
    pub rows_out: usize,
    pub clamped_rows: usize,
    pub counties: usize,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    pub rows_with_mobility: usize,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub observations: Vec<Observation>,
    pub stats: TransformStats,
}

pub fn is_near_city(fips: u32) -> bool {
    NEAR_CITY_FIPS.contains(&fips)
}

/// Turn joined rows into observations for the target state.
pub fn transform(rows: &[JoinedRow], opts: &TransformOptions) -> Result<Dataset, AppError> {
    let target = opts.state.trim();

    // Group by county, ordered by date, so daily differences are well defined.
    let mut by_county: BTreeMap<u32, Vec<&JoinedRow>> = BTreeMap::new();
    let mut rows_in_state = 0usize;
    for row in rows {
        if !row.case.state.trim().eq_ignore_ascii_case(target) {
            continue;
        }
        rows_in_state += 1;
        by_county.entry(row.case.fips).or_default().push(row);
    }

    struct Kept<'a> {
        row: &'a JoinedRow,
        new_cases: u64,
        population: f64,
    }

    let mut kept: Vec<Kept<'_>> = Vec::new();
    let mut clamped_rows = 0usize;

    for county_rows in by_county.values_mut() {
        county_rows.sort_by_key(|r| r.case.date);

        let mut previous: Option<i64> = None;
        for &row in county_rows.iter() {
            let cumulative = row.case.cumulative_cases;
            let delta = match previous {
                Some(prev) => cumulative - prev,
                None => cumulative,
            };
            previous = Some(cumulative);

            let new_cases = if delta < 0 {
                clamped_rows += 1;
                0
            } else {
                delta as u64
            };

            if cumulative <= 1 {
                continue;
            }
            let Some(population) = row.attributes.population.filter(|p| p.is_finite() && *p > 0.0) else {
                continue;
            };
            if row.attributes.metro != Some(true) {
                continue;
            }

            kept.push(Kept {
                row,
                new_cases,
                population,
            });
        }
    }

    let Some(first_date) = kept.iter().map(|k| k.row.case.date).min() else {
        return Err(AppError::insufficient(format!(
            "No metropolitan county rows with cases > 1 and known population for state '{target}'."
        )));
    };
    let last_date = kept
        .iter()
        .map(|k| k.row.case.date)
        .max()
        .unwrap_or(first_date);

    let observations: Vec<Observation> = kept
        .iter()
        .map(|k| {
            let row = k.row;
            let elapsed = (row.case.date - first_date).num_days().max(0);
            let elderly_pct = row.attributes.elderly_pct;
            Observation {
                fips: row.case.fips,
                county: row.case.county.clone(),
                date: row.case.date,
                t: u32::try_from(elapsed).unwrap_or(u32::MAX),
                new_cases: k.new_cases,
                population: k.population,
                log_population: k.population.ln(),
                log_density: row.attributes.density.filter(|d| *d > 0.0).map(f64::ln),
                elderly_pct,
                near_city: is_near_city(row.case.fips),
                high_risk: elderly_pct.is_some_and(|p| p >= opts.high_risk_elderly_pct),
                mobility: row.mobility.unwrap_or_default(),
            }
        })
        .collect();

    let stats = TransformStats {
        rows_in: rows.len(),
        rows_in_state,
        rows_out: observations.len(),
        clamped_rows,
        counties: observations
            .iter()
            .map(|o| o.fips)
            .collect::<std::collections::BTreeSet<_>>()
            .len(),
        first_date,
        last_date,
        rows_with_mobility: observations.iter().filter(|o| !o.mobility.is_empty()).count(),
    };

    tracing::info!(
        rows_out = stats.rows_out,
        counties = stats.counties,
        clamped = stats.clamped_rows,
        "features derived"
    );

    Ok(Dataset {
        observations,
        stats,
    })
}
