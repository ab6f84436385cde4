//! Synthetic county case data with known parameters.
//!
//! Counts are drawn from the baseline model itself:
//!
//! ```text
//! y ~ NB(mu, phi),  log mu = log N + alpha + b_time · time + b_time_sq · time² + b_county
//! b_county ~ Normal(0, county_sd)
//! ```
//!
//! so a correctly working fit should cover the generating coefficients at
//! roughly the nominal rate of its credible intervals.
//!
//! Counties differ in density and elderly share, and can optionally carry
//! mobility series. Neither enters the counts, which gives the larger models
//! of the ladder something to fit without anything real to find.

use chrono::{Duration, NaiveDate};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;

use crate::domain::{MobilityKind, MobilityRecord, Observation, TIME_SCALE_DAYS};
use crate::error::AppError;
use crate::eval::replicate_count;

/// First FIPS code handed out; counties use consecutive odd codes from here.
const FIRST_FIPS: u32 = 26001;

/// Mixed into the seed of the mobility stream so counts do not depend on
/// whether mobility is generated.
const MOBILITY_STREAM: u64 = 0x6d6f_6269_6c69_7479;

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub counties: usize,
    pub days: usize,
    /// Population of the first county; later counties grow by half of it each.
    pub population: f64,
    pub intercept: f64,
    pub beta_time: f64,
    pub beta_time_sq: f64,
    pub shape: f64,
    pub county_sd: f64,
    pub start_date: NaiveDate,
    pub seed: u64,
    /// Attach retail, workplace and residential mobility to every day.
    pub with_mobility: bool,
    /// The last county has no mobility for this many leading days.
    pub missing_mobility_days: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            counties: 3,
            days: 30,
            population: 200_000.0,
            intercept: -9.0,
            beta_time: 1.0,
            beta_time_sq: -0.3,
            shape: 10.0,
            county_sd: 0.3,
            start_date: NaiveDate::from_ymd_opt(2020, 3, 15).unwrap_or(NaiveDate::MIN),
            seed: 7,
            with_mobility: false,
            missing_mobility_days: 0,
        }
    }
}

/// Generating parameters, county effects in FIPS order.
#[derive(Debug, Clone)]
pub struct SyntheticTruth {
    pub intercept: f64,
    /// `[time, time_sq]`.
    pub beta: Vec<f64>,
    pub shape: f64,
    pub county_sd: f64,
    pub county_intercepts: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct SyntheticData {
    pub observations: Vec<Observation>,
    pub truth: SyntheticTruth,
}

pub fn generate_observations(config: &SyntheticConfig) -> Result<SyntheticData, AppError> {
    if config.counties == 0 || config.days == 0 {
        return Err(AppError::input("Synthetic data needs at least one county and one day."));
    }
    if !(config.population.is_finite() && config.population > 0.0) {
        return Err(AppError::input("Synthetic population must be positive."));
    }
    if !(config.shape.is_finite() && config.shape > 0.0) {
        return Err(AppError::input("Synthetic shape must be positive."));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let county = Normal::new(0.0, config.county_sd)
        .map_err(|e| AppError::input(format!("Invalid county effect scale: {e}")))?;

    let county_intercepts: Vec<f64> = (0..config.counties).map(|_| county.sample(&mut rng)).collect();
    let mut mobility_rng = StdRng::seed_from_u64(config.seed ^ MOBILITY_STREAM);
    let noise = Normal::new(0.0, 4.0).map_err(|e| AppError::numeric(format!("Normal distribution error: {e}")))?;
    let mut observations = Vec::with_capacity(config.counties * config.days);

    for (c, b) in county_intercepts.iter().enumerate() {
        let fips = FIRST_FIPS + 2 * c as u32;
        let population = config.population * (1.0 + 0.5 * c as f64);
        let log_population = population.ln();

        for day in 0..config.days {
            let time = day as f64 / TIME_SCALE_DAYS;
            let log_mu = log_population
                + config.intercept
                + config.beta_time * time
                + config.beta_time_sq * time * time
                + b;
            let y = replicate_count(&mut rng, log_mu.exp(), config.shape)?;

            let gap = c + 1 == config.counties && day < config.missing_mobility_days;
            let mobility = if config.with_mobility && !gap {
                // Activity falls over the window and time at home rises.
                let drift = 30.0 * time / (1.0 + time);
                MobilityRecord::default()
                    .with(
                        MobilityKind::RetailRecreation,
                        -5.0 - 2.0 * c as f64 - drift + noise.sample(&mut mobility_rng),
                    )
                    .with(MobilityKind::Workplaces, -8.0 - drift + noise.sample(&mut mobility_rng))
                    .with(MobilityKind::Residential, 2.0 + 0.3 * drift + 0.5 * noise.sample(&mut mobility_rng))
            } else {
                MobilityRecord::default()
            };

            observations.push(Observation {
                fips,
                county: format!("Synthetic {}", c + 1),
                date: config.start_date + Duration::days(day as i64),
                t: day as u32,
                new_cases: y as u64,
                population,
                log_population,
                log_density: Some(4.0 + 0.4 * c as f64),
                elderly_pct: Some(14.0 + 1.5 * c as f64),
                near_city: false,
                high_risk: false,
                mobility,
            });
        }
    }

    Ok(SyntheticData {
        observations,
        truth: SyntheticTruth {
            intercept: config.intercept,
            beta: vec![config.beta_time, config.beta_time_sq],
            shape: config.shape,
            county_sd: config.county_sd,
            county_intercepts,
        },
    })
}
