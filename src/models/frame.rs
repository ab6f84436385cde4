//! Model frames: complete-case design matrices for one specification.
//!
//! A frame keeps an observation only when every covariate it needs is present.
//! The set of needed covariates is the specification's own covariates plus an
//! optional extra set, which is how the pipeline harmonizes the evaluation
//! sample across compared models.

use std::collections::BTreeMap;

use nalgebra::DMatrix;

use crate::domain::{Covariate, ModelSpecification, Observation, ObservationKey};
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct ModelFrame {
    pub keys: Vec<ObservationKey>,
    pub y: Vec<u64>,
    /// `log(population)` offset.
    pub offset: Vec<f64>,
    pub population: Vec<f64>,
    pub t: Vec<u32>,
    /// Fixed-effect design, `n × p` (no intercept column).
    pub x: DMatrix<f64>,
    /// County-varying design, `n × K`; column 0 is the intercept.
    pub z: DMatrix<f64>,
    /// Column of `x` carrying the population-level coefficient of each column
    /// of `z`. `None` for the intercept.
    pub random_fixed: Vec<Option<usize>>,
    /// County index per row.
    pub group: Vec<usize>,
    /// FIPS code per county index.
    pub groups: Vec<u32>,
    /// Row indices per county index.
    pub group_rows: Vec<Vec<usize>>,
    /// Observations excluded for missing covariates.
    pub dropped_rows: usize,
}

impl ModelFrame {
    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn n_fixed(&self) -> usize {
        self.x.ncols()
    }

    pub fn n_random(&self) -> usize {
        self.z.ncols()
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }
}

/// Union of all covariates read by any of the specifications.
pub fn union_covariates(specs: &[ModelSpecification]) -> Vec<Covariate> {
    let mut out: Vec<Covariate> = Vec::new();
    for spec in specs {
        for c in spec.covariates() {
            if !out.contains(&c) {
                out.push(c);
            }
        }
    }
    out
}

/// Build the frame for `spec`, dropping rows with missing covariates.
pub fn build_frame(observations: &[Observation], spec: &ModelSpecification) -> Result<ModelFrame, AppError> {
    build_frame_with(observations, spec, &[])
}

/// Like [`build_frame`], additionally requiring the `also_required` covariates
/// to be present.
pub fn build_frame_with(
    observations: &[Observation],
    spec: &ModelSpecification,
    also_required: &[Covariate],
) -> Result<ModelFrame, AppError> {
    let mut required = spec.covariates();
    for c in also_required {
        if !required.contains(c) {
            required.push(*c);
        }
    }

    let kept: Vec<&Observation> = observations
        .iter()
        .filter(|o| required.iter().all(|&c| o.covariate(c).is_some_and(f64::is_finite)))
        .collect();
    let dropped_rows = observations.len() - kept.len();

    if kept.is_empty() {
        return Err(AppError::insufficient(format!(
            "No complete observations for model '{}' ({} dropped for missing covariates).",
            spec.name, dropped_rows
        )));
    }

    let n = kept.len();
    let p = spec.fixed.len();
    let k = spec.random_dim();
    let random_fixed: Vec<Option<usize>> = std::iter::once(None)
        .chain(spec.random.iter().map(|c| spec.fixed.iter().position(|f| f == c)))
        .collect();

    // County indices in FIPS order so frames built from the same rows agree.
    let mut index_of: BTreeMap<u32, usize> = BTreeMap::new();
    for o in &kept {
        index_of.entry(o.fips).or_insert(0);
    }
    for (i, v) in index_of.values_mut().enumerate() {
        *v = i;
    }
    let groups: Vec<u32> = index_of.keys().copied().collect();
    let mut group_rows = vec![Vec::new(); groups.len()];

    let mut x = DMatrix::<f64>::zeros(n, p);
    let mut z = DMatrix::<f64>::zeros(n, k);
    let mut keys = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    let mut offset = Vec::with_capacity(n);
    let mut population = Vec::with_capacity(n);
    let mut t = Vec::with_capacity(n);
    let mut group = Vec::with_capacity(n);

    for (row, o) in kept.iter().enumerate() {
        for (j, &c) in spec.fixed.iter().enumerate() {
            x[(row, j)] = o.covariate(c).unwrap_or(0.0);
        }
        z[(row, 0)] = 1.0;
        for (j, &c) in spec.random.iter().enumerate() {
            z[(row, j + 1)] = o.covariate(c).unwrap_or(0.0);
        }
        let g = index_of[&o.fips];
        group.push(g);
        group_rows[g].push(row);
        keys.push(o.key());
        y.push(o.new_cases);
        offset.push(o.log_population);
        population.push(o.population);
        t.push(o.t);
    }

    tracing::debug!(model = %spec.name, n, dropped_rows, counties = groups.len(), "model frame built");

    Ok(ModelFrame {
        keys,
        y,
        offset,
        population,
        t,
        x,
        z,
        random_fixed,
        group,
        groups,
        group_rows,
        dropped_rows,
    })
}
