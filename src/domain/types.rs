//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during fitting
//! - exported to JSON/CSV
//! - reloaded later for reporting

use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Days per unit of the `time` covariate (months, roughly).
pub const TIME_SCALE_DAYS: f64 = 30.0;

/// Counties adjacent to the state's major urban center (Detroit metro).
pub const NEAR_CITY_FIPS: [u32; 7] = [26163, 26125, 26099, 26161, 26093, 26115, 26147];

/// Default state filter.
pub const DEFAULT_STATE: &str = "Michigan";

/// Elderly share (percent) at or above which a county is flagged high-risk.
pub const DEFAULT_HIGH_RISK_ELDERLY_PCT: f64 = 20.0;

/// Google-style mobility categories, as percent change from a pre-pandemic baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MobilityKind {
    RetailRecreation,
    GroceryPharmacy,
    Parks,
    TransitStations,
    Workplaces,
    Residential,
}

impl MobilityKind {
    pub const ALL: [MobilityKind; 6] = [
        MobilityKind::RetailRecreation,
        MobilityKind::GroceryPharmacy,
        MobilityKind::Parks,
        MobilityKind::TransitStations,
        MobilityKind::Workplaces,
        MobilityKind::Residential,
    ];

    /// Column header in the mobility report.
    pub fn column_name(self) -> &'static str {
        match self {
            MobilityKind::RetailRecreation => "retail_and_recreation_percent_change_from_baseline",
            MobilityKind::GroceryPharmacy => "grocery_and_pharmacy_percent_change_from_baseline",
            MobilityKind::Parks => "parks_percent_change_from_baseline",
            MobilityKind::TransitStations => "transit_stations_percent_change_from_baseline",
            MobilityKind::Workplaces => "workplaces_percent_change_from_baseline",
            MobilityKind::Residential => "residential_percent_change_from_baseline",
        }
    }

    /// Short label used in specifications, reports and exports.
    pub fn short_name(self) -> &'static str {
        match self {
            MobilityKind::RetailRecreation => "retail_recreation",
            MobilityKind::GroceryPharmacy => "grocery_pharmacy",
            MobilityKind::Parks => "parks",
            MobilityKind::TransitStations => "transit_stations",
            MobilityKind::Workplaces => "workplaces",
            MobilityKind::Residential => "residential",
        }
    }

    fn index(self) -> usize {
        match self {
            MobilityKind::RetailRecreation => 0,
            MobilityKind::GroceryPharmacy => 1,
            MobilityKind::Parks => 2,
            MobilityKind::TransitStations => 3,
            MobilityKind::Workplaces => 4,
            MobilityKind::Residential => 5,
        }
    }
}

/// Mobility figures for one county and date. Each category may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MobilityRecord {
    values: [Option<f64>; 6],
}

impl MobilityRecord {
    pub fn get(&self, kind: MobilityKind) -> Option<f64> {
        self.values[kind.index()]
    }

    pub fn set(&mut self, kind: MobilityKind, value: Option<f64>) {
        self.values[kind.index()] = value;
    }

    pub fn with(mut self, kind: MobilityKind, value: f64) -> Self {
        self.set(kind, Some(value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }
}

/// A raw row of the case-count table (cumulative counts).
#[derive(Debug, Clone)]
pub struct CaseRow {
    pub date: NaiveDate,
    pub county: String,
    pub state: String,
    pub fips: u32,
    pub cumulative_cases: i64,
    pub deaths: Option<i64>,
}

/// Static county attributes gathered from the lookup tables.
///
/// Every field is optional because the joins are left joins: a county missing
/// from a lookup table simply has no value here.
#[derive(Debug, Clone, Default)]
pub struct CountyAttributes {
    pub population: Option<f64>,
    pub density: Option<f64>,
    pub elderly_pct: Option<f64>,
    pub metro: Option<bool>,
}

/// One case row with everything joined onto it.
#[derive(Debug, Clone)]
pub struct JoinedRow {
    pub case: CaseRow,
    pub attributes: CountyAttributes,
    pub mobility: Option<MobilityRecord>,
}

/// Identity of an observation across model frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObservationKey {
    pub fips: u32,
    pub date: NaiveDate,
}

/// A county-day ready for modeling.
#[derive(Debug, Clone)]
pub struct Observation {
    pub fips: u32,
    pub county: String,
    pub date: NaiveDate,
    /// Days since the first retained date (state-level epidemic day).
    pub t: u32,
    pub new_cases: u64,
    pub population: f64,
    pub log_population: f64,
    pub log_density: Option<f64>,
    pub elderly_pct: Option<f64>,
    pub near_city: bool,
    pub high_risk: bool,
    pub mobility: MobilityRecord,
}

impl Observation {
    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            fips: self.fips,
            date: self.date,
        }
    }

    /// Numeric value of a covariate, or `None` when the source field is missing.
    pub fn covariate(&self, covariate: Covariate) -> Option<f64> {
        let time = f64::from(self.t) / TIME_SCALE_DAYS;
        match covariate {
            Covariate::Time => Some(time),
            Covariate::TimeSq => Some(time * time),
            Covariate::LogDensity => self.log_density,
            Covariate::Elderly => self.elderly_pct.map(|p| p / 10.0),
            Covariate::NearCity => Some(if self.near_city { 1.0 } else { 0.0 }),
            Covariate::HighRisk => Some(if self.high_risk { 1.0 } else { 0.0 }),
            Covariate::Mobility(kind) => self.mobility.get(kind).map(|p| p / 100.0),
        }
    }
}

/// Regression covariates available to a model specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Covariate {
    /// Elapsed epidemic time in months.
    Time,
    /// Square of `Time`.
    TimeSq,
    LogDensity,
    /// Elderly share, per 10 percentage points.
    Elderly,
    NearCity,
    HighRisk,
    /// Mobility change as a fraction of baseline.
    Mobility(MobilityKind),
}

impl Covariate {
    pub fn label(self) -> &'static str {
        match self {
            Covariate::Time => "time",
            Covariate::TimeSq => "time_sq",
            Covariate::LogDensity => "log_density",
            Covariate::Elderly => "elderly",
            Covariate::NearCity => "near_city",
            Covariate::HighRisk => "high_risk",
            Covariate::Mobility(kind) => kind.short_name(),
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        let fixed = match label.as_str() {
            "time" => Some(Covariate::Time),
            "time_sq" => Some(Covariate::TimeSq),
            "log_density" => Some(Covariate::LogDensity),
            "elderly" => Some(Covariate::Elderly),
            "near_city" => Some(Covariate::NearCity),
            "high_risk" => Some(Covariate::HighRisk),
            _ => None,
        };
        fixed.or_else(|| {
            MobilityKind::ALL
                .into_iter()
                .find(|k| k.short_name() == label)
                .map(Covariate::Mobility)
        })
    }

    pub fn is_mobility(self) -> bool {
        matches!(self, Covariate::Mobility(_))
    }
}

impl fmt::Display for Covariate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// `Normal(mean, sd)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalPrior {
    pub mean: f64,
    pub sd: f64,
}

/// Half-normal on `[0, ∞)` with scale `sd`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HalfNormalPrior {
    pub sd: f64,
}

/// LKJ prior on a correlation matrix with shape `eta`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LkjPrior {
    pub eta: f64,
}

/// `Gamma(shape, rate)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GammaPrior {
    pub shape: f64,
    pub rate: f64,
}

impl fmt::Display for NormalPrior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "normal({}, {})", self.mean, self.sd)
    }
}

impl fmt::Display for HalfNormalPrior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "half_normal(0, {})", self.sd)
    }
}

impl fmt::Display for LkjPrior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lkj({})", self.eta)
    }
}

impl fmt::Display for GammaPrior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gamma({}, {})", self.shape, self.rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoefficientPrior {
    pub covariate: Covariate,
    pub prior: NormalPrior,
}

/// Priors for every coefficient class of a specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorTable {
    pub intercept: NormalPrior,
    /// One entry per fixed covariate, in the specification's order.
    pub coefficients: Vec<CoefficientPrior>,
    pub random_sd: HalfNormalPrior,
    pub random_corr: LkjPrior,
    /// Negative-binomial shape (dispersion) parameter.
    pub shape: GammaPrior,
}

impl PriorTable {
    pub fn coefficient(&self, covariate: Covariate) -> Option<NormalPrior> {
        self.coefficients
            .iter()
            .find(|c| c.covariate == covariate)
            .map(|c| c.prior)
    }
}

/// A hierarchical negative-binomial regression specification.
///
/// The linear predictor is
/// `log mu = log(population) + intercept + Σ β_j x_j + b_county · (1, z…)`
/// where `z` are the county-varying covariates. The county intercept is always
/// present, so the random-effect dimension is `1 + random.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpecification {
    pub name: String,
    /// Position in the ladder (0 = simplest). Used to break near-ties.
    pub complexity: usize,
    pub fixed: Vec<Covariate>,
    pub random: Vec<Covariate>,
    pub priors: PriorTable,
}

impl ModelSpecification {
    pub fn random_dim(&self) -> usize {
        1 + self.random.len()
    }

    /// Every covariate the model reads, fixed first.
    pub fn covariates(&self) -> Vec<Covariate> {
        let mut out = self.fixed.clone();
        for c in &self.random {
            if !out.contains(c) {
                out.push(*c);
            }
        }
        out
    }

    pub fn uses_mobility(&self) -> bool {
        self.covariates().iter().any(|c| c.is_mobility())
    }

    /// Labels of the random-effect columns (`intercept` first).
    pub fn random_labels(&self) -> Vec<String> {
        std::iter::once("intercept".to_string())
            .chain(self.random.iter().map(|c| c.label().to_string()))
            .collect()
    }
}

/// How the evaluation sample is chosen across compared models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SampleMode {
    /// Fit every model on the complete cases of the union of all covariates.
    Common,
    /// Complete-case filtering per model; ranking uses the rows every model shares.
    PerModel,
}

/// Sampling controls passed to the fitting engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplerControl {
    pub chains: usize,
    pub warmup: usize,
    /// Kept draws per chain (after thinning).
    pub draws: usize,
    pub thin: usize,
    /// Target Metropolis acceptance rate. Higher values shrink proposals.
    pub target_accept: f64,
    pub seed: u64,
}

impl Default for SamplerControl {
    fn default() -> Self {
        Self {
            chains: 4,
            warmup: 1000,
            draws: 1000,
            thin: 1,
            target_accept: 0.3,
            seed: 42,
        }
    }
}

/// Input file locations.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub cases: PathBuf,
    pub population: PathBuf,
    pub census: PathBuf,
    pub metro: PathBuf,
    pub mobility: PathBuf,
}

/// A full run's configuration as understood by the pipeline.
///
/// This is derived from CLI flags (plus environment and defaults).
#[derive(Debug, Clone)]
pub struct FitConfig {
    pub paths: DataPaths,
    pub state: String,
    pub high_risk_elderly_pct: f64,
    /// Restrict the ladder to these model names (all when empty).
    pub models: Vec<String>,
    pub sample_mode: SampleMode,
    pub control: SamplerControl,
    /// Differences within this many standard errors count as noise.
    pub noise_se: f64,
    /// Pareto k above which an observation is flagged as influential.
    pub k_threshold: f64,
    pub top_n: usize,
    pub plot: bool,
    pub plot_width: usize,
    pub plot_height: usize,
    pub export_ranking: Option<PathBuf>,
    pub export_summary: Option<PathBuf>,
}

/// JSON has no encoding for non-finite floats (serde_json writes them as
/// `null`); read `null` back as NaN so saved summaries always reload.
fn nullable_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Posterior summary for one model parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub name: String,
    #[serde(deserialize_with = "nullable_f64")]
    pub mean: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub sd: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub q2_5: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub q97_5: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub rhat: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub ess: f64,
}

/// Sampler health for one fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerDiagnostics {
    pub chains: usize,
    pub draws_per_chain: usize,
    #[serde(deserialize_with = "nullable_f64")]
    pub max_rhat: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub min_ess: f64,
    /// Proposals whose log density was not finite (the sampler's analogue of
    /// divergent transitions).
    pub non_finite_proposals: usize,
    #[serde(deserialize_with = "nullable_f64")]
    pub global_accept_rate: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub centered_accept_rate: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub local_accept_rate: f64,
}

impl SamplerDiagnostics {
    pub fn converged(&self) -> bool {
        self.max_rhat.is_finite() && self.max_rhat <= 1.01 && self.non_finite_proposals == 0
    }
}

/// Approximate leave-one-out summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LooSummary {
    pub n_obs: usize,
    #[serde(deserialize_with = "nullable_f64")]
    pub elpd_loo: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub se_elpd_loo: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub p_loo: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub looic: f64,
    pub n_high_k: usize,
    #[serde(deserialize_with = "nullable_f64")]
    pub max_k: f64,
}

/// Posterior (or prior) predictive plausibility summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictiveSummary {
    /// Quantiles (min, 5%, 50%, 95%, max) of expected cases per capita.
    pub rate_quantiles: [f64; 5],
    /// Observations whose expected cases exceed the population.
    pub n_exceeding_population: usize,
    /// Fraction of replicated counts exceeding the population.
    pub replicate_exceed_fraction: f64,
    pub coverage_50: f64,
    pub coverage_90: f64,
}

/// Everything recorded about one fitted model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub complexity: usize,
    pub fixed: Vec<Covariate>,
    pub random: Vec<Covariate>,
    pub n_obs: usize,
    pub dropped_rows: usize,
    pub parameters: Vec<ParameterSummary>,
    pub diagnostics: SamplerDiagnostics,
    pub predictive: PredictiveSummary,
    pub loo: LooSummary,
}

/// One row of the model ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankEntry {
    pub name: String,
    pub complexity: usize,
    pub elpd_loo: f64,
    pub se_elpd_loo: f64,
    /// Difference to the top-ranked model (always `<= 0`).
    pub elpd_diff: f64,
    pub se_diff: f64,
    /// Observations matched between this model and the top model.
    pub n_matched: usize,
}

/// A saved analysis summary (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryFile {
    pub tool: String,
    pub state: String,
    pub date_range: (NaiveDate, NaiveDate),
    pub sample_mode: SampleMode,
    pub control: SamplerControl,
    pub noise_se: f64,
    pub k_threshold: f64,
    pub models: Vec<ModelSummary>,
    pub ranking: Vec<RankEntry>,
    pub chosen: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation() -> Observation {
        Observation {
            fips: 26163,
            county: "Wayne".to_string(),
            date: NaiveDate::from_ymd_opt(2020, 4, 1).unwrap(),
            t: 15,
            new_cases: 10,
            population: 1_750_000.0,
            log_population: 1_750_000f64.ln(),
            log_density: None,
            elderly_pct: Some(15.0),
            near_city: true,
            high_risk: false,
            mobility: MobilityRecord::default().with(MobilityKind::Residential, 20.0),
        }
    }

    #[test]
    fn covariate_encodings() {
        let obs = observation();
        assert!((obs.covariate(Covariate::Time).unwrap() - 0.5).abs() < 1e-12);
        assert!((obs.covariate(Covariate::TimeSq).unwrap() - 0.25).abs() < 1e-12);
        assert_eq!(obs.covariate(Covariate::NearCity), Some(1.0));
        assert!((obs.covariate(Covariate::Elderly).unwrap() - 1.5).abs() < 1e-12);
        assert_eq!(obs.covariate(Covariate::LogDensity), None);
        let res = obs.covariate(Covariate::Mobility(MobilityKind::Residential)).unwrap();
        assert!((res - 0.2).abs() < 1e-12);
        assert_eq!(obs.covariate(Covariate::Mobility(MobilityKind::Parks)), None);
    }

    #[test]
    fn covariate_labels_round_trip() {
        let all = [
            Covariate::Time,
            Covariate::TimeSq,
            Covariate::LogDensity,
            Covariate::Elderly,
            Covariate::NearCity,
            Covariate::HighRisk,
        ]
        .into_iter()
        .chain(MobilityKind::ALL.into_iter().map(Covariate::Mobility));
        for c in all {
            assert_eq!(Covariate::from_label(c.label()), Some(c));
        }
        assert_eq!(Covariate::from_label("bogus"), None);
    }
}
