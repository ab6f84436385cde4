//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - raw and joined input rows (`CaseRow`, `JoinedRow`, `MobilityRecord`)
//! - modeling observations and covariates (`Observation`, `Covariate`)
//! - model specifications and priors (`ModelSpecification`, `PriorTable`)
//! - run configuration and serializable summaries (`FitConfig`, `SummaryFile`)

pub mod types;

pub use types::*;
