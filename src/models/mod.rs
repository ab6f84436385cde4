//! Hierarchical negative-binomial model definitions.
//!
//! - `spec`: the ladder of nested specifications and their priors
//! - `frame`: complete-case design matrices for one specification
//! - `model`: linear predictor and county effects given parameter values

pub mod frame;
pub mod model;
pub mod spec;

pub use frame::*;
pub use model::*;
pub use spec::*;
