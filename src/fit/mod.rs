//! Posterior fitting.
//!
//! Responsibilities:
//!
//! - lay out and constrain the parameter vector (`params`)
//! - evaluate the log posterior with per-county caching (`density`)
//! - draw from the posterior or the prior (`sampler`)
//! - summarize draws and check convergence (`diagnostics`)

pub mod density;
pub mod diagnostics;
pub mod params;
pub mod sampler;

pub use diagnostics::*;
pub use params::{ParamLayout, summary_names, summary_values, unpack};
pub use sampler::*;
