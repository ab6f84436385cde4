//! Model evaluation: predictive checks, PSIS-LOO and model comparison.

pub mod compare;
pub mod loo;
pub mod predictive;

pub use compare::*;
pub use loo::*;
pub use predictive::*;
