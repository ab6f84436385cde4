//! Dataset preparation.
//!
//! - `features`: joined input rows → modeling observations
//! - `synthetic`: simulated counties with known parameters (calibration runs)

pub mod features;
pub mod synthetic;

pub use features::*;
pub use synthetic::*;
