//! Mathematical utilities: special functions, correlation-matrix transforms,
//! and least squares.

pub mod lkj;
pub mod ols;
pub mod special;

pub use lkj::*;
pub use ols::*;
pub use special::*;
