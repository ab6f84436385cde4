//! Terminal reports for each subcommand.

pub mod format;

pub use format::*;
