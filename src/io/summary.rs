//! Read/write analysis summary JSON files.
//!
//! The schema is `domain::SummaryFile`: run metadata, one `ModelSummary` per
//! fitted model, the ranking and the chosen model name.

use std::fs::File;
use std::path::Path;

use crate::domain::SummaryFile;
use crate::error::AppError;

pub fn write_summary_json(path: &Path, summary: &SummaryFile) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::input(format!("Failed to create summary JSON '{}': {e}", path.display())))?;
    serde_json::to_writer_pretty(file, summary)
        .map_err(|e| AppError::input(format!("Failed to write summary JSON: {e}")))?;
    Ok(())
}

pub fn read_summary_json(path: &Path) -> Result<SummaryFile, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::input(format!("Failed to open summary JSON '{}': {e}", path.display())))?;
    let summary: SummaryFile =
        serde_json::from_reader(file).map_err(|e| AppError::input(format!("Invalid summary JSON: {e}")))?;
    Ok(summary)
}
