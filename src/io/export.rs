//! CSV exports: the derived dataset and the model ranking.
//!
//! Both are plain tables meant for spreadsheets or downstream scripts.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::domain::{MobilityKind, Observation, RankEntry};
use crate::error::AppError;

/// Write the derived observations, one row per county-day.
///
/// Missing optional values are written as empty fields.
pub fn write_dataset_csv(path: &Path, observations: &[Observation]) -> Result<(), AppError> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| AppError::input(format!("Failed to create dataset CSV '{}': {e}", path.display())))?;

    let mut header = vec![
        "fips",
        "county",
        "date",
        "t",
        "new_cases",
        "population",
        "log_population",
        "log_density",
        "near_city",
        "high_risk",
        "elderly_pct",
    ];
    header.extend(MobilityKind::ALL.map(MobilityKind::column_name));
    writer
        .write_record(&header)
        .map_err(|e| AppError::input(format!("Failed to write dataset CSV header: {e}")))?;

    let opt = |v: Option<f64>| v.map(|x| format!("{x:.6}")).unwrap_or_default();
    for o in observations {
        let mut record = vec![
            o.fips.to_string(),
            o.county.clone(),
            o.date.to_string(),
            o.t.to_string(),
            o.new_cases.to_string(),
            format!("{:.0}", o.population),
            format!("{:.6}", o.log_population),
            opt(o.log_density),
            u8::from(o.near_city).to_string(),
            u8::from(o.high_risk).to_string(),
            opt(o.elderly_pct),
        ];
        record.extend(MobilityKind::ALL.map(|k| opt(o.mobility.get(k))));
        writer
            .write_record(&record)
            .map_err(|e| AppError::input(format!("Failed to write dataset CSV row: {e}")))?;
    }

    writer
        .flush()
        .map_err(|e| AppError::input(format!("Failed to flush dataset CSV: {e}")))?;
    Ok(())
}

/// Write the model ranking (top model first).
pub fn write_ranking_csv(path: &Path, ranking: &[RankEntry], chosen: &str) -> Result<(), AppError> {
    let mut file = File::create(path)
        .map_err(|e| AppError::input(format!("Failed to create ranking CSV '{}': {e}", path.display())))?;

    writeln!(file, "rank,model,complexity,elpd_loo,se_elpd_loo,elpd_diff,se_diff,n_matched,chosen")
        .map_err(|e| AppError::input(format!("Failed to write ranking CSV header: {e}")))?;

    for (i, r) in ranking.iter().enumerate() {
        writeln!(
            file,
            "{},{},{},{:.4},{:.4},{:.4},{:.4},{},{}",
            i + 1,
            r.name,
            r.complexity,
            r.elpd_loo,
            r.se_elpd_loo,
            r.elpd_diff,
            r.se_diff,
            r.n_matched,
            u8::from(r.name == chosen),
        )
        .map_err(|e| AppError::input(format!("Failed to write ranking CSV row: {e}")))?;
    }

    Ok(())
}
