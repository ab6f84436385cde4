//! CSV ingest and joining.
//!
//! This module is responsible for turning the five heterogeneous input tables
//! into one list of case rows with county attributes and mobility joined on.
//!
//! Design goals:
//! - **Strict schema** for required columns (clear errors + exit code 2)
//! - **Row-level validation** (skip bad rows, but report what happened)
//! - **Left joins only**: every parseable case row survives ingest; missing
//!   lookups show up as missing attributes, not as dropped rows
//! - **Separation of concerns**: no filtering or feature logic here

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use chrono::NaiveDate;
use csv::StringRecord;

use crate::domain::{CaseRow, CountyAttributes, DataPaths, JoinedRow, MobilityKind, MobilityRecord};
use crate::error::AppError;

/// A row-level error encountered during ingest.
#[derive(Debug, Clone)]
pub struct RowError {
    pub table: &'static str,
    pub line: usize,
    pub message: String,
}

/// How many joined rows lack each lookup.
#[derive(Debug, Clone, Default)]
pub struct JoinStats {
    pub missing_population: usize,
    pub missing_census: usize,
    pub missing_metro: usize,
    pub missing_mobility: usize,
}

/// Ingest output: joined rows + row errors + join coverage.
#[derive(Debug, Clone)]
pub struct IngestedData {
    pub rows: Vec<JoinedRow>,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
    pub join_stats: JoinStats,
}

/// Census attributes for one county.
#[derive(Debug, Clone, Copy, Default)]
pub struct CensusRecord {
    pub elderly_pct: Option<f64>,
    pub density: Option<f64>,
}

/// Lookup tables keyed by county FIPS (and date for mobility).
#[derive(Debug, Clone, Default)]
pub struct Lookups {
    pub population: HashMap<u32, f64>,
    pub census: HashMap<u32, CensusRecord>,
    pub metro: HashMap<u32, bool>,
    pub mobility: HashMap<(u32, NaiveDate), MobilityRecord>,
}

/// Load every table and left-join the lookups onto the case rows.
pub fn load_dataset(paths: &DataPaths) -> Result<IngestedData, AppError> {
    let mut row_errors = Vec::new();

    let (cases, rows_read) = read_cases(&paths.cases, &mut row_errors)?;
    if cases.is_empty() {
        return Err(AppError::insufficient(format!(
            "No valid case rows in '{}'.",
            paths.cases.display()
        )));
    }

    let lookups = Lookups {
        population: read_population(&paths.population, &mut row_errors)?,
        census: read_census(&paths.census, &mut row_errors)?,
        metro: read_metro(&paths.metro, &mut row_errors)?,
        mobility: read_mobility(&paths.mobility, &mut row_errors)?,
    };

    let (rows, join_stats) = join_rows(cases, &lookups);

    tracing::info!(
        rows = rows.len(),
        row_errors = row_errors.len(),
        missing_population = join_stats.missing_population,
        missing_mobility = join_stats.missing_mobility,
        "ingest complete"
    );

    Ok(IngestedData {
        rows,
        row_errors,
        rows_read,
        join_stats,
    })
}

/// Left-join lookups onto case rows, preserving every case row and its order.
pub fn join_rows(cases: Vec<CaseRow>, lookups: &Lookups) -> (Vec<JoinedRow>, JoinStats) {
    let mut stats = JoinStats::default();
    let rows = cases
        .into_iter()
        .map(|case| {
            let population = lookups.population.get(&case.fips).copied();
            let census = lookups.census.get(&case.fips).copied();
            let metro = lookups.metro.get(&case.fips).copied();
            let mobility = lookups.mobility.get(&(case.fips, case.date)).copied();

            if population.is_none() {
                stats.missing_population += 1;
            }
            if census.is_none() {
                stats.missing_census += 1;
            }
            if metro.is_none() {
                stats.missing_metro += 1;
            }
            if mobility.is_none() {
                stats.missing_mobility += 1;
            }

            let census = census.unwrap_or_default();
            JoinedRow {
                case,
                attributes: CountyAttributes {
                    population,
                    density: census.density,
                    elderly_pct: census.elderly_pct,
                    metro,
                },
                mobility,
            }
        })
        .collect();
    (rows, stats)
}

/// Read the cumulative case table. Returns the parsed rows and the number of
/// data rows read.
pub fn read_cases(path: &Path, errors: &mut Vec<RowError>) -> Result<(Vec<CaseRow>, usize), AppError> {
    const TABLE: &str = "cases";
    let mut table = Table::open(path, TABLE)?;
    table.require(&["date", "county", "state", "fips", "cases"])?;

    let mut out = Vec::new();
    let rows_read = table.for_each(errors, |record, header_map| {
        let date = parse_date(get_required(record, header_map, "date")?)?;
        let county = get_required(record, header_map, "county")?.to_string();
        let state = get_required(record, header_map, "state")?.to_string();
        let fips = parse_fips(get_required(record, header_map, "fips")?)?;
        let cumulative_cases = parse_count(get_required(record, header_map, "cases")?)?;
        let deaths = get_optional(record, header_map, "deaths").and_then(|s| parse_count(s).ok());
        out.push(CaseRow {
            date,
            county,
            state,
            fips,
            cumulative_cases,
            deaths,
        });
        Ok(())
    })?;
    Ok((out, rows_read))
}

pub fn read_population(path: &Path, errors: &mut Vec<RowError>) -> Result<HashMap<u32, f64>, AppError> {
    const TABLE: &str = "population";
    let mut table = Table::open(path, TABLE)?;
    table.require(&["fips", "population"])?;

    let mut out = HashMap::new();
    let mut duplicates = Vec::new();
    table.for_each(errors, |record, header_map| {
        let fips = parse_fips(get_required(record, header_map, "fips")?)?;
        let population = parse_f64(get_required(record, header_map, "population")?)?;
        if out.insert(fips, population).is_some() {
            duplicates.push(format!("county {fips}"));
        }
        Ok(())
    })?;
    report_duplicates(TABLE, &duplicates, errors);
    Ok(out)
}

pub fn read_census(path: &Path, errors: &mut Vec<RowError>) -> Result<HashMap<u32, CensusRecord>, AppError> {
    const TABLE: &str = "census";
    let mut table = Table::open(path, TABLE)?;
    table.require(&["fips"])?;

    let mut out = HashMap::new();
    let mut duplicates = Vec::new();
    table.for_each(errors, |record, header_map| {
        let fips = parse_fips(get_required(record, header_map, "fips")?)?;
        let census = CensusRecord {
            elderly_pct: parse_opt_f64(get_optional(record, header_map, "elderly_pct")),
            density: parse_opt_f64(get_optional(record, header_map, "density")),
        };
        if out.insert(fips, census).is_some() {
            duplicates.push(format!("county {fips}"));
        }
        Ok(())
    })?;
    report_duplicates(TABLE, &duplicates, errors);
    Ok(out)
}

pub fn read_metro(path: &Path, errors: &mut Vec<RowError>) -> Result<HashMap<u32, bool>, AppError> {
    const TABLE: &str = "metro";
    let mut table = Table::open(path, TABLE)?;
    table.require(&["fips", "metro"])?;

    let mut out = HashMap::new();
    let mut duplicates = Vec::new();
    table.for_each(errors, |record, header_map| {
        let fips = parse_fips(get_required(record, header_map, "fips")?)?;
        let metro = parse_flag(get_required(record, header_map, "metro")?)?;
        if out.insert(fips, metro).is_some() {
            duplicates.push(format!("county {fips}"));
        }
        Ok(())
    })?;
    report_duplicates(TABLE, &duplicates, errors);
    Ok(out)
}

/// Read the mobility report. Rows without a county code (country or state
/// aggregates) are skipped silently.
pub fn read_mobility(
    path: &Path,
    errors: &mut Vec<RowError>,
) -> Result<HashMap<(u32, NaiveDate), MobilityRecord>, AppError> {
    const TABLE: &str = "mobility";
    let mut table = Table::open(path, TABLE)?;
    table.require(&["date", "census_fips_code"])?;

    let mut out = HashMap::new();
    let mut duplicates = Vec::new();
    table.for_each(errors, |record, header_map| {
        let Some(code) = get_optional(record, header_map, "census_fips_code") else {
            return Ok(());
        };
        let fips = parse_fips(code)?;
        let date = parse_date(get_required(record, header_map, "date")?)?;

        let mut mobility = MobilityRecord::default();
        for kind in MobilityKind::ALL {
            mobility.set(kind, parse_opt_f64(get_optional(record, header_map, kind.column_name())));
        }
        if out.insert((fips, date), mobility).is_some() {
            duplicates.push(format!("county {fips} on {date}"));
        }
        Ok(())
    })?;
    report_duplicates(TABLE, &duplicates, errors);
    Ok(out)
}

/// An open CSV table with its normalized header map.
struct Table {
    name: &'static str,
    reader: csv::Reader<File>,
    header_map: HashMap<String, usize>,
}

impl Table {
    fn open(path: &Path, name: &'static str) -> Result<Self, AppError> {
        let file = File::open(path).map_err(|e| {
            AppError::input(format!("Failed to open {name} CSV '{}': {e}", path.display()))
        })?;

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(file);

        let headers = reader
            .headers()
            .map_err(|e| AppError::input(format!("Failed to read {name} CSV headers: {e}")))?
            .clone();

        Ok(Self {
            name,
            reader,
            header_map: build_header_map(&headers),
        })
    }

    fn require(&self, columns: &[&str]) -> Result<(), AppError> {
        for column in columns {
            if !self.header_map.contains_key(*column) {
                return Err(AppError::input(format!(
                    "Missing required column in {} CSV: `{column}`",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Visit each record; per-row failures become `RowError`s.
    fn for_each<F>(&mut self, errors: &mut Vec<RowError>, mut visit: F) -> Result<usize, AppError>
    where
        F: FnMut(&StringRecord, &HashMap<String, usize>) -> Result<(), String>,
    {
        let mut rows_read = 0usize;
        for (idx, result) in self.reader.records().enumerate() {
            // +2: records() starts after the header line, and lines are 1-based.
            let line = idx + 2;
            rows_read += 1;

            let outcome = match result {
                Ok(record) => visit(&record, &self.header_map),
                Err(e) => Err(format!("CSV parse error: {e}")),
            };
            if let Err(message) = outcome {
                errors.push(RowError {
                    table: self.name,
                    line,
                    message,
                });
            }
        }
        Ok(rows_read)
    }
}

fn report_duplicates(table: &'static str, duplicates: &[String], errors: &mut Vec<RowError>) {
    for key in duplicates {
        errors.push(RowError {
            table,
            line: 0,
            message: format!("Duplicate {key}; the last row wins."),
        });
    }
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports sometimes prefix the first header with a UTF-8 BOM.
    let name = name.trim().trim_start_matches('\u{feff}');
    name.to_ascii_lowercase()
}

fn get_required<'a>(
    record: &'a StringRecord,
    header_map: &HashMap<String, usize>,
    name: &str,
) -> Result<&'a str, String> {
    let idx = header_map
        .get(name)
        .ok_or_else(|| format!("Missing required column: `{name}`"))?;
    record
        .get(*idx)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("Missing required value: `{name}`"))
}

fn get_optional<'a>(record: &'a StringRecord, header_map: &HashMap<String, usize>, name: &str) -> Option<&'a str> {
    let idx = header_map.get(name)?;
    record
        .get(*idx)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("na"))
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate, String> {
    const FMTS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];
    for fmt in FMTS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
    }
    Err(format!(
        "Invalid date '{s}'. Expected one of: YYYY-MM-DD, MM/DD/YYYY, YYYY/MM/DD."
    ))
}

/// Parse a county FIPS code. Leading zeros and a float-style `.0` suffix
/// (common in spreadsheet exports) are tolerated.
pub(crate) fn parse_fips(s: &str) -> Result<u32, String> {
    let trimmed = s.trim();
    let digits = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    digits
        .parse::<u32>()
        .map_err(|_| format!("Invalid county code '{s}'."))
}

fn parse_count(s: &str) -> Result<i64, String> {
    if let Ok(v) = s.parse::<i64>() {
        return Ok(v);
    }
    let v = parse_f64(s)?;
    if v.fract() != 0.0 {
        return Err(format!("Invalid count '{s}' (not an integer)."));
    }
    Ok(v as i64)
}

fn parse_f64(s: &str) -> Result<f64, String> {
    let v = s
        .replace(',', "")
        .parse::<f64>()
        .map_err(|_| format!("Invalid number '{s}'."))?;
    if v.is_finite() {
        Ok(v)
    } else {
        Err(format!("Non-finite number '{s}'."))
    }
}

fn parse_opt_f64(s: Option<&str>) -> Option<f64> {
    parse_f64(s?).ok()
}

fn parse_flag(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Ok(true),
        "0" | "false" | "no" | "n" => Ok(false),
        _ => Err(format!("Invalid flag '{s}' (expected 1/0, true/false, yes/no).")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(fips: u32, day: u32, cases: i64) -> CaseRow {
        CaseRow {
            date: NaiveDate::from_ymd_opt(2020, 4, day).unwrap(),
            county: format!("C{fips}"),
            state: "Michigan".to_string(),
            fips,
            cumulative_cases: cases,
            deaths: None,
        }
    }

    #[test]
    fn parse_fips_tolerates_spreadsheet_forms() {
        assert_eq!(parse_fips("26163").unwrap(), 26163);
        assert_eq!(parse_fips("06037").unwrap(), 6037);
        assert_eq!(parse_fips("26163.0").unwrap(), 26163);
        assert!(parse_fips("wayne").is_err());
    }

    #[test]
    fn parse_flag_variants() {
        assert!(parse_flag("Y").unwrap());
        assert!(!parse_flag("0").unwrap());
        assert!(parse_flag("maybe").is_err());
    }

    #[test]
    fn repeated_mobility_day_is_a_row_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("mobility.csv");
        std::fs::write(
            &path,
            "date,census_fips_code,residential_percent_change_from_baseline\n\
             2020-04-01,26163,5\n\
             2020-04-02,26163,6\n\
             2020-04-01,26163,7\n",
        )
        .unwrap();

        let mut errors = Vec::new();
        let mobility = read_mobility(&path, &mut errors).unwrap();
        let d1 = NaiveDate::from_ymd_opt(2020, 4, 1).unwrap();

        assert_eq!(mobility.len(), 2);
        assert_eq!(mobility[&(26163, d1)].get(MobilityKind::Residential), Some(7.0));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].table, "mobility");
        assert!(errors[0].message.contains("county 26163 on 2020-04-01"));
    }

    #[test]
    fn join_preserves_every_case_row() {
        let cases = vec![case(1, 1, 5), case(2, 1, 3), case(1, 2, 7)];
        let mut lookups = Lookups::default();
        lookups.population.insert(1, 1000.0);
        lookups.metro.insert(1, true);
        let d2 = NaiveDate::from_ymd_opt(2020, 4, 2).unwrap();
        lookups.mobility.insert(
            (1, d2),
            MobilityRecord::default().with(MobilityKind::Parks, -10.0),
        );

        let (rows, stats) = join_rows(cases, &lookups);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].attributes.population, Some(1000.0));
        assert_eq!(rows[1].attributes.population, None);
        assert!(rows[0].mobility.is_none());
        assert_eq!(rows[2].mobility.unwrap().get(MobilityKind::Parks), Some(-10.0));
        assert_eq!(stats.missing_population, 1);
        assert_eq!(stats.missing_census, 3);
        assert_eq!(stats.missing_mobility, 2);
    }
}
