//! Ingest + transform over small CSV fixtures written to a temp directory.

use std::fs;
use std::path::Path;

use county_growth::app::pipeline::prepare;
use county_growth::data::TransformOptions;
use county_growth::domain::{DataPaths, MobilityKind};
use county_growth::io::{load_dataset, write_dataset_csv};
use county_growth::models::{build_frame, model_ladder};
use county_growth::report::format_prepare;
use tempfile::TempDir;

const WAYNE: u32 = 26163;
const GENESEE: u32 = 26049;
const RURAL: u32 = 26001;

fn write(dir: &Path, name: &str, body: &str) {
    fs::write(dir.join(name), body).unwrap();
}

fn mobility_row(date: &str, fips: u32, v: f64) -> String {
    format!(
        "United States,Michigan,{date},{fips},{v},{v},{v},{v},{v},{v}\n",
        v = v
    )
}

/// Two metro counties (one near the city) and one rural county in Michigan,
/// plus an Ohio county that must be filtered out. Genesee's cumulative count
/// drops by 5 on day 4 and it has mobility for the first three days only.
fn fixture() -> (TempDir, DataPaths) {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();

    let mut cases = String::from("date,county,state,fips,cases,deaths\n");
    let wayne = [3, 8, 15, 25, 40, 52];
    let genesee = [2, 6, 12, 7, 10, 16];
    let rural = [5, 9, 11, 14, 20, 22];
    for day in 0..6 {
        let date = format!("2020-03-{:02}", 10 + day);
        cases.push_str(&format!("{date},Wayne,Michigan,{WAYNE},{},0\n", wayne[day]));
        cases.push_str(&format!("{date},Genesee,Michigan,{GENESEE},{},0\n", genesee[day]));
        cases.push_str(&format!("{date},Alcona,Michigan,{RURAL},{},0\n", rural[day]));
        cases.push_str(&format!("{date},Franklin,Ohio,39049,{},0\n", 10 * (day + 2)));
    }
    cases.push_str("not-a-date,Wayne,Michigan,26163,1,0\n");
    write(dir, "cases.csv", &cases);

    write(
        dir,
        "population.csv",
        "fips,population\n26163,1749343\n26049,405813\n26001,10405\n39049,1316756\n",
    );
    write(
        dir,
        "census.csv",
        "fips,elderly_pct,density\n26163,15.2,2974\n26049,18.9,637\n26001,34.6,15.4\n",
    );
    write(dir, "metro.csv", "fips,metro\n26163,1\n26049,1\n26001,0\n39049,1\n");

    let mut mobility = String::from("country_region,sub_region_1,date,census_fips_code");
    for kind in MobilityKind::ALL {
        mobility.push(',');
        mobility.push_str(kind.column_name());
    }
    mobility.push('\n');
    mobility.push_str("United States,,2020-03-10,,1,1,1,1,1,1\n");
    for day in 0..6 {
        let date = format!("2020-03-{:02}", 10 + day);
        mobility.push_str(&mobility_row(&date, WAYNE, -10.0 - day as f64));
        if day < 3 {
            mobility.push_str(&mobility_row(&date, GENESEE, -5.0));
        }
    }
    write(dir, "mobility.csv", &mobility);

    let paths = DataPaths {
        cases: dir.join("cases.csv"),
        population: dir.join("population.csv"),
        census: dir.join("census.csv"),
        metro: dir.join("metro.csv"),
        mobility: dir.join("mobility.csv"),
    };
    (tmp, paths)
}

fn michigan() -> TransformOptions {
    TransformOptions {
        state: "Michigan".to_string(),
        high_risk_elderly_pct: 18.0,
    }
}

#[test]
fn ingest_keeps_every_parseable_case_row() {
    let (_tmp, paths) = fixture();
    let ingested = load_dataset(&paths).unwrap();
    assert_eq!(ingested.rows_read, 25);
    assert_eq!(ingested.rows.len(), 24);
    assert_eq!(ingested.row_errors.len(), 1);
    assert_eq!(ingested.row_errors[0].table, "cases");
}

#[test]
fn transform_filters_state_metro_and_clamps_drops() {
    let (_tmp, paths) = fixture();
    let prepared = prepare(&paths, &michigan()).unwrap();
    let obs = &prepared.dataset.observations;

    assert!(obs.iter().all(|o| o.fips == WAYNE || o.fips == GENESEE));
    assert_eq!(prepared.dataset.stats.counties, 2);
    assert!(obs.iter().all(|o| o.population > 0.0 && o.log_population.is_finite()));

    let genesee: Vec<_> = obs.iter().filter(|o| o.fips == GENESEE).collect();
    let day4 = genesee.iter().find(|o| o.t == 3).unwrap();
    assert_eq!(day4.new_cases, 0);
    assert_eq!(prepared.dataset.stats.clamped_rows, 1);

    assert!(obs.iter().filter(|o| o.fips == WAYNE).all(|o| o.near_city));
    assert!(genesee.iter().all(|o| !o.near_city && o.high_risk));
}

#[test]
fn missing_mobility_only_excludes_rows_from_mobility_models() {
    let (_tmp, paths) = fixture();
    let prepared = prepare(&paths, &michigan()).unwrap();
    let obs = &prepared.dataset.observations;
    let ladder = model_ladder();

    let time = build_frame(obs, &ladder[0]).unwrap();
    let mobility = build_frame(obs, &ladder[2]).unwrap();

    assert_eq!(time.n_obs(), obs.len());
    assert_eq!(mobility.n_obs(), obs.len() - 3);
    assert_eq!(mobility.dropped_rows, 3);

    assert_eq!(prepared.common_rows, obs.len() - 3);
    let report = format_prepare(&prepared);
    assert!(report.contains(&format!("n={} of {}", obs.len() - 3, obs.len())));
}

#[test]
fn missing_required_column_is_an_input_error() {
    let (tmp, mut paths) = fixture();
    write(tmp.path(), "bad_population.csv", "fips,residents\n26163,1\n");
    paths.population = tmp.path().join("bad_population.csv");
    let err = load_dataset(&paths).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(err.message().contains("population"));
}

#[test]
fn unknown_state_is_insufficient_data() {
    let (_tmp, paths) = fixture();
    let opts = TransformOptions {
        state: "Atlantis".to_string(),
        high_risk_elderly_pct: 20.0,
    };
    assert_eq!(prepare(&paths, &opts).unwrap_err().exit_code(), 3);
}

#[test]
fn exported_dataset_has_one_line_per_observation() {
    let (tmp, paths) = fixture();
    let prepared = prepare(&paths, &michigan()).unwrap();
    let out = tmp.path().join("dataset.csv");
    write_dataset_csv(&out, &prepared.dataset.observations).unwrap();

    let text = fs::read_to_string(&out).unwrap();
    let mut lines = text.lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("fips,county,date,t,new_cases,population,log_population"));
    assert_eq!(lines.count(), prepared.dataset.observations.len());
}
