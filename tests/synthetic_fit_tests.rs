//! End-to-end fits on synthetic data with known generating parameters.

use county_growth::app::pipeline::{LadderRun, SimulationConfig, calibration_study, fit_model, prior_check, run_ladder};
use county_growth::data::{SyntheticConfig, generate_observations};
use county_growth::domain::{DataPaths, FitConfig, SampleMode, SamplerControl};
use county_growth::fit::AdaptiveMetropolis;
use county_growth::models::{model_ladder, select_models};

const MOBILITY_GAP_DAYS: usize = 6;

fn short_control(seed: u64) -> SamplerControl {
    SamplerControl {
        chains: 2,
        warmup: 300,
        draws: 300,
        thin: 1,
        target_accept: 0.3,
        seed,
    }
}

fn fit_config(control: SamplerControl) -> FitConfig {
    FitConfig {
        paths: DataPaths {
            cases: "cases.csv".into(),
            population: "population.csv".into(),
            census: "census.csv".into(),
            metro: "metro.csv".into(),
            mobility: "mobility.csv".into(),
        },
        state: "Michigan".to_string(),
        high_risk_elderly_pct: 20.0,
        models: vec!["time".to_string()],
        sample_mode: SampleMode::Common,
        control,
        noise_se: 2.0,
        k_threshold: 0.7,
        top_n: 5,
        plot: false,
        plot_width: 80,
        plot_height: 20,
        export_ranking: None,
        export_summary: None,
    }
}

#[test]
fn baseline_intervals_cover_true_time_coefficients() {
    let config = SimulationConfig {
        replications: 10,
        synthetic: SyntheticConfig::default(),
        control: short_control(11),
    };
    let report = calibration_study(&AdaptiveMetropolis::default(), &config).unwrap();

    for name in ["b_time", "b_time_sq"] {
        let row = report.rows.iter().find(|r| r.name == name).unwrap();
        assert!(
            row.covered >= 7,
            "{name} covered {} of {}",
            row.covered,
            report.replications
        );
    }
}

#[test]
fn single_model_ladder_chooses_it_and_tracks_daily_totals() {
    let data = generate_observations(&SyntheticConfig::default()).unwrap();
    let config = fit_config(short_control(3));
    let ladder = select_models(&model_ladder(), &config.models).unwrap();

    let run = run_ladder(&AdaptiveMetropolis::default(), &data.observations, &ladder, &config).unwrap();

    assert_eq!(run.chosen, "time");
    assert_eq!(run.ranking.len(), 1);
    assert_eq!(run.ranking[0].elpd_diff, 0.0);
    assert_eq!(run.daily.len(), SyntheticConfig::default().days);

    let observed: f64 = run.daily.iter().map(|d| d.observed).sum();
    let expected: f64 = run.daily.iter().map(|d| d.expected).sum();
    assert!((expected / observed - 1.0).abs() < 0.15, "observed {observed} expected {expected}");

    let loo = &run.models[0].summary.loo;
    assert!(loo.elpd_loo.is_finite() && loo.elpd_loo < 0.0);
    assert!(loo.p_loo > 0.0);
}

#[test]
fn prior_check_keeps_counts_below_population() {
    let data = generate_observations(&SyntheticConfig::default()).unwrap();
    let spec = &model_ladder()[0];
    let check = prior_check(&AdaptiveMetropolis::default(), &data.observations, spec, &short_control(5)).unwrap();

    assert_eq!(check.n_obs, data.observations.len());
    assert_eq!(check.draws, 600);
    assert!(check.predictive.replicate_exceed_fraction < 0.05);
}

#[test]
fn many_county_fit_mixes_at_default_control() {
    let synthetic = SyntheticConfig {
        counties: 20,
        days: 120,
        seed: 19,
        ..SyntheticConfig::default()
    };
    let data = generate_observations(&synthetic).unwrap();
    let spec = &model_ladder()[0];

    let run = fit_model(
        &AdaptiveMetropolis::default(),
        &data.observations,
        spec,
        &[],
        &SamplerControl::default(),
        0.7,
    )
    .unwrap();

    let diagnostics = &run.summary.diagnostics;
    for p in &run.summary.parameters {
        assert!(p.rhat < 1.05, "{} R-hat {:.3} ESS {:.0}", p.name, p.rhat, p.ess);
    }
    assert!(diagnostics.max_rhat < 1.05);

    let sd = run
        .summary
        .parameters
        .iter()
        .find(|p| p.name == "sd_county__intercept")
        .unwrap();
    assert!(sd.mean > 0.1 && sd.mean < 0.6, "sd mean {}", sd.mean);
}

fn mobility_data() -> Vec<county_growth::domain::Observation> {
    let synthetic = SyntheticConfig {
        counties: 6,
        days: 60,
        seed: 23,
        with_mobility: true,
        missing_mobility_days: MOBILITY_GAP_DAYS,
        ..SyntheticConfig::default()
    };
    generate_observations(&synthetic).unwrap().observations
}

fn full_ladder(sample_mode: SampleMode, seed: u64) -> (usize, LadderRun) {
    let observations = mobility_data();
    let mut config = fit_config(short_control(seed));
    config.models = Vec::new();
    config.sample_mode = sample_mode;
    let ladder = select_models(&model_ladder(), &config.models).unwrap();
    let run = run_ladder(&AdaptiveMetropolis::default(), &observations, &ladder, &config).unwrap();
    (observations.len(), run)
}

fn assert_ranking_is_consistent(run: &LadderRun, noise_se: f64) {
    assert_eq!(run.ranking.len(), 5);
    assert_eq!(run.ranking[0].elpd_diff, 0.0);
    for e in run.ranking.iter().skip(1) {
        assert!(e.elpd_diff <= 0.0, "{} elpd_diff {}", e.name, e.elpd_diff);
        assert!(e.se_diff.is_finite());
    }

    let chosen = run.ranking.iter().find(|e| e.name == run.chosen).unwrap();
    let tied: Vec<_> = run
        .ranking
        .iter()
        .enumerate()
        .filter(|(i, e)| *i == 0 || -e.elpd_diff <= noise_se * e.se_diff)
        .map(|(_, e)| e)
        .collect();
    assert!(tied.iter().any(|e| e.name == chosen.name));
    assert!(tied.iter().all(|e| chosen.complexity <= e.complexity));
}

fn assert_random_slopes_were_fit(run: &LadderRun) {
    let widest = run.models.iter().find(|m| m.spec.name == "county_mobility_3").unwrap();
    let sds: Vec<_> = widest
        .summary
        .parameters
        .iter()
        .filter(|p| p.name.starts_with("sd_county__"))
        .collect();
    let cors = widest
        .summary
        .parameters
        .iter()
        .filter(|p| p.name.starts_with("cor_county__"))
        .count();
    assert_eq!(sds.len(), 4);
    assert_eq!(cors, 6);
    assert!(sds.iter().all(|p| p.mean.is_finite() && p.mean > 0.0));

    let one_slope = run.models.iter().find(|m| m.spec.name == "county_mobility_1").unwrap();
    assert!(
        one_slope
            .summary
            .parameters
            .iter()
            .any(|p| p.name == "cor_county__intercept__retail_recreation" && p.mean.abs() < 1.0)
    );
    for m in &run.models {
        assert!(m.summary.diagnostics.max_rhat.is_finite(), "{}", m.spec.name);
        assert!(m.summary.loo.elpd_loo.is_finite(), "{}", m.spec.name);
    }
}

#[test]
fn full_ladder_on_common_sample() {
    let (n, run) = full_ladder(SampleMode::Common, 31);
    let shared = n - MOBILITY_GAP_DAYS;

    assert!(run.models.iter().all(|m| m.summary.n_obs == shared));
    assert!(run.ranking.iter().all(|e| e.n_matched == shared));
    assert_ranking_is_consistent(&run, 2.0);
    assert_random_slopes_were_fit(&run);
    assert_eq!(run.daily.len(), 60);
}

#[test]
fn full_ladder_per_model_ranks_on_shared_rows() {
    let (n, run) = full_ladder(SampleMode::PerModel, 37);
    let shared = n - MOBILITY_GAP_DAYS;

    for m in &run.models {
        let expected = if m.spec.random.is_empty() && !m.spec.fixed.iter().any(|c| c.is_mobility()) {
            n
        } else {
            shared
        };
        assert_eq!(m.summary.n_obs, expected, "{}", m.spec.name);
    }
    assert!(run.ranking.iter().all(|e| e.n_matched == shared));
    assert_ranking_is_consistent(&run, 2.0);
    assert_random_slopes_were_fit(&run);
}
