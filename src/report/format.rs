//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the sampling/evaluation code stays clean and testable
//! - output changes are localized (tests below pin the important lines)

use crate::app::pipeline::{CalibrationReport, PreparedData, PriorCheck};
use crate::domain::{
    LooSummary, ModelSummary, ObservationKey, ParameterSummary, PredictiveSummary, RankEntry, SampleMode,
    SummaryFile,
};

/// Rates are printed per this many residents.
const RATE_PER: f64 = 100_000.0;

/// Ingest and transform statistics for `cg prepare`.
pub fn format_prepare(prepared: &PreparedData) -> String {
    let ingest = &prepared.ingest;
    let stats = &prepared.dataset.stats;
    let join = &ingest.join_stats;
    let mut out = String::new();

    out.push_str("=== cg - county case growth: prepared data ===\n");
    out.push_str(&format!(
        "Read: {} case rows | joined={} | skipped={}\n",
        ingest.rows_read,
        ingest.rows.len(),
        ingest.row_errors.len()
    ));
    out.push_str(&format!(
        "Missing lookups: population={} census={} metro={} mobility={}\n",
        join.missing_population, join.missing_census, join.missing_metro, join.missing_mobility
    ));
    for err in ingest.row_errors.iter().take(5) {
        out.push_str(&format!("  {}:{}: {}\n", err.table, err.line, err.message));
    }
    if ingest.row_errors.len() > 5 {
        out.push_str(&format!("  ... {} more\n", ingest.row_errors.len() - 5));
    }

    out.push_str(&format!(
        "Rows: in={} | in state={} | out={} | clamped to 0={}\n",
        stats.rows_in, stats.rows_in_state, stats.rows_out, stats.clamped_rows
    ));
    out.push_str(&format!(
        "Counties: {} | dates=[{}, {}] | rows with mobility={}\n",
        stats.counties, stats.first_date, stats.last_date, stats.rows_with_mobility
    ));
    out.push_str(&format!(
        "Common evaluation sample (every ladder covariate present): n={} of {}\n",
        prepared.common_rows, stats.rows_out
    ));

    out
}

/// Prior predictive check for `cg prior`.
pub fn format_prior_check(check: &PriorCheck) -> String {
    let mut out = String::new();

    out.push_str(&format!("=== Prior predictive check: {} ===\n", check.model));
    out.push_str(&format!("Observations: {} | draws: {}\n", check.n_obs, check.draws));
    out.push_str(&format_predictive(&check.predictive, false));
    out.push('\n');
    out.push_str("Prior draws:\n");
    out.push_str(&format_parameters(&check.parameters, false));

    out
}

/// Everything printed for one fitted model.
pub fn format_model_summary(summary: &ModelSummary, high_k: &[ObservationKey], top_n: usize) -> String {
    let mut out = String::new();
    let d = &summary.diagnostics;

    out.push_str(&format!(
        "=== Model {} (complexity {}) ===\n",
        summary.name, summary.complexity
    ));
    out.push_str(&format!(
        "Rows: n={} | dropped (missing covariates)={}\n",
        summary.n_obs, summary.dropped_rows
    ));
    out.push_str(&format!(
        "Sampler: chains={} draws/chain={} | accept global={:.2} centered={:.2} local={:.2} | non-finite={}\n",
        d.chains,
        d.draws_per_chain,
        d.global_accept_rate,
        d.centered_accept_rate,
        d.local_accept_rate,
        d.non_finite_proposals
    ));
    let status = if d.converged() { "ok" } else { "CHECK" };
    out.push_str(&format!(
        "Convergence: max R-hat={:.3} min ESS={:.0} [{status}]\n",
        d.max_rhat, d.min_ess
    ));

    out.push('\n');
    out.push_str(&format_parameters(&summary.parameters, true));
    out.push('\n');
    out.push_str(&format_predictive(&summary.predictive, true));
    out.push_str(&format_loo(&summary.loo));

    if !high_k.is_empty() && top_n > 0 {
        out.push_str("High Pareto k:\n");
        for key in high_k.iter().take(top_n) {
            out.push_str(&format!("  fips={} date={}\n", key.fips, key.date));
        }
        if high_k.len() > top_n {
            out.push_str(&format!("  ... {} more\n", high_k.len() - top_n));
        }
    }

    out
}

/// Ranking table plus the chosen model.
pub fn format_ranking(ranking: &[RankEntry], chosen: &str, noise_se: f64, sample_mode: SampleMode) -> String {
    let mut out = String::new();

    out.push_str("Model comparison (LOO):\n");
    let shared = ranking.first().map_or(0, |e| e.n_matched);
    match sample_mode {
        SampleMode::Common => out.push_str(&format!(
            "Sample: common | every model fit on the same n={shared} rows (rows missing any compared covariate are dropped from all models)\n"
        )),
        SampleMode::PerModel => out.push_str(&format!(
            "Sample: per-model | each model fit on its own complete rows, ranked on the n={shared} rows all models share\n"
        )),
    }
    out.push_str(
        format!(
            "{:<2}{:<20} {:>10} {:>12} {:>8} {:>11} {:>9} {:>7}\n",
            "", "model", "complexity", "elpd_loo", "se", "elpd_diff", "se_diff", "n"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(
        format!(
            "{:<2}{:-<20} {:-<10} {:-<12} {:-<8} {:-<11} {:-<9} {:-<7}\n",
            "", "", "", "", "", "", "", ""
        )
        .trim_end(),
    );
    out.push('\n');

    for e in ranking {
        let mark = if e.name == chosen { "*" } else { " " };
        out.push_str(
            format!(
                "{mark} {:<20} {:>10} {:>12.2} {:>8.2} {:>11.2} {:>9.2} {:>7}\n",
                truncate(&e.name, 20),
                e.complexity,
                e.elpd_loo,
                e.se_elpd_loo,
                e.elpd_diff,
                e.se_diff,
                e.n_matched
            )
            .trim_end(),
        );
        out.push('\n');
    }

    out.push_str(&format!(
        "\nChosen: {chosen} (simplest model within {noise_se} SE of the best)\n"
    ));
    out
}

/// Coverage table for `cg simulate`.
pub fn format_calibration(report: &CalibrationReport) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "=== Calibration: {} synthetic datasets ===\n",
        report.replications
    ));
    out.push_str(&format!("{:<24} {:>10} {:>9} {:>9}\n", "parameter", "truth", "covered", "rate").trim_end());
    out.push('\n');
    for row in &report.rows {
        let rate = row.covered as f64 / report.replications as f64;
        out.push_str(
            format!(
                "{:<24} {:>10.3} {:>9} {:>9.2}\n",
                truncate(&row.name, 24),
                row.truth,
                row.covered,
                rate
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out.push_str(&format!("Nominal rate 0.95 | max R-hat over runs {:.3}\n", report.max_rhat));
    out
}

/// Re-print a saved summary.
pub fn format_summary_file(summary: &SummaryFile) -> String {
    let mut out = String::new();

    out.push_str(&format!("=== {} summary: {} ===\n", summary.tool, summary.state));
    out.push_str(&format!(
        "Dates: [{}, {}] | sample={:?} | chains={} warmup={} draws={} seed={}\n\n",
        summary.date_range.0,
        summary.date_range.1,
        summary.sample_mode,
        summary.control.chains,
        summary.control.warmup,
        summary.control.draws,
        summary.control.seed
    ));
    for model in &summary.models {
        out.push_str(&format_model_summary(model, &[], 0));
        out.push('\n');
    }
    out.push_str(&format_ranking(
        &summary.ranking,
        &summary.chosen,
        summary.noise_se,
        summary.sample_mode,
    ));
    out
}

fn format_parameters(params: &[ParameterSummary], with_diagnostics: bool) -> String {
    let mut out = String::new();
    let header = format!(
        "{:<36} {:>10} {:>9} {:>10} {:>10}",
        "parameter", "mean", "sd", "2.5%", "97.5%"
    );
    if with_diagnostics {
        out.push_str(&format!("{header} {:>7} {:>7}\n", "rhat", "ess"));
    } else {
        out.push_str(&header);
        out.push('\n');
    }

    for p in params {
        let row = format!(
            "{:<36} {:>10} {:>9} {:>10} {:>10}",
            truncate(&p.name, 36),
            fmt_num(p.mean),
            fmt_num(p.sd),
            fmt_num(p.q2_5),
            fmt_num(p.q97_5)
        );
        if with_diagnostics {
            out.push_str(&format!("{row} {:>7.3} {:>7.0}\n", p.rhat, p.ess));
        } else {
            out.push_str(&row);
            out.push('\n');
        }
    }
    out
}

fn format_predictive(p: &PredictiveSummary, with_coverage: bool) -> String {
    let mut out = String::new();
    let q: Vec<String> = p.rate_quantiles.iter().map(|r| fmt_num(r * RATE_PER)).collect();

    out.push_str(&format!(
        "Expected daily cases per 100k: min={} 5%={} median={} 95%={} max={}\n",
        q[0], q[1], q[2], q[3], q[4]
    ));
    out.push_str(&format!(
        "Rows with expected cases > population: {} | replicates > population: {:.2}%\n",
        p.n_exceeding_population,
        100.0 * p.replicate_exceed_fraction
    ));
    if with_coverage {
        out.push_str(&format!(
            "Predictive coverage: 50%={:.2} 90%={:.2}\n",
            p.coverage_50, p.coverage_90
        ));
    }
    out
}

fn format_loo(loo: &LooSummary) -> String {
    format!(
        "LOO: elpd={:.2} (se {:.2}) p_loo={:.2} looic={:.2} | k>threshold: {} (max k {:.2})\n",
        loo.elpd_loo, loo.se_elpd_loo, loo.p_loo, loo.looic, loo.n_high_k, loo.max_k
    )
}

/// Fixed decimals for moderate values, scientific notation otherwise.
fn fmt_num(v: f64) -> String {
    if !v.is_finite() {
        return format!("{v}");
    }
    let a = v.abs();
    if a != 0.0 && !(1e-3..1e6).contains(&a) {
        format!("{v:.3e}")
    } else {
        format!("{v:.4}")
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}
