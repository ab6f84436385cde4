//! ASCII plotting for terminal output.
//!
//! A fixed-size character grid showing the state-level epidemic curve:
//! - observed daily cases (summed over counties): `o`
//! - expected daily cases under the chosen model: `-` line
//!
//! Output is deterministic, so it can be compared verbatim in tests.

use crate::eval::DailyTotal;

/// Render observed vs expected daily totals against elapsed day.
pub fn render_daily_plot(totals: &[DailyTotal], width: usize, height: usize) -> String {
    let width = width.max(10);
    let height = height.max(5);

    let (t_min, t_max) = day_range(totals).unwrap_or((0.0, 1.0));
    let (y_min, y_max) = count_range(totals).unwrap_or((0.0, 1.0));
    let (y_min, y_max) = pad_range(y_min, y_max, 0.05);

    let mut grid = vec![vec![' '; width]; height];

    // Curve first so observed points overlay it.
    let curve: Vec<(f64, f64)> = totals.iter().map(|d| (f64::from(d.t), d.expected)).collect();
    draw_curve(&mut grid, &curve, t_min, t_max, y_min, y_max);

    for d in totals {
        let x = column(f64::from(d.t), t_min, t_max, width);
        let y = row(d.observed, y_min, y_max, height);
        grid[y][x] = 'o';
    }

    let mut out = String::new();
    out.push_str(&format!(
        "Plot: day=[{t_min:.0}, {t_max:.0}] | daily cases=[{y_min:.1}, {y_max:.1}] | o observed, - expected\n"
    ));
    for row in grid {
        out.push_str(&row.into_iter().collect::<String>());
        out.push('\n');
    }
    out
}

fn day_range(totals: &[DailyTotal]) -> Option<(f64, f64)> {
    let min_t = totals.iter().map(|d| d.t).min()?;
    let max_t = totals.iter().map(|d| d.t).max()?;
    (max_t > min_t).then(|| (f64::from(min_t), f64::from(max_t)))
}

fn count_range(totals: &[DailyTotal]) -> Option<(f64, f64)> {
    let mut min_y = f64::INFINITY;
    let mut max_y = f64::NEG_INFINITY;
    for d in totals {
        for v in [d.observed, d.expected] {
            if v.is_finite() {
                min_y = min_y.min(v);
                max_y = max_y.max(v);
            }
        }
    }
    (min_y.is_finite() && max_y.is_finite() && max_y > min_y).then_some((min_y, max_y))
}

fn pad_range(min: f64, max: f64, frac: f64) -> (f64, f64) {
    let pad = ((max - min).abs() * frac).max(1e-12);
    (min - pad, max + pad)
}

/// Grid column for day `t`.
fn column(t: f64, t_min: f64, t_max: f64, width: usize) -> usize {
    let u = ((t - t_min) / (t_max - t_min)).clamp(0.0, 1.0);
    (u * (width.max(2) - 1) as f64).round() as usize
}

/// Grid row for count `y`; row 0 is the top.
fn row(y: f64, y_min: f64, y_max: f64, height: usize) -> usize {
    let last = (height.max(2) - 1) as f64;
    let u = ((y - y_min) / (y_max - y_min)).clamp(0.0, 1.0);
    (last * (1.0 - u)).round() as usize
}

/// Linear interpolation between consecutive points, one mark per column
/// plus vertical fill where the curve jumps by more than one row.
fn draw_curve(grid: &mut [Vec<char>], curve: &[(f64, f64)], t_min: f64, t_max: f64, y_min: f64, y_max: f64) {
    let height = grid.len();
    let Some(width) = grid.first().map(Vec::len) else {
        return;
    };

    let mut mark = |x: usize, y: usize| {
        if y < height && x < width && grid[y][x] == ' ' {
            grid[y][x] = '-';
        }
    };

    for pair in curve.windows(2) {
        let ((ta, ya), (tb, yb)) = (pair[0], pair[1]);
        let (xa, xb) = (column(ta, t_min, t_max, width), column(tb, t_min, t_max, width));
        let mut last_row = row(ya, y_min, y_max, height);
        for x in xa..=xb {
            let frac = if xb > xa { (x - xa) as f64 / (xb - xa) as f64 } else { 1.0 };
            let r = row(ya + frac * (yb - ya), y_min, y_max, height);
            for fill in r.min(last_row)..=r.max(last_row) {
                mark(x, fill);
            }
            last_row = r;
        }
    }
}
