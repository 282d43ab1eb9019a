//! Autofocus curve fitting (spec.md §4.4). Star detection and FWHM
//! estimation work on a single mono `Frame`; curve fitting works on the
//! sequence of `(position, fwhm)` samples the autofocus run has collected
//! so far and is otherwise independent of frame data.

use crate::fits::Frame;
use crate::value_stats::ValueStatsAccumulator;

use medians::Medianf64;

/// One exposure's worth of star measurements at a given focuser position
/// (spec.md §3 `FocusCurveSample`). `valid` is false when too few stars
/// were usable to trust `fwhm` (e.g. badly out of focus).
#[derive(Clone, Debug)]
pub struct FocusCurveSample {
    pub position: i32,
    pub fwhm: f64,
    pub star_count: usize,
    pub valid: bool,
}

/// Detects star-like blobs in `frame` via a background-relative threshold
/// and returns the FWHM (pixels) of each, using an IQR filter to discard
/// blown-out or spurious detections before they pollute the median.
///
/// Threshold is `median + k * sigma` of the whole-frame background,
/// estimated via MAD (spec.md §4.4).
pub fn measure_stars(frame: &Frame, threshold_k: f64, max_stars: usize) -> FocusCurveSample {
    assert_eq!(frame.channels, 1, "star detection operates on mono frames");
    let (w, h) = (frame.width, frame.height);

    let background: Vec<f64> = frame.data.iter().map(|&v| v as f64).collect();
    let median = background.clone().medf_unchecked();
    let sigma = 1.4826 * background.madf(median);
    let threshold = median + threshold_k * sigma;

    let mut visited = vec![false; w * h];
    let mut blobs: Vec<Vec<(usize, usize)>> = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            if visited[idx] || (frame.data[idx] as f64) < threshold {
                continue;
            }
            let mut stack = vec![(x, y)];
            let mut blob = Vec::new();
            visited[idx] = true;
            while let Some((cx, cy)) = stack.pop() {
                blob.push((cx, cy));
                for (dx, dy) in [(-1i64, 0i64), (1, 0), (0, -1), (0, 1)] {
                    let nx = cx as i64 + dx;
                    let ny = cy as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                        continue;
                    }
                    let nidx = ny as usize * w + nx as usize;
                    if !visited[nidx] && (frame.data[nidx] as f64) >= threshold {
                        visited[nidx] = true;
                        stack.push((nx as usize, ny as usize));
                    }
                }
            }
            if blob.len() >= 3 {
                blobs.push(blob);
            }
        }
    }

    let mut fwhms: Vec<f64> = blobs
        .iter()
        .filter_map(|blob| fwhm_of_blob(frame, blob, median))
        .collect();

    if fwhms.len() > max_stars {
        fwhms.sort_by(|a, b| a.total_cmp(b));
        fwhms.truncate(max_stars);
    }

    let filtered = iqr_filter(&fwhms);
    if filtered.len() < 3 {
        return FocusCurveSample {
            position: 0,
            fwhm: if filtered.is_empty() { f64::INFINITY } else { filtered.clone().medf_unchecked() },
            star_count: filtered.len(),
            valid: false,
        };
    }
    let fwhm = filtered.clone().medf_unchecked();
    FocusCurveSample {
        position: 0,
        fwhm,
        star_count: filtered.len(),
        valid: true,
    }
}

// Fits a 1-D Gaussian profile along the blob's brightest row/column to
// estimate FWHM within a 5x5 patch centered on the blob centroid, which is
// steadier than a raw pixel-count-based diameter when seeing is poor.
fn fwhm_of_blob(frame: &Frame, blob: &[(usize, usize)], background: f64) -> Option<f64> {
    let (sx, sy) = blob.iter().fold((0usize, 0usize), |(ax, ay), &(x, y)| (ax + x, ay + y));
    let cx = sx / blob.len();
    let cy = sy / blob.len();
    let radius = 2i64;
    let (w, h) = (frame.width as i64, frame.height as i64);
    if (cx as i64 - radius) < 0 || (cy as i64 - radius) < 0 || (cx as i64 + radius) >= w || (cy as i64 + radius) >= h {
        return None;
    }

    let mut row = Vec::with_capacity(5);
    for dx in -radius..=radius {
        row.push((frame.pixel((cx as i64 + dx) as usize, cy, 0) as f64 - background).max(0.0));
    }
    let peak = row.iter().cloned().fold(0.0, f64::max);
    if peak <= 0.0 {
        return None;
    }
    let half = peak / 2.0;
    let above = row.iter().filter(|&&v| v >= half).count();
    Some(above as f64)
}

fn iqr_filter(values: &[f64]) -> Vec<f64> {
    if values.len() < 4 {
        return values.to_vec();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q1 = sorted[sorted.len() / 4];
    let q3 = sorted[3 * sorted.len() / 4];
    let iqr = q3 - q1;
    let lo = q1 - 1.5 * iqr;
    let hi = q3 + 1.5 * iqr;
    sorted.into_iter().filter(|&v| v >= lo && v <= hi).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FocusFitMethod {
    Parabolic,
    Hyperbolic,
    RawMinimum,
}

/// `calculateBestFocus` (spec.md §4.4): tries a parabolic fit first, then a
/// hyperbolic (V-curve) fit, then falls back to the raw sample with the
/// lowest FWHM. Returns `None` only when there are no valid samples at all.
/// Quality is the fit's R^2 for the two model fits, and `0.0` for the raw
/// fallback (there is no model to score).
pub fn calculate_best_focus(samples: &[FocusCurveSample]) -> Option<(f64, FocusFitMethod, f64)> {
    let valid: Vec<&FocusCurveSample> = samples.iter().filter(|s| s.valid).collect();
    if valid.is_empty() {
        return None;
    }

    let xs: Vec<f64> = valid.iter().map(|s| s.position as f64).collect();
    let ys: Vec<f64> = valid.iter().map(|s| s.fwhm).collect();

    if let Some((pos, r2)) = fit_parabola(&xs, &ys) {
        if r2 >= 0.7 {
            return Some((pos, FocusFitMethod::Parabolic, r2));
        }
    }
    if let Some((pos, r2)) = fit_hyperbola(&xs, &ys) {
        if r2 >= 0.7 {
            return Some((pos, FocusFitMethod::Hyperbolic, r2));
        }
    }

    let best = valid.iter().min_by(|a, b| a.fwhm.total_cmp(&b.fwhm)).unwrap();
    Some((best.position as f64, FocusFitMethod::RawMinimum, 0.0))
}

/// Least-squares fit of `y = a*x^2 + b*x + c`; returns the vertex position
/// and R^2, or `None` if fewer than 3 points or the fit is degenerate
/// (non-upward-opening, i.e. `a <= 0`, since FWHM must have a minimum, not
/// a maximum, at best focus).
fn fit_parabola(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
    if xs.len() < 3 {
        return None;
    }
    let (a, b, c) = polyfit_quadratic(xs, ys)?;
    if a <= 0.0 {
        return None;
    }
    let vertex = -b / (2.0 * a);
    let predicted: Vec<f64> = xs.iter().map(|&x| a * x * x + b * x + c).collect();
    Some((vertex, r_squared(ys, &predicted)))
}

fn polyfit_quadratic(xs: &[f64], ys: &[f64]) -> Option<(f64, f64, f64)> {
    let n = xs.len() as f64;
    let (mut sx, mut sx2, mut sx3, mut sx4) = (0.0, 0.0, 0.0, 0.0);
    let (mut sy, mut sxy, mut sx2y) = (0.0, 0.0, 0.0);
    for (&x, &y) in xs.iter().zip(ys.iter()) {
        let x2 = x * x;
        sx += x;
        sx2 += x2;
        sx3 += x2 * x;
        sx4 += x2 * x2;
        sy += y;
        sxy += x * y;
        sx2y += x2 * y;
    }
    // Normal equations for least-squares quadratic, solved via Cramer's rule.
    let m = [[n, sx, sx2], [sx, sx2, sx3], [sx2, sx3, sx4]];
    let v = [sy, sxy, sx2y];
    solve_3x3(m, v).map(|sol| (sol[0], sol[1], sol[2]))
}

fn solve_3x3(m: [[f64; 3]; 3], v: [f64; 3]) -> Option<[f64; 3]> {
    let det = det3(m);
    if det.abs() < 1e-12 {
        return None;
    }
    let mut solution = [0.0; 3];
    for col in 0..3 {
        let mut mc = m;
        for row in 0..3 {
            mc[row][col] = v[row];
        }
        solution[col] = det3(mc) / det;
    }
    // Coefficients come back ordered (c, b, a) because column 0 of `m`
    // corresponds to the constant term; reorder to (a, b, c).
    Some([solution[2], solution[1], solution[0]])
}

fn det3(m: [[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Fits `y = a / sqrt((x-b)^2 + c) + d` (the hyperbolic V-curve model) via
/// Gauss-Newton iteration from a simple initial guess, returning the
/// fitted minimum position `b` and R^2.
fn fit_hyperbola(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
    if xs.len() < 4 {
        return None;
    }
    let min_idx = ys.iter().enumerate().min_by(|a, b| a.1.total_cmp(b.1))?.0;
    let mut b = xs[min_idx];
    let mut c = 1.0;
    let mut d = ys[min_idx] * 0.5;
    let mut a = (ys[min_idx] - d) * ((xs[min_idx] - b).powi(2) + c).sqrt();
    if a.abs() < 1e-6 {
        a = 1.0;
    }

    for _ in 0..200 {
        let mut jt_j = [[0.0; 4]; 4];
        let mut jt_r = [0.0; 4];
        for (&x, &y) in xs.iter().zip(ys.iter()) {
            let dx = x - b;
            let denom = (dx * dx + c).sqrt();
            if denom < 1e-9 {
                continue;
            }
            let model = a / denom + d;
            let residual = y - model;

            let d_a = 1.0 / denom;
            let d_b = a * dx / denom.powi(3);
            let d_c = -0.5 * a / denom.powi(3);
            let d_d = 1.0;
            let grad = [d_a, d_b, d_c, d_d];

            for i in 0..4 {
                jt_r[i] += grad[i] * residual;
                for j in 0..4 {
                    jt_j[i][j] += grad[i] * grad[j];
                }
            }
        }
        for i in 0..4 {
            jt_j[i][i] += 1e-6; // Levenberg damping for stability near-convergence.
        }
        let step = solve_4x4(jt_j, jt_r)?;
        a += step[0] * 0.5;
        b += step[1] * 0.5;
        c += step[2] * 0.5;
        d += step[3] * 0.5;
        if c <= 0.0 {
            c = 0.01;
        }
        if step.iter().all(|s| s.abs() < 1e-8) {
            break;
        }
    }

    let predicted: Vec<f64> = xs.iter().map(|&x| a / ((x - b).powi(2) + c).sqrt() + d).collect();
    Some((b, r_squared(ys, &predicted)))
}

fn solve_4x4(m: [[f64; 4]; 4], v: [f64; 4]) -> Option<[f64; 4]> {
    let mut aug = [[0.0; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            aug[i][j] = m[i][j];
        }
        aug[i][4] = v[i];
    }
    for i in 0..4 {
        let mut pivot_row = i;
        for r in (i + 1)..4 {
            if aug[r][i].abs() > aug[pivot_row][i].abs() {
                pivot_row = r;
            }
        }
        aug.swap(i, pivot_row);
        if aug[i][i].abs() < 1e-12 {
            return None;
        }
        for r in 0..4 {
            if r == i {
                continue;
            }
            let factor = aug[r][i] / aug[i][i];
            for c in i..5 {
                aug[r][c] -= factor * aug[i][c];
            }
        }
    }
    let mut out = [0.0; 4];
    for i in 0..4 {
        out[i] = aug[i][4] / aug[i][i];
    }
    Some(out)
}

fn r_squared(actual: &[f64], predicted: &[f64]) -> f64 {
    let mean = actual.iter().sum::<f64>() / actual.len() as f64;
    let ss_tot: f64 = actual.iter().map(|&y| (y - mean).powi(2)).sum();
    if ss_tot < 1e-12 {
        return 1.0;
    }
    let ss_res: f64 = actual.iter().zip(predicted.iter()).map(|(&y, &p)| (y - p).powi(2)).sum();
    (1.0 - ss_res / ss_tot).max(0.0)
}

/// Tracks sample spread across an autofocus run for telemetry purposes,
/// reusing the same accumulator the scheduler uses for ETA smoothing.
pub fn new_fwhm_accumulator(history_len: usize) -> ValueStatsAccumulator {
    ValueStatsAccumulator::new(history_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_parabola_recovers_known_vertex() {
        let xs: Vec<f64> = (0..11).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| 0.1 * (x - 6.0).powi(2) + 2.0).collect();
        let (vertex, r2) = fit_parabola(&xs, &ys).unwrap();
        assert!((vertex - 6.0).abs() < 0.01);
        assert!(r2 > 0.99);
    }

    #[test]
    fn test_fit_parabola_rejects_downward_opening() {
        let xs: Vec<f64> = (0..11).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| -0.1 * (x - 6.0).powi(2) + 2.0).collect();
        assert!(fit_parabola(&xs, &ys).is_none());
    }

    #[test]
    fn test_fit_hyperbola_recovers_known_minimum() {
        let xs: Vec<f64> = (0..15).map(|i| i as f64 - 7.0).collect();
        let true_b = 2.0;
        let ys: Vec<f64> = xs.iter().map(|&x| 3.0 / ((x - true_b).powi(2) + 1.0).sqrt() + 1.5).collect();
        let (b, r2) = fit_hyperbola(&xs, &ys).unwrap();
        assert!((b - true_b).abs() < 0.3, "b={b}");
        assert!(r2 > 0.9);
    }

    #[test]
    fn test_calculate_best_focus_falls_back_to_raw_minimum_on_noisy_data() {
        let samples = vec![
            FocusCurveSample { position: 0, fwhm: 5.0, star_count: 10, valid: true },
            FocusCurveSample { position: 10, fwhm: 1.0, star_count: 10, valid: true },
            FocusCurveSample { position: 20, fwhm: 8.0, star_count: 10, valid: true },
        ];
        let (pos, method, _quality) = calculate_best_focus(&samples).unwrap();
        assert_eq!(method, FocusFitMethod::RawMinimum);
        assert_eq!(pos, 10.0);
    }

    #[test]
    fn test_calculate_best_focus_none_when_no_valid_samples() {
        let samples = vec![FocusCurveSample { position: 0, fwhm: 5.0, star_count: 1, valid: false }];
        assert!(calculate_best_focus(&samples).is_none());
    }

    #[test]
    fn test_iqr_filter_drops_outlier() {
        let values = vec![2.0, 2.1, 2.2, 2.05, 50.0];
        let filtered = iqr_filter(&values);
        assert!(!filtered.contains(&50.0));
    }
}
