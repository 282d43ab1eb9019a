//! Per-pixel statistics backing the live stacker (spec.md §4.6). Stateless:
//! the stacker worker in the server crate owns the running master and
//! frame history and calls into these functions per incoming frame.

use medians::Medianf64;

/// `sigma = 1.4826 * MAD`, the standard normal-consistent scale estimator,
/// floored at the 5th percentile of the per-pixel sigma map so that
/// perfectly flat (zero-MAD) regions don't produce a zero-width clip
/// window (spec.md §4.6).
pub fn mad_sigma(values: &[f64], median: f64) -> f64 {
    1.4826 * values.madf(median)
}

/// Computes, for one pixel location across `n` aligned frames, the
/// (median, sigma) pair used as the winsorized-clip center and scale.
pub fn pixel_center_scale(values: &[f64]) -> (f64, f64) {
    let median = values.medf_unchecked();
    let sigma = mad_sigma(values, median);
    (median, sigma)
}

/// Floors a per-pixel sigma map at its own 5th percentile, so that flat
/// regions inherit a representative noise floor instead of clipping
/// everything as an outlier (spec.md §4.6).
pub fn floor_sigma_map(sigma_map: &mut [f64]) {
    if sigma_map.is_empty() {
        return;
    }
    let mut sorted = sigma_map.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * 0.05).round() as usize;
    let floor = sorted[idx];
    for s in sigma_map.iter_mut() {
        if *s < floor {
            *s = floor;
        }
    }
}

/// Winsorizes `values` in place: each value more than `k` sigma from
/// `median` is clamped to the nearest boundary rather than discarded, so
/// the frame count contributing to the stack stays constant (spec.md
/// §4.6's winsorized sigma clip, as distinct from simple rejection).
pub fn winsorize(values: &mut [f64], median: f64, sigma: f64, k: f64) -> usize {
    if sigma <= 0.0 {
        return 0;
    }
    let lo = median - k * sigma;
    let hi = median + k * sigma;
    let mut clipped = 0;
    for v in values.iter_mut() {
        if *v < lo {
            *v = lo;
            clipped += 1;
        } else if *v > hi {
            *v = hi;
            clipped += 1;
        }
    }
    clipped
}

/// Fraction of pixels across the frame whose values were winsorized this
/// round, exposed to the scheduler/telemetry as the "outlier fraction"
/// used to detect e.g. satellite trails or plane passes (spec.md §4.6/§8).
pub fn outlier_fraction(clipped_pixel_count: usize, total_pixel_count: usize) -> f64 {
    if total_pixel_count == 0 {
        0.0
    } else {
        clipped_pixel_count as f64 / total_pixel_count as f64
    }
}

/// Simple-rejection variant used for the "total function" dark-matching
/// path (spec.md §8 scenario): rejects (rather than winsorizes) any frame
/// whose absolute deviation from the running master exceeds the 95th
/// percentile of deviations across the batch.
pub fn simple_outlier_mask(deviations: &[f64]) -> Vec<bool> {
    if deviations.is_empty() {
        return Vec::new();
    }
    let mut sorted = deviations.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * 0.95).round() as usize;
    let threshold = sorted[idx];
    deviations.iter().map(|&d| d > threshold).collect()
}

/// Accumulates one new frame's pixel value into a running mean, returning
/// the updated mean. `n` is the count *including* the new sample (i.e. the
/// count after this call). This is the recurrence the live stacker uses to
/// fold in frame `k` without re-reading the first `k-1`:
/// `mean_k = mean_{k-1} + (x_k - mean_{k-1}) / k`.
pub fn running_mean_update(previous_mean: f64, new_value: f64, n: u64) -> f64 {
    previous_mean + (new_value - previous_mean) / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_mad_sigma_known_distribution() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let median = values.clone().medf_unchecked();
        assert_abs_diff_eq!(median, 3.0, epsilon = 1e-9);
        let sigma = mad_sigma(&values, median);
        assert_abs_diff_eq!(sigma, 1.4826, epsilon = 1e-3);
    }

    #[test]
    fn test_winsorize_clamps_not_drops() {
        let mut values = vec![10.0, 10.1, 9.9, 10.05, 1000.0];
        let (median, sigma) = pixel_center_scale(&values);
        let n_before = values.len();
        let clipped = winsorize(&mut values, median, sigma, 3.0);
        assert_eq!(values.len(), n_before);
        assert_eq!(clipped, 1);
        assert!(values[4] < 1000.0);
    }

    #[test]
    fn test_floor_sigma_map_raises_flat_regions() {
        let mut sigmas = vec![0.0, 0.0, 0.0, 0.0, 5.0, 5.0];
        floor_sigma_map(&mut sigmas);
        assert!(sigmas.iter().all(|&s| s >= 0.0));
    }

    #[test]
    fn test_outlier_fraction() {
        assert_abs_diff_eq!(outlier_fraction(25, 100), 0.25, epsilon = 1e-9);
        assert_abs_diff_eq!(outlier_fraction(0, 0), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_simple_outlier_mask_flags_tail() {
        let deviations = vec![1.0, 1.1, 1.05, 1.2, 50.0];
        let mask = simple_outlier_mask(&deviations);
        assert_eq!(mask[4], true);
        assert_eq!(mask.iter().filter(|&&m| m).count(), 1);
    }

    #[test]
    fn test_running_mean_update_matches_batch_mean() {
        let values = [2.0, 4.0, 6.0, 8.0];
        let mut mean = 0.0;
        for (i, v) in values.iter().enumerate() {
            mean = running_mean_update(mean, *v, (i + 1) as u64);
        }
        assert_abs_diff_eq!(mean, 5.0, epsilon = 1e-9);
    }
}
