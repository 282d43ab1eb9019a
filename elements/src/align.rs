//! Frame-to-frame alignment for the live stacker (spec.md §4.6 step 5).
//! Tracked amateur rigs drift by a few pixels between frames rather than
//! rotating or rescaling, so alignment here is translation-only: the
//! offset that maximizes normalized cross-correlation between a frame and
//! the stacking reference, found by a bounded local search rather than a
//! full feature-matching pipeline.

use crate::fits::Frame;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Shift {
    pub dx: i32,
    pub dy: i32,
}

/// Searches `[-max_shift, max_shift]` in both axes for the integer
/// translation of `frame` (one mono plane) relative to `reference` that
/// maximizes normalized cross-correlation over their overlapping region.
pub fn estimate_shift(reference: &Frame, frame: &Frame, max_shift: i32) -> Result<Shift, AlignmentError> {
    if reference.width != frame.width || reference.height != frame.height {
        return Err(AlignmentError::DimensionMismatch);
    }
    let (w, h) = (reference.width as i32, reference.height as i32);
    if w <= 2 * max_shift || h <= 2 * max_shift {
        return Err(AlignmentError::FrameTooSmall);
    }

    let mut best = Shift { dx: 0, dy: 0 };
    let mut best_score = f64::NEG_INFINITY;
    for dy in -max_shift..=max_shift {
        for dx in -max_shift..=max_shift {
            let score = correlation(reference, frame, dx, dy, max_shift);
            if score > best_score {
                best_score = score;
                best = Shift { dx, dy };
            }
        }
    }
    if !best_score.is_finite() {
        return Err(AlignmentError::DegenerateCorrelation);
    }
    Ok(best)
}

fn correlation(reference: &Frame, frame: &Frame, dx: i32, dy: i32, margin: i32) -> f64 {
    let (w, h) = (reference.width as i32, reference.height as i32);
    let mut sum_ref = 0.0;
    let mut sum_frame = 0.0;
    let mut sum_ref2 = 0.0;
    let mut sum_frame2 = 0.0;
    let mut sum_cross = 0.0;
    let mut n = 0.0;

    for y in margin..(h - margin) {
        for x in margin..(w - margin) {
            let rv = reference.pixel(x as usize, y as usize, 0) as f64;
            let fx = x + dx;
            let fy = y + dy;
            if fx < 0 || fy < 0 || fx >= w || fy >= h {
                continue;
            }
            let fv = frame.pixel(fx as usize, fy as usize, 0) as f64;
            sum_ref += rv;
            sum_frame += fv;
            sum_ref2 += rv * rv;
            sum_frame2 += fv * fv;
            sum_cross += rv * fv;
            n += 1.0;
        }
    }
    if n < 1.0 {
        return f64::NEG_INFINITY;
    }
    let mean_ref = sum_ref / n;
    let mean_frame = sum_frame / n;
    let cov = sum_cross / n - mean_ref * mean_frame;
    let var_ref = (sum_ref2 / n - mean_ref * mean_ref).max(1e-12);
    let var_frame = (sum_frame2 / n - mean_frame * mean_frame).max(1e-12);
    cov / (var_ref.sqrt() * var_frame.sqrt())
}

/// Applies an integer translation to `frame`, filling the uncovered
/// border with the frame's own mean value so the shifted frame still
/// participates in per-pixel stacking statistics without introducing a
/// hard zero edge.
pub fn apply_shift(frame: &Frame, shift: Shift) -> Frame {
    let (w, h) = (frame.width as i32, frame.height as i32);
    let fill: f32 = (frame.data.iter().sum::<f32>() / frame.data.len().max(1) as f32).max(0.0);
    let mut out = vec![fill; frame.data.len()];
    for c in 0..frame.channels {
        for y in 0..h {
            for x in 0..w {
                let sx = x - shift.dx;
                let sy = y - shift.dy;
                if sx < 0 || sy < 0 || sx >= w || sy >= h {
                    continue;
                }
                out[(y as usize * frame.width + x as usize) * frame.channels + c] =
                    frame.pixel(sx as usize, sy as usize, c);
            }
        }
    }
    Frame { data: out, ..frame.clone() }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignmentError {
    DimensionMismatch,
    FrameTooSmall,
    DegenerateCorrelation,
}

impl std::fmt::Display for AlignmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlignmentError::DimensionMismatch => write!(f, "frame dimensions do not match reference"),
            AlignmentError::FrameTooSmall => write!(f, "frame too small for requested search radius"),
            AlignmentError::DegenerateCorrelation => write!(f, "no valid correlation window found"),
        }
    }
}

impl std::error::Error for AlignmentError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits::Frame;

    fn gradient(w: usize, h: usize) -> Frame {
        let mut data = vec![0f32; w * h];
        for y in 0..h {
            for x in 0..w {
                data[y * w + x] = ((x * 7 + y * 13) % 97) as f32;
            }
        }
        Frame::new_mono(w, h, data)
    }

    #[test]
    fn test_estimate_shift_recovers_known_translation() {
        let reference = gradient(40, 40);
        let shifted = apply_shift(&reference, Shift { dx: 3, dy: -2 });
        // apply_shift(frame, s) places frame content such that a search
        // should find the shift that maps `shifted` back onto `reference`.
        let found = estimate_shift(&reference, &shifted, 6).unwrap();
        assert_eq!(found, Shift { dx: 3, dy: -2 });
    }

    #[test]
    fn test_estimate_shift_zero_for_identical_frames() {
        let frame = gradient(30, 30);
        let found = estimate_shift(&frame, &frame, 4).unwrap();
        assert_eq!(found, Shift { dx: 0, dy: 0 });
    }

    #[test]
    fn test_estimate_shift_rejects_mismatched_dimensions() {
        let a = gradient(20, 20);
        let b = gradient(25, 20);
        assert!(matches!(estimate_shift(&a, &b, 4), Err(AlignmentError::DimensionMismatch)));
    }
}
