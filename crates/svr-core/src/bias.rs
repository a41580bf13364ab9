use std::collections::BTreeMap;

use crate::consts::{COVERAGE_FLOOR, DEFAULT_SIGMA_BIAS, EPSILON};
use crate::geometry::gaussian_blur_2d;
use crate::slice::Slice;

/// One-time per-stack intensity normalization, run once before the outer
/// iteration loop starts (the reconstructed volume and its PSF tables
/// don't exist yet, so there is no `inside_mask`/`coverage` to key off;
/// positive intensity stands in for "foreground" the way the original
/// masked intensity-matching routine does). Rescales every slice's pixel
/// data by its stack's single multiplicative factor so each stack's mean
/// foreground intensity equals `target`.
pub fn match_stack_intensities(slices: &mut [Slice], target: f64) {
    let mut totals: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
    for slice in slices.iter() {
        if slice.force_excluded {
            continue;
        }
        let entry = totals.entry(slice.stack_index).or_insert((0.0, 0));
        for &y in slice.pixels.iter() {
            let y = y as f64;
            if y > COVERAGE_FLOOR {
                entry.0 += y;
                entry.1 += 1;
            }
        }
    }

    for slice in slices.iter_mut() {
        if slice.force_excluded {
            continue;
        }
        if let Some(&(sum, count)) = totals.get(&slice.stack_index) {
            if count == 0 {
                continue;
            }
            let mean = sum / count as f64;
            if mean > EPSILON {
                let factor = (target / mean) as f32;
                slice.pixels.mapv_inplace(|v| v * factor);
            }
        }
    }
}

/// Closed-form weighted scale and log-domain bias estimation (component
/// 4.5). `sigma_bias_mm` is the bias field's smoothing length in mm,
/// converted to pixels via the slice's in-plane spacing.
pub fn update_scale_and_bias(slice: &mut Slice, sigma_bias_mm: f64) {
    update_scale(slice);
    update_bias(slice, sigma_bias_mm);
}

/// `scale = sum(w*y_hat*y) / sum(w*y_hat*y_hat)` over in-mask, covered
/// pixels — the closed-form minimizer of `sum(w*(y*exp(-b) - s*y_hat)^2)`
/// holding bias fixed.
fn update_scale(slice: &mut Slice) {
    let (rows, cols) = slice.dims();
    let mut num = 0.0f64;
    let mut den = 0.0f64;
    for row in 0..rows {
        for col in 0..cols {
            if !usable(slice, row, col) {
                continue;
            }
            let w = (slice.pixel_weight[[row, col]] * slice.slice_weight) as f64;
            let y = slice.pixels[[row, col]] as f64 * (-(slice.bias[[row, col]] as f64)).exp();
            let y_hat = slice.simulated[[row, col]] as f64;
            num += w * y_hat * y;
            den += w * y_hat * y_hat;
        }
    }
    if den > EPSILON {
        slice.scale = (num / den).max(EPSILON) as f32;
    }
}

/// Per-pixel log-domain bias `b = log(y_hat/y)`, smoothed with a
/// Gaussian of sigma `sigma_bias_mm` (converted to pixels) and then
/// zero-mean clipped over the in-mask region, so the bias field only
/// redistributes intensity rather than scaling it globally (that is the
/// job of `scale`).
fn update_bias(slice: &mut Slice, sigma_bias_mm: f64) {
    let (rows, cols) = slice.dims();
    let spacing = slice.in_plane_spacing().max(EPSILON);
    let sigma_px = sigma_bias_mm / spacing;

    let mut raw = slice.bias.clone();
    for row in 0..rows {
        for col in 0..cols {
            if !usable(slice, row, col) {
                raw[[row, col]] = 0.0;
                continue;
            }
            let y = (slice.pixels[[row, col]] as f64 * slice.scale as f64).max(EPSILON);
            let y_hat = slice.simulated[[row, col]] as f64;
            raw[[row, col]] = (y_hat.max(EPSILON) / y).ln() as f32;
        }
    }

    let smoothed = gaussian_blur_2d(&raw, sigma_px, sigma_px);

    let mut sum = 0.0f64;
    let mut count = 0usize;
    for row in 0..rows {
        for col in 0..cols {
            if usable(slice, row, col) {
                sum += smoothed[[row, col]] as f64;
                count += 1;
            }
        }
    }
    let mean = if count > 0 { sum / count as f64 } else { 0.0 };

    for row in 0..rows {
        for col in 0..cols {
            slice.bias[[row, col]] = (smoothed[[row, col]] as f64 - mean) as f32;
        }
    }
}

fn usable(slice: &Slice, row: usize, col: usize) -> bool {
    slice.inside_mask[[row, col]] && slice.coverage[[row, col]] as f64 >= COVERAGE_FLOOR
}

/// Runs [`update_scale_and_bias`] for every active slice, using the
/// default bias smoothing length unless overridden.
pub fn update_all(slices: &mut [Slice], sigma_bias_mm: Option<f64>) {
    let sigma = sigma_bias_mm.unwrap_or(DEFAULT_SIGMA_BIAS);
    for slice in slices.iter_mut() {
        if slice.is_active() {
            update_scale_and_bias(slice, sigma);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Affine3, RigidTransform, Vec3};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn make_slice(y: f32, y_hat: f32) -> Slice {
        let pixels = Array2::from_elem((4, 4), y);
        let geometry = Affine3::identity(Vec3::new(1.0, 1.0, 1.0));
        let mut s = Slice::new(pixels, geometry, 1.0, RigidTransform::identity(), 0, 0);
        s.inside_mask.fill(true);
        s.coverage.fill(1.0);
        s.simulated.fill(y_hat);
        s
    }

    #[test]
    fn matched_intensities_leave_scale_near_one() {
        let mut s = make_slice(10.0, 10.0);
        update_scale(&mut s);
        assert_abs_diff_eq!(s.scale, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn scale_compensates_uniform_intensity_offset() {
        // y=5, y_hat=10: applying scale=0.5 to the observed intensity
        // (y*exp(-b)/s, per the data-term convention) recovers y_hat.
        let mut s = make_slice(5.0, 10.0);
        update_scale(&mut s);
        assert_abs_diff_eq!(s.scale, 0.5, epsilon = 1e-3);
    }

    #[test]
    fn bias_field_is_zero_mean_inside_mask() {
        let mut s = make_slice(10.0, 12.0);
        s.simulated[[0, 0]] = 20.0; // introduce spatial variation
        update_bias(&mut s, 5.0);
        let sum: f64 = s.bias.iter().map(|b| *b as f64).sum();
        assert!((sum / s.bias.len() as f64).abs() < 1e-4);
    }

    #[test]
    fn uncovered_pixels_keep_zero_bias() {
        let mut s = make_slice(10.0, 10.0);
        s.coverage[[0, 0]] = 0.0;
        s.inside_mask[[0, 0]] = false;
        update_bias(&mut s, 5.0);
        assert_eq!(s.bias[[0, 0]], 0.0);
    }

    #[test]
    fn match_stack_intensities_hits_target_mean() {
        let mut slices = vec![make_slice(50.0, 0.0), make_slice(50.0, 0.0)];
        match_stack_intensities(&mut slices, 700.0);
        for slice in &slices {
            let mean: f64 = slice.pixels.iter().map(|v| *v as f64).sum::<f64>() / slice.pixels.len() as f64;
            assert_abs_diff_eq!(mean, 700.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn match_stack_intensities_scales_stacks_independently() {
        let mut slices = vec![make_slice(50.0, 0.0), make_slice(100.0, 0.0)];
        slices[1].stack_index = 1;
        match_stack_intensities(&mut slices, 700.0);
        let mean = |s: &Slice| -> f64 { s.pixels.iter().map(|v| *v as f64).sum::<f64>() / s.pixels.len() as f64 };
        assert_abs_diff_eq!(mean(&slices[0]), 700.0, epsilon = 1e-3);
        assert_abs_diff_eq!(mean(&slices[1]), 700.0, epsilon = 1e-3);
    }

    #[test]
    fn force_excluded_stack_is_left_untouched() {
        let mut slices = vec![make_slice(50.0, 0.0)];
        slices[0].force_excluded = true;
        match_stack_intensities(&mut slices, 700.0);
        let mean: f64 = slices[0].pixels.iter().map(|v| *v as f64).sum::<f64>() / slices[0].pixels.len() as f64;
        assert_abs_diff_eq!(mean, 50.0, epsilon = 1e-6);
    }
}
