use tracing::debug;

use crate::consts::{COVERAGE_FLOOR, DEFAULT_EXCLUSION_NCC, DEFAULT_SSIM_THRESHOLD, EPSILON};
use crate::slice::Slice;

const SSIM_WINDOW: usize = 11;
const SSIM_C1: f64 = 6.5025; // (0.01*255)^2, scaled at call sites via dynamic range
const SSIM_C2: f64 = 58.5225; // (0.03*255)^2

/// Global NCC gate (component 4.7): slices whose simulated/real NCC falls
/// below `threshold` are flagged structurally excluded for this outer
/// iteration. Force-excluded slices are left untouched (they are
/// already permanently out).
pub fn global_ncc_gate(slices: &mut [Slice], threshold: f64) {
    for slice in slices.iter_mut() {
        if slice.force_excluded || !slice.is_active() {
            continue;
        }
        let ncc = slice_ncc(slice);
        if ncc < threshold {
            debug!(ncc, threshold, "slice failed global NCC gate");
            slice.structurally_excluded = true;
        }
    }
}

pub fn global_ncc_gate_default(slices: &mut [Slice]) {
    global_ncc_gate(slices, DEFAULT_EXCLUSION_NCC);
}

fn slice_ncc(slice: &Slice) -> f64 {
    let (rows, cols) = slice.dims();
    let mut sum_y = 0.0f64;
    let mut sum_yh = 0.0f64;
    let mut count = 0usize;
    for row in 0..rows {
        for col in 0..cols {
            if usable(slice, row, col) {
                sum_y += slice.pixels[[row, col]] as f64;
                sum_yh += slice.simulated[[row, col]] as f64;
                count += 1;
            }
        }
    }
    if count == 0 {
        return 0.0;
    }
    let mean_y = sum_y / count as f64;
    let mean_yh = sum_yh / count as f64;

    let mut cov = 0.0f64;
    let mut var_y = 0.0f64;
    let mut var_yh = 0.0f64;
    for row in 0..rows {
        for col in 0..cols {
            if usable(slice, row, col) {
                let dy = slice.pixels[[row, col]] as f64 - mean_y;
                let dyh = slice.simulated[[row, col]] as f64 - mean_yh;
                cov += dy * dyh;
                var_y += dy * dy;
                var_yh += dyh * dyh;
            }
        }
    }
    let denom = (var_y * var_yh).sqrt();
    if denom > EPSILON {
        cov / denom
    } else {
        0.0
    }
}

/// Local SSIM gate (component 4.7): an 11x11 windowed SSIM map between
/// real and simulated pixels; pixels below `threshold` are zeroed out of
/// the slice's per-pixel weight for this outer iteration (their EM
/// weight is not re-estimated, it is simply masked).
pub fn local_ssim_gate(slices: &mut [Slice], threshold: f64) {
    for slice in slices.iter_mut() {
        if !slice.is_active() {
            continue;
        }
        let map = ssim_map(slice);
        let (rows, cols) = slice.dims();
        for row in 0..rows {
            for col in 0..cols {
                if map[[row, col]] < threshold {
                    slice.pixel_weight[[row, col]] = 0.0;
                }
            }
        }
    }
}

pub fn local_ssim_gate_default(slices: &mut [Slice]) {
    local_ssim_gate(slices, DEFAULT_SSIM_THRESHOLD);
}

fn ssim_map(slice: &Slice) -> ndarray::Array2<f64> {
    let (rows, cols) = slice.dims();
    let radius = (SSIM_WINDOW / 2) as isize;
    let mut map = ndarray::Array2::<f64>::zeros((rows, cols));

    for row in 0..rows {
        for col in 0..cols {
            if !usable(slice, row, col) {
                continue;
            }
            let mut sum_y = 0.0f64;
            let mut sum_yh = 0.0f64;
            let mut n = 0.0f64;
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let r = row as isize + dy;
                    let c = col as isize + dx;
                    if r < 0 || r >= rows as isize || c < 0 || c >= cols as isize {
                        continue;
                    }
                    let (r, c) = (r as usize, c as usize);
                    if !usable(slice, r, c) {
                        continue;
                    }
                    sum_y += slice.pixels[[r, c]] as f64;
                    sum_yh += slice.simulated[[r, c]] as f64;
                    n += 1.0;
                }
            }
            if n < 1.0 {
                continue;
            }
            let mean_y = sum_y / n;
            let mean_yh = sum_yh / n;

            let mut var_y = 0.0f64;
            let mut var_yh = 0.0f64;
            let mut cov = 0.0f64;
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let r = row as isize + dy;
                    let c = col as isize + dx;
                    if r < 0 || r >= rows as isize || c < 0 || c >= cols as isize {
                        continue;
                    }
                    let (r, c) = (r as usize, c as usize);
                    if !usable(slice, r, c) {
                        continue;
                    }
                    let dy_v = slice.pixels[[r, c]] as f64 - mean_y;
                    let dyh_v = slice.simulated[[r, c]] as f64 - mean_yh;
                    var_y += dy_v * dy_v;
                    var_yh += dyh_v * dyh_v;
                    cov += dy_v * dyh_v;
                }
            }
            var_y /= n;
            var_yh /= n;
            cov /= n;

            let numerator = (2.0 * mean_y * mean_yh + SSIM_C1) * (2.0 * cov + SSIM_C2);
            let denominator = (mean_y * mean_y + mean_yh * mean_yh + SSIM_C1) * (var_y + var_yh + SSIM_C2);
            map[[row, col]] = if denominator > EPSILON { numerator / denominator } else { 1.0 };
        }
    }
    map
}

fn usable(slice: &Slice, row: usize, col: usize) -> bool {
    slice.inside_mask[[row, col]] && slice.coverage[[row, col]] as f64 >= COVERAGE_FLOOR
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Affine3, RigidTransform, Vec3};
    use ndarray::Array2;

    fn make_matching_slice() -> Slice {
        let pixels = Array2::from_elem((12, 12), 10.0f32);
        let geometry = Affine3::identity(Vec3::new(1.0, 1.0, 1.0));
        let mut s = Slice::new(pixels, geometry, 1.0, RigidTransform::identity(), 0, 0);
        s.inside_mask.fill(true);
        s.coverage.fill(1.0);
        s.simulated.fill(10.0);
        s
    }

    #[test]
    fn identical_slice_passes_ncc_gate() {
        let mut slices = vec![make_matching_slice()];
        global_ncc_gate_default(&mut slices);
        assert!(!slices[0].structurally_excluded);
    }

    #[test]
    fn noisy_mismatch_fails_ncc_gate() {
        let mut slice = make_matching_slice();
        for (i, v) in slice.simulated.iter_mut().enumerate() {
            *v = if i % 2 == 0 { 0.0 } else { 100.0 };
        }
        let mut slices = vec![slice];
        global_ncc_gate_default(&mut slices);
        assert!(slices[0].structurally_excluded);
    }

    #[test]
    fn force_excluded_slice_is_untouched_by_gate() {
        let mut slice = make_matching_slice();
        slice.force_excluded = true;
        let mut slices = vec![slice];
        global_ncc_gate_default(&mut slices);
        assert!(!slices[0].structurally_excluded);
    }

    #[test]
    fn identical_regions_have_ssim_near_one() {
        let mut slices = vec![make_matching_slice()];
        local_ssim_gate_default(&mut slices);
        assert!(slices[0].pixel_weight[[6, 6]] > 0.0);
    }
}
