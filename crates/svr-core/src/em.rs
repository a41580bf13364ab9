use tracing::warn;

use crate::consts::{COVERAGE_FLOOR, DEFAULT_P_INLIER, DEFAULT_SLICE_CLASS_PRIOR_GOOD, EPSILON};
use crate::slice::Slice;

/// Global EM / robust-statistics parameters, shared across all slices
/// (component 4.4, plus the slice-class mixture used for per-slice
/// weights `W_k`).
#[derive(Clone, Debug)]
pub struct RobustStats {
    pub sigma2_in: f64,
    pub p_inlier: f64,
    pub outlier_min: f64,
    pub outlier_max: f64,

    pub slice_mean_good: f64,
    pub slice_var_good: f64,
    pub slice_mean_bad: f64,
    pub slice_var_bad: f64,
    pub slice_class_prior_good: f64,
}

impl RobustStats {
    /// Initial values per component 4.4: `sigma2_in = (max-min)^2/36`,
    /// `p_inlier = 0.9`, slice-class prior good = 0.9.
    pub fn init(min: f64, max: f64) -> Self {
        let range = (max - min).max(EPSILON);
        Self {
            sigma2_in: (range * range) / 36.0,
            p_inlier: DEFAULT_P_INLIER,
            outlier_min: min,
            outlier_max: max,
            slice_mean_good: 1.0,
            slice_var_good: 0.01,
            slice_mean_bad: 0.0,
            slice_var_bad: 0.05,
            slice_class_prior_good: DEFAULT_SLICE_CLASS_PRIOR_GOOD,
        }
    }

    fn uniform_density(&self) -> f64 {
        1.0 / (self.outlier_max - self.outlier_min).max(EPSILON)
    }
}

fn gaussian_density(r: f64, variance: f64) -> f64 {
    let v = variance.max(EPSILON);
    (-0.5 * r * r / v).exp() / (2.0 * std::f64::consts::PI * v).sqrt()
}

/// Corrected residual `y*exp(-b)/s - y_hat` for slice pixel `(row, col)` —
/// the quantity the EM mixture and the SR data term both operate on.
pub fn residual(slice: &Slice, row: usize, col: usize) -> f64 {
    let y = slice.pixels[[row, col]] as f64;
    let b = slice.bias[[row, col]] as f64;
    let s = (slice.scale as f64).max(EPSILON);
    let y_hat = slice.simulated[[row, col]] as f64;
    y * (-b).exp() / s - y_hat
}

/// Scans all active, in-mask, sufficiently-covered pixels to find the
/// observed intensity range, for [`RobustStats::init`].
pub fn observed_range(slices: &[Slice]) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for slice in slices {
        if !slice.is_active() {
            continue;
        }
        let (rows, cols) = slice.dims();
        for row in 0..rows {
            for col in 0..cols {
                if slice.inside_mask[[row, col]] && slice.coverage[[row, col]] as f64 >= COVERAGE_FLOOR {
                    let v = slice.pixels[[row, col]] as f64;
                    min = min.min(v);
                    max = max.max(v);
                }
            }
        }
    }
    if !min.is_finite() || !max.is_finite() || max <= min {
        (0.0, 1.0)
    } else {
        (min, max)
    }
}

/// `w <- p_in*N(r;0,sigma2_in) / (p_in*N + (1-p_in)*uniform_density)` for
/// one pixel, the shared posterior computation behind both
/// [`e_step_pixels`] (which persists it into `pixel_weight`) and
/// [`slice_inlier_feature`] (which only needs it transiently, so slice
/// classification stays meaningful even when `exclude_slices_only`
/// skips persisting per-pixel weights).
fn pixel_inlier_posterior(slice: &Slice, row: usize, col: usize, stats: &RobustStats, uniform: f64) -> f64 {
    let r = residual(slice, row, col);
    let inlier = stats.p_inlier * gaussian_density(r, stats.sigma2_in);
    let outlier = (1.0 - stats.p_inlier) * uniform;
    let denom = inlier + outlier;
    if denom > EPSILON {
        (inlier / denom).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// E-step (per pixel): `w_kij <- p_in*N(r;0,sigma2_in) / (p_in*N + (1-p_in)*uniform_density)`.
/// Pixels outside mask or below the coverage floor get `w = 0`.
pub fn e_step_pixels(slices: &mut [Slice], stats: &RobustStats) {
    let uniform = stats.uniform_density();
    for slice in slices.iter_mut() {
        let active = slice.is_active();
        let (rows, cols) = slice.dims();
        for row in 0..rows {
            for col in 0..cols {
                if !active || !slice.inside_mask[[row, col]] || (slice.coverage[[row, col]] as f64) < COVERAGE_FLOOR {
                    slice.pixel_weight[[row, col]] = 0.0;
                    continue;
                }
                let w = pixel_inlier_posterior(slice, row, col, stats, uniform);
                slice.pixel_weight[[row, col]] = w as f32;
            }
        }
    }
}

/// E-step (per slice): fit the slice-level good/bad Gaussian mixture to
/// each slice's average in-mask inlier posterior, producing `W_k`.
/// Force-excluded slices get `W = 0`. The feature is computed directly
/// from residuals and `stats`, not from the stored `pixel_weight` array,
/// so slice classification stays meaningful under `exclude_slices_only`
/// (where `pixel_weight` is pinned to 1 and never populated by
/// [`e_step_pixels`]).
pub fn e_step_slices(slices: &mut [Slice], stats: &RobustStats) {
    for slice in slices.iter_mut() {
        if slice.force_excluded {
            slice.slice_weight = 0.0;
            continue;
        }
        let feature = slice_inlier_feature(slice, stats);
        let good = stats.slice_class_prior_good * gaussian_density(feature - stats.slice_mean_good, stats.slice_var_good);
        let bad = (1.0 - stats.slice_class_prior_good)
            * gaussian_density(feature - stats.slice_mean_bad, stats.slice_var_bad);
        let denom = good + bad;
        slice.slice_weight = if denom > EPSILON { (good / denom).clamp(0.0, 1.0) as f32 } else { 0.0 };
    }
}

fn slice_inlier_feature(slice: &Slice, stats: &RobustStats) -> f64 {
    let uniform = stats.uniform_density();
    let (rows, cols) = slice.dims();
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for row in 0..rows {
        for col in 0..cols {
            if slice.inside_mask[[row, col]] && (slice.coverage[[row, col]] as f64) >= COVERAGE_FLOOR {
                sum += pixel_inlier_posterior(slice, row, col, stats, uniform);
                count += 1;
            }
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// M-step: `sigma2_in` <- weighted variance of residuals across all
/// slices; `p_in` <- weighted mean of `w`; slice-class statistics
/// updated analogously over the slice-level feature. Degenerate
/// (near-zero) variances are floored and logged rather than propagated
/// (`NumericDegenerate`, non-fatal).
pub fn m_step(slices: &[Slice], stats: &mut RobustStats) {
    let mut weighted_sq_sum = 0.0f64;
    let mut weight_sum = 0.0f64;
    let mut w_sum = 0.0f64;
    let mut w_count = 0.0f64;

    for slice in slices {
        if !slice.is_active() {
            continue;
        }
        let (rows, cols) = slice.dims();
        let wk = slice.slice_weight as f64;
        for row in 0..rows {
            for col in 0..cols {
                if !slice.inside_mask[[row, col]] || (slice.coverage[[row, col]] as f64) < COVERAGE_FLOOR {
                    continue;
                }
                let w = slice.pixel_weight[[row, col]] as f64;
                let r = residual(slice, row, col);
                let combined = wk * w;
                weighted_sq_sum += combined * r * r;
                weight_sum += combined;
                w_sum += w;
                w_count += 1.0;
            }
        }
    }

    if weight_sum > EPSILON {
        stats.sigma2_in = weighted_sq_sum / weight_sum;
    }
    if stats.sigma2_in < EPSILON {
        warn!(floor = EPSILON, "inlier variance underflowed, flooring");
        stats.sigma2_in = EPSILON;
    }

    if w_count > 0.0 {
        stats.p_inlier = (w_sum / w_count).clamp(1e-3, 1.0 - 1e-3);
    }

    update_slice_class_statistics(slices, stats);
}

fn update_slice_class_statistics(slices: &[Slice], stats: &mut RobustStats) {
    let features: Vec<(f64, f64)> = slices
        .iter()
        .filter(|s| !s.force_excluded)
        .map(|s| (slice_inlier_feature(s, stats), s.slice_weight as f64))
        .collect();

    if features.is_empty() {
        return;
    }

    let good_weight_sum: f64 = features.iter().map(|(_, w)| *w).sum();
    let bad_weight_sum: f64 = features.iter().map(|(_, w)| 1.0 - w).sum();

    if good_weight_sum > EPSILON {
        let mean = features.iter().map(|(x, w)| x * w).sum::<f64>() / good_weight_sum;
        let var = features.iter().map(|(x, w)| w * (x - mean).powi(2)).sum::<f64>() / good_weight_sum;
        stats.slice_mean_good = mean;
        stats.slice_var_good = var.max(EPSILON);
    }
    if bad_weight_sum > EPSILON {
        let mean = features.iter().map(|(x, w)| x * (1.0 - w)).sum::<f64>() / bad_weight_sum;
        let var = features.iter().map(|(x, w)| (1.0 - w) * (x - mean).powi(2)).sum::<f64>() / bad_weight_sum;
        stats.slice_mean_bad = mean;
        stats.slice_var_bad = var.max(EPSILON);
    }
    stats.slice_class_prior_good = (good_weight_sum / features.len() as f64).clamp(1e-3, 1.0 - 1e-3);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Affine3, RigidTransform, Vec3};
    use ndarray::Array2;

    fn make_slice_with_residual(r: f64) -> Slice {
        let pixels = Array2::from_elem((2, 2), r as f32);
        let geometry = Affine3::identity(Vec3::new(1.0, 1.0, 1.0));
        let mut s = Slice::new(pixels, geometry, 1.0, RigidTransform::identity(), 0, 0);
        s.inside_mask.fill(true);
        s.coverage.fill(1.0);
        s.simulated.fill(0.0);
        s
    }

    #[test]
    fn pixel_weights_stay_in_unit_interval() {
        let mut slices = vec![make_slice_with_residual(0.0), make_slice_with_residual(50.0)];
        let stats = RobustStats::init(0.0, 10.0);
        e_step_pixels(&mut slices, &stats);
        for slice in &slices {
            for w in slice.pixel_weight.iter() {
                assert!(*w >= 0.0 && *w <= 1.0);
            }
        }
    }

    #[test]
    fn inlier_pixel_gets_higher_weight_than_outlier() {
        let mut slices = vec![make_slice_with_residual(0.0), make_slice_with_residual(1000.0)];
        let stats = RobustStats::init(0.0, 10.0);
        e_step_pixels(&mut slices, &stats);
        assert!(slices[0].pixel_weight[[0, 0]] > slices[1].pixel_weight[[0, 0]]);
    }

    #[test]
    fn slice_weights_stay_in_unit_interval() {
        let mut slices = vec![make_slice_with_residual(0.0), make_slice_with_residual(1000.0)];
        let stats = RobustStats::init(0.0, 10.0);
        e_step_pixels(&mut slices, &stats);
        e_step_slices(&mut slices, &stats);
        for slice in &slices {
            assert!(slice.slice_weight >= 0.0 && slice.slice_weight <= 1.0);
        }
    }

    #[test]
    fn force_excluded_slice_gets_zero_weight() {
        let mut slices = vec![make_slice_with_residual(0.0)];
        slices[0].force_excluded = true;
        let stats = RobustStats::init(0.0, 10.0);
        e_step_slices(&mut slices, &stats);
        assert_eq!(slices[0].slice_weight, 0.0);
    }

    #[test]
    fn m_step_never_collapses_variance_to_zero() {
        let mut slices = vec![make_slice_with_residual(0.0)];
        let mut stats = RobustStats::init(0.0, 10.0);
        e_step_pixels(&mut slices, &stats);
        e_step_slices(&mut slices, &stats);
        m_step(&slices, &mut stats);
        assert!(stats.sigma2_in > 0.0);
    }
}
