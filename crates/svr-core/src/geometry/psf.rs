use ndarray::Array2;

use super::affine::{Affine3, RigidTransform};
use super::vecmath::Vec3;
use crate::consts::{PSF_INPLANE_SIGMA_FACTOR, PSF_PRUNE_CUTOFF, PSF_THROUGHPLANE_SIGMA_FACTOR};

/// One (reconstructed-volume voxel, weight) contribution of a slice pixel.
#[derive(Clone, Copy, Debug)]
pub struct PsfEntry {
    pub voxel_index: usize,
    pub weight: f32,
}

/// Abramowitz & Stegun 7.1.26 rational approximation of erf, max error
/// ~1.5e-7 — adequate for normalizing PSF weights to 1e-6.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

/// Integral of N(0, sigma^2) over [u - half, u + half].
fn gaussian_cell_integral(u: f64, half: f64, sigma: f64) -> f64 {
    if sigma <= 0.0 {
        return if u.abs() <= half { 1.0 } else { 0.0 };
    }
    let denom = sigma * std::f64::consts::SQRT_2;
    0.5 * (erf((u + half) / denom) - erf((u - half) / denom))
}

/// For one slice pixel, builds the sparse list of reconstructed-volume
/// voxels the anisotropic slice PSF contributes to.
///
/// `pixel_world` is the world-space centre of the slice pixel (already
/// composed through the slice-to-volume rigid transform). `slice_axes`
/// gives the slice's in-plane x/y and through-plane z unit directions in
/// world space (the PSF covariance is diagonal in this local frame, then
/// rotated into world space). `in_plane_spacing` and `thickness` set the
/// PSF sigmas per component 4.1 of the design.
#[allow(clippy::too_many_arguments)]
pub fn build_pixel_psf(
    pixel_world: Vec3,
    slice_axes: &super::vecmath::Mat3,
    in_plane_spacing: f64,
    thickness: f64,
    volume_affine: &Affine3,
    volume_dims: (usize, usize, usize),
) -> Vec<PsfEntry> {
    let sigma_xy = PSF_INPLANE_SIGMA_FACTOR * in_plane_spacing;
    let sigma_z = PSF_THROUGHPLANE_SIGMA_FACTOR * thickness;

    let (vd, vh, vw) = volume_dims;
    let spacing = volume_affine.spacing;
    let radius_vox_x = ((2.0 * sigma_xy) / spacing.x).ceil() as i64;
    let radius_vox_y = ((2.0 * sigma_xy) / spacing.y).ceil() as i64;
    let radius_vox_z = ((2.0 * sigma_z) / spacing.z).ceil() as i64;

    let center_idx = volume_affine.world_to_index(pixel_world);
    let cz = center_idx.z.round() as i64;
    let cy = center_idx.y.round() as i64;
    let cx = center_idx.x.round() as i64;

    let axes_t = slice_axes.transpose();
    let mut entries = Vec::new();
    let mut peak = 0.0f64;

    for dz in -radius_vox_z..=radius_vox_z {
        let vz = cz + dz;
        if vz < 0 || vz >= vd as i64 {
            continue;
        }
        for dy in -radius_vox_y..=radius_vox_y {
            let vy = cy + dy;
            if vy < 0 || vy >= vh as i64 {
                continue;
            }
            for dx in -radius_vox_x..=radius_vox_x {
                let vx = cx + dx;
                if vx < 0 || vx >= vw as i64 {
                    continue;
                }
                let voxel_world = volume_affine.index_to_world(Vec3::new(vx as f64, vy as f64, vz as f64));
                let local = axes_t.mul_vec(voxel_world - pixel_world);

                let wx = gaussian_cell_integral(local.x, spacing.x / 2.0, sigma_xy);
                let wy = gaussian_cell_integral(local.y, spacing.y / 2.0, sigma_xy);
                let wz = gaussian_cell_integral(local.z, spacing.z / 2.0, sigma_z);
                let weight = wx * wy * wz;
                if weight <= 0.0 {
                    continue;
                }
                if weight > peak {
                    peak = weight;
                }
                let voxel_index = (vz as usize * vh + vy as usize) * vw + vx as usize;
                entries.push(PsfEntry {
                    voxel_index,
                    weight: weight as f32,
                });
            }
        }
    }

    let cutoff = (peak * PSF_PRUNE_CUTOFF) as f32;
    entries.retain(|e| e.weight >= cutoff);
    entries
}

/// Sum of weights in a PSF list — should equal the analytic Gaussian
/// integral over the enumerated support to within floating-point error.
pub fn psf_weight_sum(entries: &[PsfEntry]) -> f64 {
    entries.iter().map(|e| e.weight as f64).sum()
}

/// Per-pixel PSF table for an entire slice pixel grid.
pub type PsfTable = Array2<Vec<PsfEntry>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::vecmath::Mat3;

    #[test]
    fn erf_matches_known_values() {
        assert!((erf(0.0)).abs() < 1e-9);
        assert!((erf(1.0) - 0.8427007929).abs() < 1e-6);
        assert!((erf(-1.0) + 0.8427007929).abs() < 1e-6);
    }

    #[test]
    fn centered_pixel_weight_sum_near_one() {
        let volume_affine = Affine3::identity(Vec3::new(1.0, 1.0, 1.0));
        let entries = build_pixel_psf(
            Vec3::new(16.0, 16.0, 16.0),
            &Mat3::IDENTITY,
            1.0,
            1.0,
            &volume_affine,
            (32, 32, 32),
        );
        let sum = psf_weight_sum(&entries);
        assert!(sum > 0.95 && sum <= 1.0 + 1e-6, "sum={sum}");
    }

    #[test]
    fn thick_slice_widens_through_plane_spread() {
        let volume_affine = Affine3::identity(Vec3::new(1.0, 1.0, 1.0));
        let thin = build_pixel_psf(
            Vec3::new(16.0, 16.0, 16.0),
            &Mat3::IDENTITY,
            1.0,
            1.0,
            &volume_affine,
            (32, 32, 32),
        );
        let thick = build_pixel_psf(
            Vec3::new(16.0, 16.0, 16.0),
            &Mat3::IDENTITY,
            1.0,
            4.0,
            &volume_affine,
            (32, 32, 32),
        );
        assert!(thick.len() > thin.len());
    }
}
