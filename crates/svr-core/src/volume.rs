use ndarray::Array3;

use crate::geometry::{gaussian_blur_3d, resample, trilinear_sample, Affine3, Vec3};

/// A dense 3D grid with a world-space affine, plus the auxiliary mask and
/// confidence grids that share its attributes (see spec Data Model,
/// "Volume").
#[derive(Clone, Debug)]
pub struct Volume {
    pub data: Array3<f32>,
    pub mask: Array3<bool>,
    pub confidence: Array3<f32>,
    pub affine: Affine3,
}

impl Volume {
    /// A new volume of the given voxel dimensions, zero-filled, unmasked
    /// (mask = true everywhere), with the given affine.
    pub fn new(dims: (usize, usize, usize), affine: Affine3) -> Self {
        Self {
            data: Array3::zeros(dims),
            mask: Array3::from_elem(dims, true),
            confidence: Array3::zeros(dims),
            affine,
        }
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// World-space coordinate of grid index `(z, y, x)`.
    pub fn world_of(&self, z: usize, y: usize, x: usize) -> Vec3 {
        self.affine
            .index_to_world(Vec3::new(x as f64, y as f64, z as f64))
    }

    /// Trilinearly interpolated value at a world-space point. Returns 0.0
    /// outside the grid, matching [`crate::geometry::trilinear_sample`].
    pub fn value_at(&self, world: Vec3) -> f32 {
        let idx = self.affine.world_to_index(world);
        trilinear_sample(&self.data, idx.z, idx.y, idx.x)
    }

    /// True if `world` maps inside the mask's true region (nearest-voxel
    /// lookup, used for the PSF table's "dominant voxel inside mask" test).
    pub fn inside_mask(&self, world: Vec3) -> bool {
        let idx = self.affine.world_to_index(world);
        let (d, h, w) = self.dims();
        let zi = idx.z.round() as i64;
        let yi = idx.y.round() as i64;
        let xi = idx.x.round() as i64;
        if zi < 0 || zi >= d as i64 || yi < 0 || yi >= h as i64 || xi < 0 || xi >= w as i64 {
            return false;
        }
        self.mask[[zi as usize, yi as usize, xi as usize]]
    }

    /// Mean intensity inside the mask.
    pub fn mean_in_mask(&self) -> f64 {
        let mut sum = 0.0f64;
        let mut count = 0usize;
        for (v, &m) in self.data.iter().zip(self.mask.iter()) {
            if m {
                sum += *v as f64;
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Grows the mask by `margin` voxels of 6-connected dilation, for
    /// `with_background`'s dilated-ROI reconstruction: the engine then
    /// reconstructs over a wider region than the strict input mask so
    /// background structure around the ROI is recovered too.
    pub fn dilate_mask(&mut self, margin: usize) {
        let (d, h, w) = self.dims();
        for _ in 0..margin {
            let current = self.mask.clone();
            for z in 0..d as isize {
                for y in 0..h as isize {
                    for x in 0..w as isize {
                        if current[[z as usize, y as usize, x as usize]] {
                            continue;
                        }
                        let neighbors = [(-1, 0, 0), (1, 0, 0), (0, -1, 0), (0, 1, 0), (0, 0, -1), (0, 0, 1)];
                        let grown = neighbors.iter().any(|&(dz, dy, dx)| {
                            let (nz, ny, nx) = (z + dz, y + dy, x + dx);
                            nz >= 0
                                && nz < d as isize
                                && ny >= 0
                                && ny < h as isize
                                && nx >= 0
                                && nx < w as isize
                                && current[[nz as usize, ny as usize, nx as usize]]
                        });
                        if grown {
                            self.mask[[z as usize, y as usize, x as usize]] = true;
                        }
                    }
                }
            }
        }
    }

    /// Smooths the mask's boundary with an isotropic Gaussian of
    /// `sigma_voxels`, thresholding the blurred field back to binary at
    /// 0.5 (`smooth_mask` config option).
    pub fn smooth_mask(&mut self, sigma_voxels: f64) {
        if sigma_voxels <= 0.0 {
            return;
        }
        let soft = self.mask.mapv(|m| if m { 1.0f32 } else { 0.0f32 });
        let blurred = gaussian_blur_3d(&soft, sigma_voxels, sigma_voxels, sigma_voxels);
        self.mask = blurred.mapv(|v| v >= 0.5);
    }

    /// Zeroes voxels outside the mask, used at the end of each outer
    /// iteration unless `with_background` keeps the dilated ROI.
    pub fn apply_roi_mask(&mut self) {
        for (v, &m) in self.data.iter_mut().zip(self.mask.iter()) {
            if !m {
                *v = 0.0;
            }
        }
    }

    /// Resamples `src` (any grid/affine) onto this volume's grid, via
    /// trilinear interpolation. Used to bring an externally supplied mask
    /// or an initial template into the reconstruction's template space.
    pub fn resample_from(&mut self, src: &Volume) {
        let dims = self.dims();
        let dst_affine = self.affine;
        self.data = resample(&src.data, dims, |z, y, x| {
            let world = dst_affine.index_to_world(Vec3::new(x as f64, y as f64, z as f64));
            let idx = src.affine.world_to_index(world);
            (idx.z, idx.y, idx.x)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Vec3;

    #[test]
    fn value_at_grid_point_matches_data() {
        let mut v = Volume::new((4, 4, 4), Affine3::identity(Vec3::new(1.0, 1.0, 1.0)));
        v.data[[1, 2, 3]] = 9.0;
        let world = v.world_of(1, 2, 3);
        assert!((v.value_at(world) - 9.0).abs() < 1e-5);
    }

    #[test]
    fn mean_in_mask_ignores_masked_out_voxels() {
        let mut v = Volume::new((2, 2, 2), Affine3::identity(Vec3::new(1.0, 1.0, 1.0)));
        v.data.fill(10.0);
        v.mask[[0, 0, 0]] = false;
        v.data[[0, 0, 0]] = 1000.0;
        assert!((v.mean_in_mask() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn dilate_mask_grows_single_voxel_by_margin() {
        let mut v = Volume::new((5, 5, 5), Affine3::identity(Vec3::new(1.0, 1.0, 1.0)));
        v.mask.fill(false);
        v.mask[[2, 2, 2]] = true;
        v.dilate_mask(1);
        assert!(v.mask[[2, 2, 1]]);
        assert!(v.mask[[2, 2, 3]]);
        assert!(v.mask[[1, 2, 2]]);
        assert!(!v.mask[[0, 0, 0]]);
    }

    #[test]
    fn dilate_mask_zero_margin_is_a_no_op() {
        let mut v = Volume::new((3, 3, 3), Affine3::identity(Vec3::new(1.0, 1.0, 1.0)));
        v.mask.fill(false);
        v.mask[[1, 1, 1]] = true;
        v.dilate_mask(0);
        assert_eq!(v.mask.iter().filter(|&&m| m).count(), 1);
    }

    #[test]
    fn smooth_mask_keeps_a_solid_block_mostly_true() {
        let mut v = Volume::new((8, 8, 8), Affine3::identity(Vec3::new(1.0, 1.0, 1.0)));
        v.mask.fill(true);
        v.smooth_mask(1.0);
        assert!(v.mask[[4, 4, 4]]);
    }

    #[test]
    fn apply_roi_mask_zeroes_outside_voxels() {
        let mut v = Volume::new((2, 2, 2), Affine3::identity(Vec3::new(1.0, 1.0, 1.0)));
        v.data.fill(5.0);
        v.mask[[0, 0, 0]] = false;
        v.apply_roi_mask();
        assert_eq!(v.data[[0, 0, 0]], 0.0);
        assert_eq!(v.data[[1, 1, 1]], 5.0);
    }
}
