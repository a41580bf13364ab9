use ndarray::Array2;

use crate::geometry::{build_pixel_psf, Affine3, Mat3, PsfTable, RigidTransform, Vec3};
use crate::volume::Volume;

/// A single 2D plane of an input stack, treated as an independently-posed
/// 3D object with thickness `thickness`. See spec Data Model, "Slice".
#[derive(Clone, Debug)]
pub struct Slice {
    pub pixels: Array2<f32>,
    /// Slice-local indices -> world coordinates, before `transform`.
    pub geometry: Affine3,
    /// Effective thickness, independent of any z-spacing in `geometry`.
    pub thickness: f64,
    /// Slice space -> volume (world) space.
    pub transform: RigidTransform,

    pub pixel_weight: Array2<f32>,
    pub slice_weight: f32,
    pub scale: f32,
    /// Log-domain multiplicative bias, zero-mean inside mask.
    pub bias: Array2<f32>,

    pub simulated: Array2<f32>,
    pub coverage: Array2<f32>,
    pub inside_mask: Array2<bool>,

    pub stack_index: usize,
    pub slice_in_stack_index: usize,

    pub force_excluded: bool,
    pub structurally_excluded: bool,

    psf_table: Option<PsfTable>,
}

impl Slice {
    pub fn new(
        pixels: Array2<f32>,
        geometry: Affine3,
        thickness: f64,
        transform: RigidTransform,
        stack_index: usize,
        slice_in_stack_index: usize,
    ) -> Self {
        let shape = pixels.dim();
        Self {
            pixel_weight: Array2::from_elem(shape, 1.0),
            slice_weight: 1.0,
            scale: 1.0,
            bias: Array2::zeros(shape),
            simulated: Array2::zeros(shape),
            coverage: Array2::zeros(shape),
            inside_mask: Array2::from_elem(shape, false),
            pixels,
            geometry,
            thickness,
            transform,
            stack_index,
            slice_in_stack_index,
            force_excluded: false,
            structurally_excluded: false,
            psf_table: None,
        }
    }

    pub fn dims(&self) -> (usize, usize) {
        self.pixels.dim()
    }

    /// True when the slice contributes to the SR update and to statistics.
    /// Per invariant, force- or structurally-excluded slices contribute
    /// zero.
    pub fn is_active(&self) -> bool {
        !self.force_excluded && !self.structurally_excluded
    }

    /// Reset the per-outer-iteration structural-exclusion flag. Called at
    /// the start of every outer iteration; `force_excluded` is terminal
    /// for the run and is never reset here.
    pub fn reset_structural_flag(&mut self) {
        self.structurally_excluded = false;
    }

    /// World-space centre of slice pixel `(row, col)`, mapped through the
    /// slice's own geometry and then the current rigid transform.
    pub fn pixel_world(&self, row: usize, col: usize) -> Vec3 {
        let local = self.geometry.index_to_world(Vec3::new(col as f64, row as f64, 0.0));
        self.transform.apply(local)
    }

    /// The slice's in-plane/through-plane axes, rotated into world space
    /// by the current transform — the local frame the anisotropic PSF is
    /// diagonal in.
    pub fn world_axes(&self) -> Mat3 {
        self.transform.rotation.mul_mat(&self.geometry.axes)
    }

    pub fn in_plane_spacing(&self) -> f64 {
        // in-plane axes share spacing in a well-formed acquisition; use
        // their mean to tolerate slight anisotropy.
        (self.geometry.spacing.x + self.geometry.spacing.y) / 2.0
    }

    pub fn psf_table(&self) -> Option<&PsfTable> {
        self.psf_table.as_ref()
    }

    /// Invalidate the PSF table. Per the Volume/Slice invariants, any
    /// change to `transform` (or to the reconstructed volume's grid)
    /// must be followed by this before the next simulate.
    pub fn invalidate_psf_table(&mut self) {
        self.psf_table = None;
    }

    pub fn psf_table_is_stale(&self) -> bool {
        self.psf_table.is_none()
    }

    /// Rebuilds the per-pixel PSF table against `volume`'s current grid
    /// and this slice's current transform (component 4.1, the Geometry &
    /// PSF kernel builder). Pixels whose PSF list ends up empty are left
    /// with an empty entry (they are "outside-FOV"); a slice whose every
    /// pixel is empty is geometry-degenerate and should be dropped by the
    /// caller (see error::ReconError::GeometryDegenerate).
    pub fn rebuild_psf_table(&mut self, volume: &Volume) {
        let (rows, cols) = self.dims();
        let axes = self.world_axes();
        let in_plane = self.in_plane_spacing();
        let thickness = self.thickness;
        let volume_affine = volume.affine;
        let volume_dims = volume.dims();

        let mut table: PsfTable = ndarray::Array2::from_elem((rows, cols), Vec::new());
        for row in 0..rows {
            for col in 0..cols {
                let world = self.pixel_world(row, col);
                let entries = build_pixel_psf(world, &axes, in_plane, thickness, &volume_affine, volume_dims);
                table[[row, col]] = entries;
            }
        }
        self.psf_table = Some(table);
    }

    /// True if the PSF table exists and every pixel's list is empty — the
    /// slice's stack had no overlap with the reconstruction ROI.
    pub fn has_no_overlap(&self) -> bool {
        match &self.psf_table {
            Some(table) => table.iter().all(|entries| entries.is_empty()),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Affine3;

    fn make_test_volume() -> Volume {
        Volume::new((16, 16, 16), Affine3::identity(Vec3::new(1.0, 1.0, 1.0)))
    }

    fn make_test_slice() -> Slice {
        let pixels = Array2::<f32>::from_elem((8, 8), 1.0);
        let geometry = Affine3 {
            origin: Vec3::new(4.0, 4.0, 8.0),
            axes: Mat3::IDENTITY,
            spacing: Vec3::new(1.0, 1.0, 2.0),
        };
        Slice::new(pixels, geometry, 2.0, RigidTransform::identity(), 0, 0)
    }

    #[test]
    fn new_slice_is_active_and_has_no_psf_table() {
        let s = make_test_slice();
        assert!(s.is_active());
        assert!(s.psf_table_is_stale());
    }

    #[test]
    fn rebuild_psf_table_populates_in_fov_pixels() {
        let mut s = make_test_slice();
        let v = make_test_volume();
        s.rebuild_psf_table(&v);
        assert!(!s.psf_table_is_stale());
        assert!(!s.has_no_overlap());
    }

    #[test]
    fn far_outside_slice_has_no_overlap() {
        let mut s = make_test_slice();
        s.transform.translation = Vec3::new(1000.0, 1000.0, 1000.0);
        let v = make_test_volume();
        s.rebuild_psf_table(&v);
        assert!(s.has_no_overlap());
    }

    #[test]
    fn force_excluded_slice_is_not_active() {
        let mut s = make_test_slice();
        s.force_excluded = true;
        assert!(!s.is_active());
    }
}
