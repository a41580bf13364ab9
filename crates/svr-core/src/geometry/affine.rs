use super::vecmath::{Mat3, Vec3};

/// Maps integer/fractional grid indices to world-space coordinates (and
/// back), for a grid with orthonormal direction cosines `axes` and
/// per-axis `spacing`. Shared by volumes (3 axes) and slices (axes[2] is
/// the through-plane normal, unused for in-plane indexing but present so
/// a slice can be treated as a thin 3D volume of one voxel in z).
#[derive(Clone, Copy, Debug)]
pub struct Affine3 {
    pub origin: Vec3,
    pub axes: Mat3,
    pub spacing: Vec3,
}

impl Affine3 {
    pub fn identity(spacing: Vec3) -> Self {
        Self {
            origin: Vec3::ZERO,
            axes: Mat3::IDENTITY,
            spacing,
        }
    }

    /// Grid index (fractional, voxel units) -> world coordinate (mm).
    pub fn index_to_world(&self, idx: Vec3) -> Vec3 {
        let scaled = Vec3::new(
            idx.x * self.spacing.x,
            idx.y * self.spacing.y,
            idx.z * self.spacing.z,
        );
        self.origin + self.axes.mul_vec(scaled)
    }

    /// World coordinate (mm) -> grid index (fractional, voxel units).
    pub fn world_to_index(&self, world: Vec3) -> Vec3 {
        let local = self.axes.transpose().mul_vec(world - self.origin);
        Vec3::new(
            local.x / self.spacing.x,
            local.y / self.spacing.y,
            local.z / self.spacing.z,
        )
    }
}

/// A rigid (rotation + translation) transform, slice space -> volume
/// (world) space. Composed of a rotation matrix and a translation vector.
#[derive(Clone, Copy, Debug)]
pub struct RigidTransform {
    pub rotation: Mat3,
    pub translation: Vec3,
}

impl RigidTransform {
    pub fn identity() -> Self {
        Self {
            rotation: Mat3::IDENTITY,
            translation: Vec3::ZERO,
        }
    }

    pub fn apply(&self, p: Vec3) -> Vec3 {
        self.rotation.mul_vec(p) + self.translation
    }

    /// Compose `self` after `other`: applying the result equals applying
    /// `other` then `self`.
    pub fn compose(&self, other: &RigidTransform) -> RigidTransform {
        RigidTransform {
            rotation: self.rotation.mul_mat(&other.rotation),
            translation: self.rotation.mul_vec(other.translation) + self.translation,
        }
    }

    pub fn inverse(&self) -> RigidTransform {
        let rt = self.rotation.transpose();
        RigidTransform {
            rotation: rt,
            translation: rt.mul_vec(self.translation).scale(-1.0),
        }
    }
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}
