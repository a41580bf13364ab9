use rayon::prelude::*;
use tracing::warn;

use crate::consts::PARALLEL_SLICE_THRESHOLD;
use crate::geometry::RigidTransform;
use crate::slice::Slice;
use crate::volume::Volume;

/// Similarity measure used to drive and to judge a registration attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Similarity {
    Nmi,
    /// Box-window NCC, window size given in voxels (default 5).
    Ncc { window: usize },
}

impl Default for Similarity {
    fn default() -> Self {
        Similarity::Nmi
    }
}

/// A single registration attempt's outcome: the external primitive
/// returns the refined transform plus the similarity score it converged
/// to, so the driver can apply the failure floor.
pub struct RegistrationResult {
    pub transform: RigidTransform,
    pub similarity_score: f64,
}

/// The external rigid-body registration primitive, treated as a black
/// box: given a target volume and a source image (here, a slice
/// reinterpreted as a thin 3D volume of its own), find the rigid
/// transform that maximizes the chosen similarity measure, starting
/// from an initial guess. Implementations may block for an arbitrary
/// time; the driver treats each call as an atomic blocking unit.
pub trait RegistrationBackend: Sync {
    fn register(
        &self,
        target: &Volume,
        source: &Slice,
        similarity: Similarity,
        initial_guess: &RigidTransform,
    ) -> Option<RegistrationResult>;
}

/// A registration backend that always reports failure; useful as a
/// placeholder when no real primitive is wired in, and for tests of the
/// driver's failure-recovery path.
pub struct NullRegistrationBackend;

impl RegistrationBackend for NullRegistrationBackend {
    fn register(
        &self,
        _target: &Volume,
        _source: &Slice,
        _similarity: Similarity,
        _initial_guess: &RigidTransform,
    ) -> Option<RegistrationResult> {
        None
    }
}

/// Registration phase (component 4.6): early outer iterations register
/// whole packages or odd/even halves rigidly before per-slice SVR takes
/// over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationPhase {
    Package,
    OddEven,
    PerSlice,
}

/// Minimum similarity score below which a registration result is
/// considered a failure and the transform is reverted.
pub const SIMILARITY_FAILURE_FLOOR: f64 = 1e-6;

/// Run one registration pass over all non-force-excluded slices. For
/// `Package`/`OddEven`, slices sharing a `group_key` are registered as
/// one rigid body (the first successful per-group result is applied to
/// every slice in the group); `PerSlice` registers independently.
///
/// On failure (similarity below [`SIMILARITY_FAILURE_FLOOR`] or no
/// result from the backend), `T` is reverted to its pre-call value and
/// the slice is flagged structurally excluded for this outer iteration
/// (component 4.6's `RegistrationFailure`, recovered locally per §7).
pub fn run_registration_pass(
    slices: &mut [Slice],
    volume: &Volume,
    backend: &dyn RegistrationBackend,
    similarity: Similarity,
    phase: RegistrationPhase,
    group_key: impl Fn(&Slice) -> usize + Sync,
) {
    match phase {
        RegistrationPhase::PerSlice => register_per_slice(slices, volume, backend, similarity),
        RegistrationPhase::Package | RegistrationPhase::OddEven => {
            register_grouped(slices, volume, backend, similarity, group_key, phase)
        }
    }
}

fn register_per_slice(slices: &mut [Slice], volume: &Volume, backend: &dyn RegistrationBackend, similarity: Similarity) {
    let attempt = |slice: &Slice| -> Option<RigidTransform> {
        if slice.force_excluded {
            return None;
        }
        attempt_one(slice, volume, backend, similarity)
    };

    if slices.len() >= PARALLEL_SLICE_THRESHOLD {
        let outcomes: Vec<Option<RigidTransform>> = slices.par_iter().map(attempt).collect();
        for (slice, outcome) in slices.iter_mut().zip(outcomes) {
            apply_outcome(slice, outcome);
        }
    } else {
        for slice in slices.iter_mut() {
            let outcome = attempt(slice);
            apply_outcome(slice, outcome);
        }
    }
}

fn register_grouped(
    slices: &mut [Slice],
    volume: &Volume,
    backend: &dyn RegistrationBackend,
    similarity: Similarity,
    group_key: impl Fn(&Slice) -> usize,
    phase: RegistrationPhase,
) {
    use std::collections::BTreeMap;

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (idx, slice) in slices.iter().enumerate() {
        if slice.force_excluded {
            continue;
        }
        let key = match phase {
            RegistrationPhase::OddEven => group_key(slice) * 2 + (slice.slice_in_stack_index % 2),
            _ => group_key(slice),
        };
        groups.entry(key).or_default().push(idx);
    }

    for members in groups.values() {
        let Some(&representative) = members.first() else {
            continue;
        };
        let outcome = attempt_one(&slices[representative], volume, backend, similarity);
        match outcome {
            Some(transform) => {
                for &idx in members {
                    slices[idx].transform = transform;
                    slices[idx].invalidate_psf_table();
                }
            }
            None => {
                for &idx in members {
                    warn!(slice = idx, "group registration failed, marking structurally excluded");
                    slices[idx].structurally_excluded = true;
                }
            }
        }
    }
}

fn attempt_one(
    slice: &Slice,
    volume: &Volume,
    backend: &dyn RegistrationBackend,
    similarity: Similarity,
) -> Option<RigidTransform> {
    let result = backend.register(volume, slice, similarity, &slice.transform)?;
    if result.similarity_score < SIMILARITY_FAILURE_FLOOR {
        return None;
    }
    Some(result.transform)
}

fn apply_outcome(slice: &mut Slice, outcome: Option<RigidTransform>) {
    match outcome {
        Some(transform) => {
            slice.transform = transform;
            slice.invalidate_psf_table();
        }
        None => {
            slice.structurally_excluded = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Affine3, Vec3};
    use ndarray::Array2;

    struct AlwaysSucceed;
    impl RegistrationBackend for AlwaysSucceed {
        fn register(
            &self,
            _target: &Volume,
            _source: &Slice,
            _similarity: Similarity,
            initial_guess: &RigidTransform,
        ) -> Option<RegistrationResult> {
            Some(RegistrationResult {
                transform: *initial_guess,
                similarity_score: 1.0,
            })
        }
    }

    fn make_slice() -> Slice {
        let pixels = Array2::<f32>::zeros((4, 4));
        let geometry = Affine3::identity(Vec3::new(1.0, 1.0, 1.0));
        Slice::new(pixels, geometry, 1.0, RigidTransform::identity(), 0, 0)
    }

    #[test]
    fn null_backend_marks_all_slices_structurally_excluded() {
        let mut slices = vec![make_slice(), make_slice()];
        let volume = Volume::new((8, 8, 8), Affine3::identity(Vec3::new(1.0, 1.0, 1.0)));
        run_registration_pass(
            &mut slices,
            &volume,
            &NullRegistrationBackend,
            Similarity::Nmi,
            RegistrationPhase::PerSlice,
            |s| s.stack_index,
        );
        assert!(slices.iter().all(|s| s.structurally_excluded));
    }

    #[test]
    fn successful_backend_invalidates_psf_table() {
        let mut slices = vec![make_slice()];
        let volume = Volume::new((8, 8, 8), Affine3::identity(Vec3::new(1.0, 1.0, 1.0)));
        slices[0].rebuild_psf_table(&volume);
        run_registration_pass(
            &mut slices,
            &volume,
            &AlwaysSucceed,
            Similarity::Nmi,
            RegistrationPhase::PerSlice,
            |s| s.stack_index,
        );
        assert!(slices[0].psf_table_is_stale());
        assert!(!slices[0].structurally_excluded);
    }

    #[test]
    fn force_excluded_slice_is_skipped() {
        let mut slice = make_slice();
        slice.force_excluded = true;
        let mut slices = vec![slice];
        let volume = Volume::new((8, 8, 8), Affine3::identity(Vec3::new(1.0, 1.0, 1.0)));
        run_registration_pass(
            &mut slices,
            &volume,
            &NullRegistrationBackend,
            Similarity::Nmi,
            RegistrationPhase::PerSlice,
            |s| s.stack_index,
        );
        assert!(!slices[0].structurally_excluded);
    }
}
