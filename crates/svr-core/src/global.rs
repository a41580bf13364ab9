use crate::slice::Slice;

/// Pre-engine, whole-stack global registration (FFD in the original
/// source). Not implemented here — it is a Non-goal — but the
/// controller's control flow still calls it unless `no_global` is set,
/// so a real global-registration collaborator can be plugged in without
/// changing the controller.
pub trait GlobalRegistrationHook {
    fn align_stacks(&self, slices: &mut [Slice]);
}

/// Default hook: does nothing. Stacks are assumed pre-aligned (e.g. by
/// scanner geometry) when no collaborator is wired in.
pub struct NoOpGlobalRegistration;

impl GlobalRegistrationHook for NoOpGlobalRegistration {
    fn align_stacks(&self, _slices: &mut [Slice]) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Affine3, RigidTransform, Vec3};
    use ndarray::Array2;

    #[test]
    fn noop_hook_leaves_transforms_unchanged() {
        let pixels = Array2::<f32>::zeros((2, 2));
        let geometry = Affine3::identity(Vec3::new(1.0, 1.0, 1.0));
        let mut slices = vec![Slice::new(pixels, geometry, 1.0, RigidTransform::identity(), 0, 0)];
        let before = slices[0].transform.translation;
        NoOpGlobalRegistration.align_stacks(&mut slices);
        assert_eq!(slices[0].transform.translation, before);
    }
}
