use rayon::prelude::*;

use crate::consts::PARALLEL_SLICE_THRESHOLD;
use crate::slice::Slice;
use crate::volume::Volume;

/// For every in-mask pixel with a non-empty PSF list: `simulated = sum(w_r
/// * V[r])`, `coverage = sum(w_r)`, and `inside_mask` is true iff the
/// dominant-weight (highest-weight) PSF voxel lies inside the volume
/// mask. Pixels with an empty PSF list are left with zero coverage and
/// `inside_mask = false` ("outside-FOV", per component 4.2).
pub fn simulate_slice(slice: &mut Slice, volume: &Volume) {
    let (rows, cols) = slice.dims();
    let table = slice
        .psf_table()
        .expect("simulate_slice requires a freshly built PSF table");

    for row in 0..rows {
        for col in 0..cols {
            let entries = &table[[row, col]];
            if entries.is_empty() {
                slice.simulated[[row, col]] = 0.0;
                slice.coverage[[row, col]] = 0.0;
                slice.inside_mask[[row, col]] = false;
                continue;
            }

            let mut y_hat = 0.0f64;
            let mut coverage = 0.0f64;
            let mut best_weight = -1.0f32;
            let mut dominant_index = entries[0].voxel_index;
            for entry in entries {
                let v = volume.data.as_slice().unwrap()[entry.voxel_index] as f64;
                y_hat += entry.weight as f64 * v;
                coverage += entry.weight as f64;
                if entry.weight > best_weight {
                    best_weight = entry.weight;
                    dominant_index = entry.voxel_index;
                }
            }

            slice.simulated[[row, col]] = y_hat as f32;
            slice.coverage[[row, col]] = coverage as f32;
            slice.inside_mask[[row, col]] =
                volume.mask.as_slice().unwrap()[dominant_index];
        }
    }
}

/// Simulate every active slice in parallel (component 4.2 is an
/// embarrassingly-parallel per-slice map with no cross-slice reduction).
pub fn simulate_all(slices: &mut [Slice], volume: &Volume) {
    if slices.len() >= PARALLEL_SLICE_THRESHOLD {
        slices.par_iter_mut().for_each(|slice| {
            if slice.is_active() {
                simulate_slice(slice, volume);
            }
        });
    } else {
        for slice in slices.iter_mut() {
            if slice.is_active() {
                simulate_slice(slice, volume);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Affine3, Mat3, RigidTransform, Vec3};
    use ndarray::Array2;

    #[test]
    fn uniform_volume_simulates_to_constant() {
        let mut volume = Volume::new((16, 16, 16), Affine3::identity(Vec3::new(1.0, 1.0, 1.0)));
        volume.data.fill(5.0);

        let pixels = Array2::<f32>::zeros((6, 6));
        let geometry = Affine3 {
            origin: Vec3::new(5.0, 5.0, 8.0),
            axes: Mat3::IDENTITY,
            spacing: Vec3::new(1.0, 1.0, 2.0),
        };
        let mut slice = Slice::new(pixels, geometry, 2.0, RigidTransform::identity(), 0, 0);
        slice.rebuild_psf_table(&volume);
        simulate_slice(&mut slice, &volume);

        for row in 0..6 {
            for col in 0..6 {
                if slice.coverage[[row, col]] > 0.0 {
                    assert!(
                        (slice.simulated[[row, col]] - 5.0).abs() < 0.05,
                        "simulated={} at ({row},{col})",
                        slice.simulated[[row, col]]
                    );
                }
            }
        }
    }
}
