use ndarray::Array3;
use rayon::prelude::*;

use crate::consts::PARALLEL_VOXEL_THRESHOLD;

/// Trilinear sample of a dense 3D grid at fractional voxel coordinates
/// `(z, y, x)`. Out-of-bounds contributions are treated as zero, matching
/// the 2D `bilinear_sample` convention this generalizes.
pub fn trilinear_sample(data: &Array3<f32>, z: f64, y: f64, x: f64) -> f32 {
    let (d, h, w) = data.dim();

    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let z0 = z.floor() as i64;

    let fx = (x - x0 as f64) as f32;
    let fy = (y - y0 as f64) as f32;
    let fz = (z - z0 as f64) as f32;

    let sample = |zz: i64, yy: i64, xx: i64| -> f32 {
        if zz >= 0 && zz < d as i64 && yy >= 0 && yy < h as i64 && xx >= 0 && xx < w as i64 {
            data[[zz as usize, yy as usize, xx as usize]]
        } else {
            0.0
        }
    };

    let c000 = sample(z0, y0, x0);
    let c001 = sample(z0, y0, x0 + 1);
    let c010 = sample(z0, y0 + 1, x0);
    let c011 = sample(z0, y0 + 1, x0 + 1);
    let c100 = sample(z0 + 1, y0, x0);
    let c101 = sample(z0 + 1, y0, x0 + 1);
    let c110 = sample(z0 + 1, y0 + 1, x0);
    let c111 = sample(z0 + 1, y0 + 1, x0 + 1);

    let c00 = c000 * (1.0 - fx) + c001 * fx;
    let c01 = c010 * (1.0 - fx) + c011 * fx;
    let c10 = c100 * (1.0 - fx) + c101 * fx;
    let c11 = c110 * (1.0 - fx) + c111 * fx;

    let c0 = c00 * (1.0 - fy) + c01 * fy;
    let c1 = c10 * (1.0 - fy) + c11 * fy;

    c0 * (1.0 - fz) + c1 * fz
}

/// Resample `src` onto the grid shape described by `dst_shape`, via
/// `index_map` converting a destination index to a fractional source index
/// (z, y, x). This is the engine's sole resampling primitive; callers
/// supply the geometry (via `Affine3::world_to_index` composed with
/// `Affine3::index_to_world`), keeping this function purely numeric.
pub fn resample<F>(src: &Array3<f32>, dst_shape: (usize, usize, usize), index_map: F) -> Array3<f32>
where
    F: Fn(usize, usize, usize) -> (f64, f64, f64) + Sync,
{
    let (d, h, w) = dst_shape;
    if d * h * w >= PARALLEL_VOXEL_THRESHOLD {
        let planes: Vec<Vec<f32>> = (0..d)
            .into_par_iter()
            .map(|zi| {
                let mut plane = vec![0.0f32; h * w];
                for yi in 0..h {
                    for xi in 0..w {
                        let (sz, sy, sx) = index_map(zi, yi, xi);
                        plane[yi * w + xi] = trilinear_sample(src, sz, sy, sx);
                    }
                }
                plane
            })
            .collect();
        let mut out = Array3::<f32>::zeros((d, h, w));
        for (zi, plane) in planes.into_iter().enumerate() {
            for yi in 0..h {
                for xi in 0..w {
                    out[[zi, yi, xi]] = plane[yi * w + xi];
                }
            }
        }
        out
    } else {
        let mut out = Array3::<f32>::zeros((d, h, w));
        for zi in 0..d {
            for yi in 0..h {
                for xi in 0..w {
                    let (sz, sy, sx) = index_map(zi, yi, xi);
                    out[[zi, yi, xi]] = trilinear_sample(src, sz, sy, sx);
                }
            }
        }
        out
    }
}

fn make_gaussian_kernel(sigma: f64) -> Vec<f32> {
    if sigma <= 0.0 {
        return vec![1.0];
    }
    let radius = (sigma * 3.0).ceil() as usize;
    let size = 2 * radius + 1;
    let mut kernel = vec![0.0f32; size];
    let s2 = 2.0 * sigma * sigma;
    let mut sum = 0.0f64;
    for (i, k) in kernel.iter_mut().enumerate() {
        let x = i as f64 - radius as f64;
        let v = (-x * x / s2).exp();
        *k = v as f32;
        sum += v;
    }
    for v in &mut kernel {
        *v /= sum as f32;
    }
    kernel
}

/// Separable 3D Gaussian blur with clamped boundary, `sigma` in voxel
/// units. Used for bias-field smoothing (converted from mm by the
/// caller) and for the volume-mask dilation used by `with_background`.
pub fn gaussian_blur_3d(data: &Array3<f32>, sigma_z: f64, sigma_y: f64, sigma_x: f64) -> Array3<f32> {
    let after_x = convolve_axis(data, &make_gaussian_kernel(sigma_x), Axis3::X);
    let after_y = convolve_axis(&after_x, &make_gaussian_kernel(sigma_y), Axis3::Y);
    convolve_axis(&after_y, &make_gaussian_kernel(sigma_z), Axis3::Z)
}

enum Axis3 {
    X,
    Y,
    Z,
}

fn convolve_axis(data: &Array3<f32>, kernel: &[f32], axis: Axis3) -> Array3<f32> {
    let (d, h, w) = data.dim();
    let radius = (kernel.len() / 2) as isize;
    let mut out = Array3::<f32>::zeros((d, h, w));
    for zi in 0..d {
        for yi in 0..h {
            for xi in 0..w {
                let mut sum = 0.0f32;
                for (k, &kv) in kernel.iter().enumerate() {
                    let offset = k as isize - radius;
                    let (sz, sy, sx) = match axis {
                        Axis3::X => (zi as isize, yi as isize, xi as isize + offset),
                        Axis3::Y => (zi as isize, yi as isize + offset, xi as isize),
                        Axis3::Z => (zi as isize + offset, yi as isize, xi as isize),
                    };
                    let cz = sz.clamp(0, d as isize - 1) as usize;
                    let cy = sy.clamp(0, h as isize - 1) as usize;
                    let cx = sx.clamp(0, w as isize - 1) as usize;
                    sum += data[[cz, cy, cx]] * kv;
                }
                out[[zi, yi, xi]] = sum;
            }
        }
    }
    out
}

/// 2D counterpart of [`gaussian_blur_3d`], used to smooth a slice's
/// bias field (which lives in the slice's own 2D pixel grid, not the
/// volume grid).
pub fn gaussian_blur_2d(data: &ndarray::Array2<f32>, sigma_y: f64, sigma_x: f64) -> ndarray::Array2<f32> {
    let kernel_x = make_gaussian_kernel(sigma_x);
    let kernel_y = make_gaussian_kernel(sigma_y);
    let (h, w) = data.dim();
    let radius_x = (kernel_x.len() / 2) as isize;
    let mut after_x = ndarray::Array2::<f32>::zeros((h, w));
    for yi in 0..h {
        for xi in 0..w {
            let mut sum = 0.0f32;
            for (k, &kv) in kernel_x.iter().enumerate() {
                let sx = (xi as isize + k as isize - radius_x).clamp(0, w as isize - 1) as usize;
                sum += data[[yi, sx]] * kv;
            }
            after_x[[yi, xi]] = sum;
        }
    }
    let radius_y = (kernel_y.len() / 2) as isize;
    let mut after_y = ndarray::Array2::<f32>::zeros((h, w));
    for yi in 0..h {
        for xi in 0..w {
            let mut sum = 0.0f32;
            for (k, &kv) in kernel_y.iter().enumerate() {
                let sy = (yi as isize + k as isize - radius_y).clamp(0, h as isize - 1) as usize;
                sum += after_x[[sy, xi]] * kv;
            }
            after_y[[yi, xi]] = sum;
        }
    }
    after_y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trilinear_sample_exact_at_grid_point() {
        let mut data = Array3::<f32>::zeros((4, 4, 4));
        data[[1, 2, 3]] = 5.0;
        assert!((trilinear_sample(&data, 1.0, 2.0, 3.0) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn trilinear_sample_interpolates_midpoint() {
        let mut data = Array3::<f32>::zeros((2, 2, 2));
        data[[0, 0, 0]] = 0.0;
        data[[0, 0, 1]] = 2.0;
        let v = trilinear_sample(&data, 0.0, 0.0, 0.5);
        assert!((v - 1.0).abs() < 1e-6);
    }

    #[test]
    fn gaussian_blur_3d_preserves_constant_field() {
        let data = Array3::<f32>::from_elem((6, 6, 6), 3.0);
        let blurred = gaussian_blur_3d(&data, 1.0, 1.0, 1.0);
        for v in blurred.iter() {
            assert!((v - 3.0).abs() < 1e-4);
        }
    }
}
