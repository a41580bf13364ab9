/// Minimum slice count to parallelize a per-slice phase with Rayon.
pub const PARALLEL_SLICE_THRESHOLD: usize = 4;

/// Minimum voxel count (nx*ny*nz) to parallelize a per-voxel phase with Rayon.
pub const PARALLEL_VOXEL_THRESHOLD: usize = 32_768;

/// Small epsilon to avoid division by zero in floating-point comparisons.
pub const EPSILON: f64 = 1e-10;

/// PSF in-plane sigma multiplier relative to in-plane voxel spacing.
pub const PSF_INPLANE_SIGMA_FACTOR: f64 = 1.2;

/// PSF through-plane sigma multiplier relative to slice thickness, converting
/// FWHM-like thickness to a Gaussian sigma (thickness * factor / 2.35).
pub const PSF_THROUGHPLANE_SIGMA_FACTOR: f64 = 1.2 / 2.35;

/// PSF entries below this fraction of the peak weight are pruned.
pub const PSF_PRUNE_CUTOFF: f64 = 0.01;

/// Fixed SR gradient-descent step size.
pub const SR_STEP_SIZE: f64 = 0.028;

/// Default outer iteration count.
pub const DEFAULT_ITERATIONS: usize = 3;

/// Default inner SR iteration count (tripled on the final outer iteration).
pub const DEFAULT_SR_ITERATIONS: usize = 7;

/// Default bias-field smoothing sigma, in mm.
pub const DEFAULT_SIGMA_BIAS: f64 = 20.0;

/// Default isotropic output resolution, in mm.
pub const DEFAULT_RESOLUTION: f64 = 0.75;

/// Default per-stack intensity-matching target.
pub const DEFAULT_TARGET_INTENSITY: f64 = 700.0;

/// Default global NCC exclusion gate threshold.
pub const DEFAULT_EXCLUSION_NCC: f64 = 0.5;

/// Local SSIM gate threshold (pixels scoring below this are masked out).
pub const DEFAULT_SSIM_THRESHOLD: f64 = 0.6;

/// Initial inlier mixing probability for the EM model.
pub const DEFAULT_P_INLIER: f64 = 0.9;

/// Initial slice-class "good" prior.
pub const DEFAULT_SLICE_CLASS_PRIOR_GOOD: f64 = 0.9;

/// Coverage floor below which a simulated pixel is excluded from EM statistics.
pub const COVERAGE_FLOOR: f64 = 1e-3;
