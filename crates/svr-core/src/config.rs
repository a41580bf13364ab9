use serde::{Deserialize, Serialize};

use crate::consts::{
    DEFAULT_EXCLUSION_NCC, DEFAULT_ITERATIONS, DEFAULT_RESOLUTION, DEFAULT_SIGMA_BIAS,
    DEFAULT_SR_ITERATIONS, DEFAULT_TARGET_INTENSITY,
};
use crate::registration::Similarity;

/// Recognized configuration surface (spec.md §6's table), loadable from
/// TOML via `serde` the way `jupiter-cli`'s `PipelineConfig` is.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconConfig {
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    #[serde(default = "default_sr_iterations")]
    pub sr_iterations: usize,

    /// Bias-field smoothing sigma, mm.
    #[serde(default = "default_sigma")]
    pub sigma: f64,

    /// Isotropic output spacing, mm.
    #[serde(default = "default_resolution")]
    pub resolution: f64,

    #[serde(default = "default_lambda")]
    pub lambda: f64,

    /// SR regularizer weight used on the final outer iteration.
    #[serde(default = "default_lambda")]
    pub last_iter_lambda: f64,

    #[serde(default = "default_delta")]
    pub delta: f64,

    /// Number of lambda-cascade levels; 1 disables the cascade.
    #[serde(default = "default_multires")]
    pub multires: usize,

    /// Per-stack intensity-matching target mean in-mask intensity,
    /// applied once before the outer loop by
    /// [`crate::bias::match_stack_intensities`] unless
    /// `no_intensity_matching` is set.
    #[serde(default = "default_average")]
    pub average: f64,

    /// Mask-boundary smoothing sigma, in voxels; 0 disables smoothing.
    #[serde(default)]
    pub smooth_mask: f64,

    #[serde(default = "default_exclusion_ncc")]
    pub exclusion_ncc: f64,

    /// Use NCC instead of NMI for the registration driver.
    #[serde(default)]
    pub ncc: bool,

    /// Enable the structural (NCC + SSIM) exclusion gates.
    #[serde(default)]
    pub structural: bool,

    #[serde(default)]
    pub no_robust_statistics: bool,

    /// Robust weights act on whole slices only, skipping per-pixel E-step.
    #[serde(default)]
    pub exclude_slices_only: bool,

    /// Skip per-stack intensity matching and the per-iteration bias+scale
    /// correction.
    #[serde(default)]
    pub no_intensity_matching: bool,

    /// Skip the first Gaussian-seed-only pass.
    #[serde(default)]
    pub svr_only: bool,

    /// Skip the pre-engine global stack registration hook.
    #[serde(default)]
    pub no_global: bool,

    /// Freeze T; exactly one outer iteration runs.
    #[serde(default)]
    pub no_registration: bool,

    /// Reconstruct over a dilated ROI instead of the strict mask, keeping
    /// background structure around it; skips the final per-iteration ROI
    /// clamp.
    #[serde(default)]
    pub with_background: bool,

    /// Dilation margin, in voxels, applied to the mask once at the start
    /// of the run when `with_background` is set.
    #[serde(default)]
    pub bg_dilation: f64,

    /// Slice indices permanently excluded.
    #[serde(default)]
    pub force_exclude: Vec<usize>,

    /// Directory of initial slice transforms, consumed by a collaborator
    /// before the engine starts; the engine itself only ever sees the
    /// resulting `Vec<Slice>`.
    #[serde(default)]
    pub transformations: Option<std::path::PathBuf>,
}

impl ReconConfig {
    pub fn similarity(&self) -> Similarity {
        if self.ncc {
            Similarity::Ncc { window: 5 }
        } else {
            Similarity::Nmi
        }
    }
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            sr_iterations: default_sr_iterations(),
            sigma: default_sigma(),
            resolution: default_resolution(),
            lambda: default_lambda(),
            last_iter_lambda: default_lambda(),
            delta: default_delta(),
            multires: default_multires(),
            average: default_average(),
            smooth_mask: 0.0,
            exclusion_ncc: default_exclusion_ncc(),
            ncc: false,
            structural: false,
            no_robust_statistics: false,
            exclude_slices_only: false,
            no_intensity_matching: false,
            svr_only: false,
            no_global: false,
            no_registration: false,
            with_background: false,
            bg_dilation: 0.0,
            force_exclude: Vec::new(),
            transformations: None,
        }
    }
}

fn default_iterations() -> usize {
    DEFAULT_ITERATIONS
}
fn default_sr_iterations() -> usize {
    DEFAULT_SR_ITERATIONS
}
fn default_sigma() -> f64 {
    DEFAULT_SIGMA_BIAS
}
fn default_resolution() -> f64 {
    DEFAULT_RESOLUTION
}
fn default_lambda() -> f64 {
    0.02
}
fn default_delta() -> f64 {
    150.0
}
fn default_multires() -> usize {
    3
}
fn default_average() -> f64 {
    DEFAULT_TARGET_INTENSITY
}
fn default_exclusion_ncc() -> f64 {
    DEFAULT_EXCLUSION_NCC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = ReconConfig::default();
        let text = toml::to_string(&cfg).expect("serialize");
        let parsed: ReconConfig = toml::from_str(&text).expect("deserialize");
        assert_eq!(parsed.iterations, cfg.iterations);
        assert_eq!(parsed.sr_iterations, cfg.sr_iterations);
    }

    #[test]
    fn empty_toml_falls_back_to_defaults() {
        let parsed: ReconConfig = toml::from_str("").expect("deserialize");
        assert_eq!(parsed.iterations, DEFAULT_ITERATIONS);
        assert_eq!(parsed.resolution, DEFAULT_RESOLUTION);
    }

    #[test]
    fn ncc_flag_selects_ncc_similarity() {
        let mut cfg = ReconConfig::default();
        cfg.ncc = true;
        assert_eq!(cfg.similarity(), Similarity::Ncc { window: 5 });
    }
}
