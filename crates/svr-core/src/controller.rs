use tracing::info;

use crate::bias;
use crate::config::ReconConfig;
use crate::em::{self, RobustStats};
use crate::error::{ReconError, Result};
use crate::global::GlobalRegistrationHook;
use crate::metrics::{self, IterationMetrics, SnapshotSink};
use crate::registration::{self, RegistrationBackend, RegistrationPhase};
use crate::simulate;
use crate::slice::Slice;
use crate::solver;
use crate::structural;
use crate::volume::Volume;

/// Orchestrates the outer registration/reconstruction loop, the inner
/// SR loop, and the smoothing-parameter schedule (component 4.8).
pub struct ReconController<'a> {
    pub config: &'a ReconConfig,
    pub registration_backend: &'a dyn RegistrationBackend,
    pub global_hook: &'a dyn GlobalRegistrationHook,
}

impl<'a> ReconController<'a> {
    pub fn new(
        config: &'a ReconConfig,
        registration_backend: &'a dyn RegistrationBackend,
        global_hook: &'a dyn GlobalRegistrationHook,
    ) -> Self {
        Self {
            config,
            registration_backend,
            global_hook,
        }
    }

    /// Runs the full reconstruction. `slices` already carry their
    /// initial transforms and stack/package indices; `volume` is the
    /// template grid, pre-allocated at the configured resolution.
    /// Force-excludes `config.force_exclude` before the first outer
    /// iteration (permanent for the run).
    pub fn run(&self, volume: &mut Volume, slices: &mut [Slice], sink: &mut dyn SnapshotSink) -> Result<()> {
        if volume.mask.iter().all(|m| !*m) {
            return Err(ReconError::ResourceFatal("reconstruction mask is empty".into()));
        }
        for &idx in &self.config.force_exclude {
            if let Some(slice) = slices.get_mut(idx) {
                slice.force_excluded = true;
            }
        }

        if !self.config.no_intensity_matching {
            bias::match_stack_intensities(slices, self.config.average);
        }

        if self.config.with_background {
            volume.dilate_mask(self.config.bg_dilation.round().max(0.0) as usize);
        }
        if self.config.smooth_mask > 0.0 {
            volume.smooth_mask(self.config.smooth_mask);
        }

        if !self.config.no_global {
            self.global_hook.align_stacks(slices);
        }

        let iterations = if self.config.no_registration { 1 } else { self.config.iterations };

        for iter in 0..iterations {
            self.run_outer_iteration(iter, iterations, volume, slices, sink)?;
        }
        Ok(())
    }

    fn run_outer_iteration(
        &self,
        iter: usize,
        iterations: usize,
        volume: &mut Volume,
        slices: &mut [Slice],
        sink: &mut dyn SnapshotSink,
    ) -> Result<()> {
        for slice in slices.iter_mut() {
            slice.reset_structural_flag();
        }

        let registering = !self.config.no_registration && (iter > 0 || !self.config.svr_only);
        if registering {
            let phase = registration_phase_for(iter, iterations);
            registration::run_registration_pass(
                slices,
                volume,
                self.registration_backend,
                self.config.similarity(),
                phase,
                |s| s.stack_index,
            );
        }

        if self.config.structural {
            structural::global_ncc_gate(slices, self.config.exclusion_ncc);
        }

        let (lambda, delta) = self.smoothing_schedule(iter, iterations);

        for slice in slices.iter_mut() {
            if slice.is_active() {
                slice.rebuild_psf_table(volume);
            }
        }
        drop_geometry_degenerate_slices(slices);

        seed_volume(volume, slices);
        simulate::simulate_all(slices, volume);

        let (min, max) = em::observed_range(slices);
        let mut stats = RobustStats::init(min, max);
        if !self.config.no_robust_statistics {
            if !self.config.exclude_slices_only {
                em::e_step_pixels(slices, &stats);
            }
            em::e_step_slices(slices, &stats);
        }
        if self.config.structural {
            structural::local_ssim_gate(slices, crate::consts::DEFAULT_SSIM_THRESHOLD);
        }

        let sr_iterations = if iter + 1 == iterations {
            self.config.sr_iterations * 3
        } else {
            self.config.sr_iterations
        };
        let stride = if iter + 1 == iterations { 1 } else { 2 };

        for _ in 0..sr_iterations {
            if !self.config.no_intensity_matching {
                bias::update_all(slices, Some(self.config.sigma));
            }
            solver::sr_step(volume, slices, lambda, delta, stride);
            normalize_bias(slices);
            simulate::simulate_all(slices, volume);
            if !self.config.no_robust_statistics {
                em::m_step(slices, &mut stats);
                if !self.config.exclude_slices_only {
                    em::e_step_pixels(slices, &stats);
                }
                em::e_step_slices(slices, &stats);
            }
            if self.config.structural {
                structural::local_ssim_gate(slices, crate::consts::DEFAULT_SSIM_THRESHOLD);
            }
        }

        if !self.config.with_background {
            volume.apply_roi_mask();
        }

        let mean_weight = metrics::mean_volume_weight(volume);
        let ratio = metrics::excluded_ratio(slices);
        info!(iteration = iter, mean_weight, excluded_ratio = ratio, "outer iteration complete");
        sink.record_metrics(&IterationMetrics {
            iteration: iter,
            ncc: None,
            nrmse: None,
            mean_volume_weight: mean_weight,
            excluded_ratio: ratio,
        });
        sink.record_volume(iter, volume);

        Ok(())
    }

    /// Multi-resolution lambda cascade: on the final outer iteration use
    /// `(delta, last_iter_lambda)`; otherwise double `lambda` every
    /// `ceil(iterations/levels)` iterations, per the Open Question's
    /// literal integer-division predicate.
    fn smoothing_schedule(&self, iter: usize, iterations: usize) -> (f64, f64) {
        if iter + 1 == iterations {
            return (self.config.last_iter_lambda, self.config.delta);
        }
        let levels = self.config.multires.max(1);
        let mut lambda = self.config.lambda;
        for level in 0..levels {
            if iterations > 0 && iter == iterations * (levels - level - 1) / levels {
                lambda *= 2.0f64.powi(level as i32);
                break;
            }
        }
        (lambda, self.config.delta)
    }
}

fn registration_phase_for(iter: usize, iterations: usize) -> RegistrationPhase {
    if iterations <= 1 {
        return RegistrationPhase::PerSlice;
    }
    if iter == 0 {
        RegistrationPhase::Package
    } else if iter == 1 {
        RegistrationPhase::OddEven
    } else {
        RegistrationPhase::PerSlice
    }
}

/// Drop slices whose PSF list is empty after geometry alignment — their
/// stack had no overlap with the ROI (§7, not fatal). The slice stays
/// in the vector (so indices stay stable across the run) but is marked
/// permanently force-excluded.
fn drop_geometry_degenerate_slices(slices: &mut [Slice]) {
    for (idx, slice) in slices.iter_mut().enumerate() {
        if slice.is_active() && slice.has_no_overlap() {
            tracing::warn!(slice = idx, "slice has no PSF overlap with volume, dropping");
            slice.force_excluded = true;
        }
    }
}

/// Gaussian seed volume V0[v] = sum(weighted slice contributions) /
/// sum(weights), computed once per outer iteration before the inner SR
/// loop. Reuses the PSF scatter pattern: each pixel's list distributes
/// `pixel_weight * slice_weight * y` onto the voxels it overlaps.
fn seed_volume(volume: &mut Volume, slices: &[Slice]) {
    let total = volume.data.len();
    let mut numerator = vec![0.0f64; total];
    let mut denominator = vec![0.0f64; total];

    for slice in slices {
        if !slice.is_active() {
            continue;
        }
        let table = match slice.psf_table() {
            Some(t) => t,
            None => continue,
        };
        let (rows, cols) = slice.dims();
        for row in 0..rows {
            for col in 0..cols {
                let y = slice.pixels[[row, col]] as f64;
                let weight = slice.slice_weight as f64 * slice.pixel_weight[[row, col]] as f64;
                for entry in &table[[row, col]] {
                    numerator[entry.voxel_index] += entry.weight as f64 * weight * y;
                    denominator[entry.voxel_index] += entry.weight as f64 * weight;
                }
            }
        }
    }

    let data = volume.data.as_slice_mut().expect("volume data is contiguous");
    let confidence = volume.confidence.as_slice_mut().expect("volume confidence is contiguous");
    for i in 0..total {
        confidence[i] = denominator[i] as f32;
        data[i] = if denominator[i] > crate::consts::EPSILON {
            (numerator[i] / denominator[i]) as f32
        } else {
            data[i]
        };
    }
}

/// Subtracts the in-mask mean log-bias across all active slices from
/// every slice's bias field, per component 4.5's optional global bias
/// correction, applied once per inner SR iteration.
fn normalize_bias(slices: &mut [Slice]) {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for slice in slices.iter() {
        if !slice.is_active() {
            continue;
        }
        for ((b, &inside), &cov) in slice.bias.iter().zip(slice.inside_mask.iter()).zip(slice.coverage.iter()) {
            if inside && cov as f64 >= crate::consts::COVERAGE_FLOOR {
                sum += *b as f64;
                count += 1;
            }
        }
    }
    if count == 0 {
        return;
    }
    let mean = sum / count as f64;
    for slice in slices.iter_mut() {
        if !slice.is_active() {
            continue;
        }
        for b in slice.bias.iter_mut() {
            *b -= mean as f32;
        }
    }
}
