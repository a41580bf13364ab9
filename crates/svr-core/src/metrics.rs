use crate::consts::EPSILON;
use crate::slice::Slice;
use crate::volume::Volume;

/// One outer iteration's recorded metrics (component 4.8 step 7):
/// NCC against ground truth (when available), NRMSE, mean volume
/// confidence/weight, and the fraction of slices currently excluded.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IterationMetrics {
    pub iteration: usize,
    pub ncc: Option<f64>,
    pub nrmse: Option<f64>,
    pub mean_volume_weight: f64,
    pub excluded_ratio: f64,
}

/// Fraction of slices currently force- or structurally-excluded.
pub fn excluded_ratio(slices: &[Slice]) -> f64 {
    if slices.is_empty() {
        return 0.0;
    }
    let excluded = slices.iter().filter(|s| !s.is_active()).count();
    excluded as f64 / slices.len() as f64
}

/// Mean of the volume's confidence grid (component 4.3's accumulated
/// per-thread weights, written once per SR step).
pub fn mean_volume_weight(volume: &Volume) -> f64 {
    if volume.confidence.is_empty() {
        return 0.0;
    }
    volume.confidence.iter().map(|v| *v as f64).sum::<f64>() / volume.confidence.len() as f64
}

/// NCC between `estimate` and `truth`, restricted to `truth`'s mask.
pub fn ncc_against_truth(estimate: &Volume, truth: &Volume) -> f64 {
    let mut sum_a = 0.0f64;
    let mut sum_b = 0.0f64;
    let mut count = 0usize;
    for ((a, b), &m) in estimate.data.iter().zip(truth.data.iter()).zip(truth.mask.iter()) {
        if m {
            sum_a += *a as f64;
            sum_b += *b as f64;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    let mean_a = sum_a / count as f64;
    let mean_b = sum_b / count as f64;

    let mut cov = 0.0f64;
    let mut var_a = 0.0f64;
    let mut var_b = 0.0f64;
    for ((a, b), &m) in estimate.data.iter().zip(truth.data.iter()).zip(truth.mask.iter()) {
        if m {
            let da = *a as f64 - mean_a;
            let db = *b as f64 - mean_b;
            cov += da * db;
            var_a += da * da;
            var_b += db * db;
        }
    }
    let denom = (var_a * var_b).sqrt();
    if denom > EPSILON {
        cov / denom
    } else {
        0.0
    }
}

/// Normalized RMSE between `estimate` and `truth`, restricted to
/// `truth`'s mask, normalized by the mask's intensity range.
pub fn nrmse_against_truth(estimate: &Volume, truth: &Volume) -> f64 {
    let mut sum_sq = 0.0f64;
    let mut count = 0usize;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for ((a, b), &m) in estimate.data.iter().zip(truth.data.iter()).zip(truth.mask.iter()) {
        if m {
            let d = *a as f64 - *b as f64;
            sum_sq += d * d;
            count += 1;
            min = min.min(*b as f64);
            max = max.max(*b as f64);
        }
    }
    if count == 0 || max <= min {
        return 0.0;
    }
    let rmse = (sum_sq / count as f64).sqrt();
    rmse / (max - min)
}

/// Collaborator the controller hands per-iteration metrics and optional
/// debug artefacts to; the core never touches the filesystem itself
/// (Design Notes: "Global I/O paths").
pub trait SnapshotSink {
    fn record_metrics(&mut self, metrics: &IterationMetrics);
    fn record_volume(&mut self, _iteration: usize, _volume: &Volume) {}
    fn record_slice_bias(&mut self, _iteration: usize, _slice_index: usize, _bias: &ndarray::Array2<f32>) {}
}

/// A `SnapshotSink` that discards everything, for runs that don't need
/// per-iteration artefacts.
pub struct NullSink;

impl SnapshotSink for NullSink {
    fn record_metrics(&mut self, _metrics: &IterationMetrics) {}
}

/// A `SnapshotSink` that keeps every metrics record in memory, useful
/// for tests and for the CLI before it writes the metrics file.
#[derive(Default)]
pub struct InMemorySink {
    pub metrics: Vec<IterationMetrics>,
}

impl SnapshotSink for InMemorySink {
    fn record_metrics(&mut self, metrics: &IterationMetrics) {
        self.metrics.push(*metrics);
    }
}
