use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;
use tracing::info;

use svr_core::config::ReconConfig;
use svr_core::controller::ReconController;
use svr_core::geometry::{Affine3, Mat3, RigidTransform, Vec3};
use svr_core::global::NoOpGlobalRegistration;
use svr_core::metrics::{IterationMetrics, SnapshotSink};
use svr_core::registration::NullRegistrationBackend;
use svr_core::slice::Slice;
use svr_core::volume::Volume;

#[derive(Args)]
pub struct ReconstructArgs {
    /// JSON manifest describing the template grid and input slices. Slice
    /// pixel data is read from raw little-endian f32 files named in the
    /// manifest; DICOM/NIfTI parsing itself is an external collaborator.
    pub manifest: PathBuf,

    /// TOML configuration file (see `ReconConfig`); CLI flags below
    /// override individual fields when given.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory the per-iteration metrics files are written to.
    #[arg(short, long, default_value = "out")]
    pub output_dir: PathBuf,

    #[arg(long)]
    pub iterations: Option<usize>,

    #[arg(long)]
    pub resolution: Option<f64>,

    #[arg(long)]
    pub structural: bool,

    #[arg(long)]
    pub no_registration: bool,
}

#[derive(Deserialize)]
struct Manifest {
    template_dims: [usize; 3],
    template_spacing: f64,
    #[serde(default)]
    template_origin: [f64; 3],
    slices: Vec<ManifestSlice>,
}

#[derive(Deserialize)]
struct ManifestSlice {
    pixels_path: PathBuf,
    rows: usize,
    cols: usize,
    origin: [f64; 3],
    in_plane_spacing: f64,
    thickness: f64,
    #[serde(default)]
    translation: [f64; 3],
    stack_index: usize,
    slice_in_stack_index: usize,
}

fn load_config(args: &ReconstructArgs) -> Result<ReconConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => ReconConfig::default(),
    };
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if let Some(resolution) = args.resolution {
        config.resolution = resolution;
    }
    config.structural |= args.structural;
    config.no_registration |= args.no_registration;
    Ok(config)
}

fn load_manifest(path: &PathBuf) -> Result<Manifest> {
    let text = fs::read_to_string(path).with_context(|| format!("reading manifest {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing manifest {}", path.display()))
}

fn load_raw_f32(path: &PathBuf, rows: usize, cols: usize) -> Result<ndarray::Array2<f32>> {
    let bytes = fs::read(path).with_context(|| format!("reading pixel data {}", path.display()))?;
    let expected = rows * cols * 4;
    anyhow::ensure!(
        bytes.len() >= expected,
        "pixel file {} too short: expected {expected} bytes, got {}",
        path.display(),
        bytes.len()
    );
    let mut values = Vec::with_capacity(rows * cols);
    for chunk in bytes.chunks_exact(4).take(rows * cols) {
        values.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    ndarray::Array2::from_shape_vec((rows, cols), values).context("reshaping pixel data")
}

fn build_volume(manifest: &Manifest) -> Volume {
    let spacing = Vec3::new(manifest.template_spacing, manifest.template_spacing, manifest.template_spacing);
    let origin = Vec3::new(manifest.template_origin[0], manifest.template_origin[1], manifest.template_origin[2]);
    let affine = Affine3 { origin, axes: Mat3::IDENTITY, spacing };
    let dims = (manifest.template_dims[0], manifest.template_dims[1], manifest.template_dims[2]);
    Volume::new(dims, affine)
}

fn build_slices(manifest: &Manifest) -> Result<Vec<Slice>> {
    manifest
        .slices
        .iter()
        .map(|m| {
            let pixels = load_raw_f32(&m.pixels_path, m.rows, m.cols)?;
            let geometry = Affine3 {
                origin: Vec3::new(m.origin[0], m.origin[1], m.origin[2]),
                axes: Mat3::IDENTITY,
                spacing: Vec3::new(m.in_plane_spacing, m.in_plane_spacing, m.thickness),
            };
            let transform = RigidTransform {
                rotation: Mat3::IDENTITY,
                translation: Vec3::new(m.translation[0], m.translation[1], m.translation[2]),
            };
            Ok(Slice::new(pixels, geometry, m.thickness, transform, m.stack_index, m.slice_in_stack_index))
        })
        .collect()
}

/// Writes each metric to its own append-only file, one number per line
/// (spec.md §6's "one number per line, one file per metric").
struct FileSink {
    dir: PathBuf,
}

impl SnapshotSink for FileSink {
    fn record_metrics(&mut self, metrics: &IterationMetrics) {
        let write_line = |name: &str, value: String| -> std::io::Result<()> {
            let mut file = fs::OpenOptions::new().create(true).append(true).open(self.dir.join(name))?;
            writeln!(file, "{value}")
        };
        if let Some(ncc) = metrics.ncc {
            let _ = write_line("ncc.txt", ncc.to_string());
        }
        if let Some(nrmse) = metrics.nrmse {
            let _ = write_line("nrmse.txt", nrmse.to_string());
        }
        let _ = write_line("mean_weight.txt", metrics.mean_volume_weight.to_string());
        let _ = write_line("excluded_ratio.txt", metrics.excluded_ratio.to_string());
    }
}

pub fn run(args: &ReconstructArgs) -> Result<()> {
    let config = load_config(args)?;
    let manifest = load_manifest(&args.manifest)?;

    let mut volume = build_volume(&manifest);
    let mut slices = build_slices(&manifest)?;
    info!(slices = slices.len(), "loaded reconstruction inputs");

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating output directory {}", args.output_dir.display()))?;

    let backend = NullRegistrationBackend;
    let hook = NoOpGlobalRegistration;
    let controller = ReconController::new(&config, &backend, &hook);
    let mut sink = FileSink { dir: args.output_dir.clone() };

    controller
        .run(&mut volume, &mut slices, &mut sink)
        .map_err(|e| anyhow::anyhow!("reconstruction failed: {e}"))?;

    info!(output = %args.output_dir.display(), "reconstruction complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn load_raw_f32_round_trips_little_endian_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slice.raw");
        let values: [f32; 4] = [1.0, -2.5, 3.25, 0.0];
        let mut file = fs::File::create(&path).unwrap();
        for v in values {
            file.write_all(&v.to_le_bytes()).unwrap();
        }
        drop(file);

        let pixels = load_raw_f32(&path, 2, 2).unwrap();
        assert_eq!(pixels.as_slice().unwrap(), &values);
    }

    #[test]
    fn load_raw_f32_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.raw");
        fs::write(&path, [0u8; 4]).unwrap();
        assert!(load_raw_f32(&path, 2, 2).is_err());
    }
}
