use anyhow::Result;
use clap::Args;

/// Estimates slice thickness from z-axis spacing when the acquisition
/// metadata doesn't carry an explicit value, mirroring
/// `svrtk::Utility::GuessThickness` from the original source's
/// `guess-thickness` tool. Thickness is always a floating-point value
/// here (see `ReconConfig`'s resolution of the `default_thickness`
/// Open Question).
#[derive(Args)]
pub struct GuessThicknessArgs {
    /// Z-axis voxel spacing of the stack, in mm.
    pub z_spacing: f64,

    /// Multiplier applied to the spacing to account for slice gaps
    /// (thickness is usually slightly larger than spacing for 2D
    /// acquisitions with inter-slice gaps).
    #[arg(long, default_value = "1.0")]
    pub gap_factor: f64,
}

pub fn guess_thickness(z_spacing: f64, gap_factor: f64) -> f64 {
    (z_spacing * gap_factor).max(0.0)
}

pub fn run(args: &GuessThicknessArgs) -> Result<()> {
    let thickness = guess_thickness(args.z_spacing, args.gap_factor);
    println!("{thickness}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guess_thickness_scales_spacing() {
        assert!((guess_thickness(2.0, 1.0) - 2.0).abs() < 1e-9);
        assert!((guess_thickness(2.0, 1.2) - 2.4).abs() < 1e-9);
    }

    #[test]
    fn negative_spacing_clamps_to_zero() {
        assert_eq!(guess_thickness(-1.0, 1.0), 0.0);
    }
}
