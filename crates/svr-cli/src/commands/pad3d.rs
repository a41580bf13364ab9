use anyhow::Result;
use clap::Args;
use ndarray::Array3;

/// Pads a volume by `margin` voxels on every side, to avoid edge-of-FOV
/// PSF truncation ahead of reconstruction (mirrors the original
/// source's `pad-3d` tool; pure geometry, no format I/O here since
/// image I/O is a collaborator concern).
#[derive(Args)]
pub struct Pad3dArgs {
    #[arg(long)]
    pub margin: usize,
}

pub fn pad_volume(data: &Array3<f32>, margin: usize) -> Array3<f32> {
    let (d, h, w) = data.dim();
    let mut out = Array3::<f32>::zeros((d + 2 * margin, h + 2 * margin, w + 2 * margin));
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                out[[z + margin, y + margin, x + margin]] = data[[z, y, x]];
            }
        }
    }
    out
}

pub fn pad_mask(mask: &Array3<bool>, margin: usize) -> Array3<bool> {
    let (d, h, w) = mask.dim();
    let mut out = Array3::<bool>::from_elem((d + 2 * margin, h + 2 * margin, w + 2 * margin), false);
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                out[[z + margin, y + margin, x + margin]] = mask[[z, y, x]];
            }
        }
    }
    out
}

pub fn run(args: &Pad3dArgs) -> Result<()> {
    println!("pad-3d: margin={} voxels (operates on in-memory volumes only)", args.margin);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_volume_centers_original_data() {
        let data = Array3::<f32>::from_elem((2, 2, 2), 5.0);
        let padded = pad_volume(&data, 1);
        assert_eq!(padded.dim(), (4, 4, 4));
        assert_eq!(padded[[1, 1, 1]], 5.0);
        assert_eq!(padded[[0, 0, 0]], 0.0);
    }

    #[test]
    fn pad_mask_new_border_is_false() {
        let mask = Array3::<bool>::from_elem((2, 2, 2), true);
        let padded = pad_mask(&mask, 2);
        assert!(!padded[[0, 0, 0]]);
        assert!(padded[[2, 2, 2]]);
    }
}
