pub mod affine;
pub mod interpolate;
pub mod psf;
pub mod vecmath;

pub use affine::{Affine3, RigidTransform};
pub use interpolate::{gaussian_blur_2d, gaussian_blur_3d, resample, trilinear_sample};
pub use psf::{build_pixel_psf, psf_weight_sum, PsfEntry, PsfTable};
pub use vecmath::{Mat3, Vec3};
