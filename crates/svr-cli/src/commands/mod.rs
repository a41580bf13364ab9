pub mod guess_thickness;
pub mod pad3d;
pub mod reconstruct;
pub mod transform_rename;
