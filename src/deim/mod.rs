pub mod builder;
pub mod interpolation;

pub use builder::{DeimArtifact, DeimBuilder, FieldDeim};
pub use interpolation::{magic_points, DeimInterpolator};
