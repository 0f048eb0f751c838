pub mod basis;
pub mod builder;

pub use basis::{gram_schmidt, Basis, Normalization};
pub use builder::BasisBuilder;
