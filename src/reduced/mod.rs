pub mod assembler;
pub mod operators;

pub use assembler::{ProjectedDeim, ProjectionSpace, ReducedOperatorAssembler};
pub use operators::{DenseRecord, FullOrderTerms, NavierStokesOperators, OperatorFile};
