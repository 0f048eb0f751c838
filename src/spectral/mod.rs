pub mod correlation;
pub mod eigenpairs;
pub mod krylov;

pub use correlation::CorrelationBuilder;
pub use eigenpairs::{EigenPairs, EnergyProfile};
pub use krylov::{Decomposer, EigenRequest, EigenTarget, KrylovDecomposer};
