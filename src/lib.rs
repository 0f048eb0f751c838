pub mod cache;
pub mod case;
pub mod config;
pub mod deim;
pub mod error;
pub mod online;
pub mod pod;
pub mod reconstruct;
pub mod reduced;
pub mod snapshot;
pub mod sparse;
pub mod spectral;

pub use cache::{ArtifactStore, BasisCache, BasisKey, CacheLookup, FsArtifactStore, MemoryArtifactStore};
pub use case::{Case, CaseConfig, CaseLoader, OnlineCase};
pub use config::{
    CachePolicy, DecompositionMethod, NewtonConfig, OfflineConfig, OnlineConfig, SpectralConfig, Stabilization,
    Tolerance,
};
pub use deim::{magic_points, DeimArtifact, DeimBuilder, DeimInterpolator, FieldDeim};
pub use error::{Result, RomError, StoreError};
pub use online::{
    AffineLinearProblem, NavierStokesSystem, NewtonOutcome, NewtonSolver, OnlineRun, ReducedNavierStokes,
    ReducedSystem, StepContext, Trajectory,
};
pub use pod::{gram_schmidt, Basis, BasisBuilder, Normalization};
pub use reconstruct::{FieldSink, JsonFieldWriter, Reconstructor};
pub use reduced::{NavierStokesOperators, ProjectedDeim, ProjectionSpace, ReducedOperatorAssembler};
pub use snapshot::{DenseColumn, FieldSnapshot, PayloadRecord, Snapshot, SnapshotPayload, SnapshotSet};
pub use sparse::{OperatorSnapshot, SparseOperator};
pub use spectral::{CorrelationBuilder, Decomposer, EigenPairs, EigenRequest, EigenTarget, EnergyProfile, KrylovDecomposer};
