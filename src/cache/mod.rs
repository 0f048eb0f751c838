pub mod basis_cache;
pub mod store;

pub use basis_cache::{BasisCache, BasisKey, CacheLookup};
pub use store::{ArtifactStore, FsArtifactStore, MemoryArtifactStore, StoreResult};
