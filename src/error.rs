use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by an [`ArtifactStore`](crate::cache::ArtifactStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact {name} not found under {dir}")]
    Missing { dir: String, name: String },
    #[error("i/o failure on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed artifact {path:?}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("artifact {name} under {dir} is corrupt: {reason}")]
    Corrupt {
        dir: String,
        name: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum RomError {
    #[error("snapshot set for {field} needs at least {minimum} snapshots, got {found}")]
    TooFewSnapshots {
        field: String,
        minimum: usize,
        found: usize,
    },
    #[error(
        "requested {requested} modes for {term}, but only {available} are available from {snapshots} snapshots"
    )]
    InvalidModeCount {
        term: String,
        requested: usize,
        available: usize,
        snapshots: usize,
    },
    #[error("snapshot {index} of {field} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        field: String,
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("snapshot {index} belongs to field {found}, expected {expected}")]
    FieldMismatch {
        index: usize,
        expected: String,
        found: String,
    },
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("mode {index} of {term} has vanishing norm {norm:e}")]
    DegenerateMode {
        term: String,
        index: usize,
        norm: f64,
    },
    #[error("eigen decomposition did not converge: {converged}/{requested} pairs after {restarts} restarts")]
    DecompositionFailure {
        requested: usize,
        converged: usize,
        restarts: usize,
    },
    #[error("eigen decomposition produced a complex Ritz value {re} + {im}i among the wanted pairs")]
    ComplexEigenvalue { re: f64, im: f64 },
    #[error(
        "Newton iteration did not converge at step {step} (t = {time:e}): residual {residual:e} after {iterations} iterations"
    )]
    NonConvergence {
        step: usize,
        time: f64,
        iterations: u32,
        residual: f64,
    },
    #[error("linear solve failed: {0}")]
    LinearSolveFailed(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl RomError {
    /// Caller errors detected before any numerical work.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            RomError::TooFewSnapshots { .. }
                | RomError::InvalidModeCount { .. }
                | RomError::ShapeMismatch { .. }
                | RomError::FieldMismatch { .. }
                | RomError::DimensionMismatch(_)
        )
    }

    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            RomError::DegenerateMode { .. }
                | RomError::DecompositionFailure { .. }
                | RomError::ComplexEigenvalue { .. }
                | RomError::NonConvergence { .. }
                | RomError::LinearSolveFailed(_)
        )
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, RomError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, RomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_disjoint() {
        let precondition = RomError::InvalidModeCount {
            term: "U".into(),
            requested: 9,
            available: 8,
            snapshots: 10,
        };
        assert!(precondition.is_precondition());
        assert!(!precondition.is_numerical());

        let numerical = RomError::NonConvergence {
            step: 3,
            time: 0.3,
            iterations: 50,
            residual: 1.0,
        };
        assert!(numerical.is_numerical());
        assert!(!numerical.is_storage());

        let storage = RomError::from(StoreError::Missing {
            dir: "U".into(),
            name: "U_0".into(),
        });
        assert!(storage.is_storage());
        assert!(!storage.is_precondition());
    }
}
