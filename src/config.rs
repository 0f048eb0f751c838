use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const DEFAULT_OUTPUT_ROOT: &str = "rom_output";

/// Settings for the Krylov eigen-solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectralConfig {
    pub tolerance: f64,
    pub max_restarts: usize,
    /// Krylov subspace dimension; `None` uses the matrix order (the snapshot count).
    pub subspace_dim: Option<usize>,
    pub seed: u64,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_restarts: 1000,
            subspace_dim: None,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Tolerance {
    Absolute(f64),
    Relative(f64),
    Combined(f64, f64),
}

impl Tolerance {
    pub fn is_met(&self, norm: f64, initial_norm: f64) -> bool {
        match *self {
            Tolerance::Absolute(tol) => norm < tol,
            Tolerance::Relative(tol) => initial_norm > 0.0 && norm / initial_norm < tol,
            Tolerance::Combined(abs_tol, rel_tol) => {
                norm < abs_tol || (initial_norm > 0.0 && norm / initial_norm < rel_tol)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonConfig {
    pub tolerance: Tolerance,
    pub max_iterations: u32,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            tolerance: Tolerance::Absolute(1e-8),
            max_iterations: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecompositionMethod {
    /// Eigen-decomposition of the snapshot correlation matrix.
    Snapshots,
    /// Direct singular value decomposition of the weighted snapshot matrix.
    Svd,
}

/// How the basis cache treats an existing artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Reuse a matching artifact, compute and store otherwise.
    Auto,
    /// The artifact must already exist; a miss is a storage error.
    AlreadyComputed,
    /// Always recompute and overwrite.
    Recompute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub spectral: SpectralConfig,
    pub method: DecompositionMethod,
    pub output_root: PathBuf,
    pub orthogonalize: bool,
    pub cache_policy: CachePolicy,
    /// Requested mode count per field; 0 selects the maximum.
    pub modes: indexmap::IndexMap<String, usize>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            spectral: SpectralConfig::default(),
            method: DecompositionMethod::Snapshots,
            output_root: PathBuf::from(DEFAULT_OUTPUT_ROOT),
            orthogonalize: true,
            cache_policy: CachePolicy::Auto,
            modes: indexmap::IndexMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stabilization {
    Supremizer,
    Ppe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    pub newton: NewtonConfig,
    pub t_start: f64,
    pub t_end: f64,
    pub dt: f64,
    pub nu: f64,
    pub stabilization: Stabilization,
    pub print_every: usize,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            newton: NewtonConfig::default(),
            t_start: 0.0,
            t_end: 1.0,
            dt: 1e-2,
            nu: 1e-2,
            stabilization: Stabilization::Supremizer,
            print_every: 1,
        }
    }
}

impl OnlineConfig {
    /// Number of time steps between `t_start` and `t_end`.
    pub fn step_count(&self) -> usize {
        if self.dt <= 0.0 || self.t_end <= self.t_start {
            return 0;
        }
        ((self.t_end - self.t_start) / self.dt - 1e-9).ceil().max(0.0) as usize
    }
}
