use log::debug;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::config::SpectralConfig;
use crate::error::{Result, RomError};
use crate::spectral::eigenpairs::EigenPairs;

/// Relative size below which a new Krylov direction counts as a breakdown.
const BREAKDOWN: f64 = 1e-12;
/// Imaginary parts below this (relative) are rounding noise.
const IMAGINARY_TOL: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EigenTarget {
    /// Symmetric input, ranked by eigenvalue.
    LargestAlgebraic,
    /// General input, ranked by real part.
    LargestReal,
    /// One mode of a term that is constant up to scale: the pair `(λ, e_0)`,
    /// answered without any iteration.
    Canonical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EigenRequest {
    pub count: usize,
    pub target: EigenTarget,
}

impl EigenRequest {
    pub fn largest(count: usize) -> Self {
        Self {
            count,
            target: EigenTarget::LargestAlgebraic,
        }
    }

    pub fn largest_real(count: usize) -> Self {
        Self {
            count,
            target: EigenTarget::LargestReal,
        }
    }

    pub fn canonical() -> Self {
        Self {
            count: 1,
            target: EigenTarget::Canonical,
        }
    }
}

/// Leading-eigenpair extraction from a small dense matrix.
pub trait Decomposer: Send + Sync {
    fn decompose(&self, matrix: &DMatrix<f64>, request: EigenRequest) -> Result<EigenPairs>;
}

impl<D: Decomposer + ?Sized> Decomposer for &D {
    fn decompose(&self, matrix: &DMatrix<f64>, request: EigenRequest) -> Result<EigenPairs> {
        (**self).decompose(matrix, request)
    }
}

/// Explicitly restarted Arnoldi iteration with full reorthogonalisation.
/// On symmetric input the projected Hessenberg matrix is tridiagonal and the
/// process reduces to Lanczos. When the subspace would span the whole matrix
/// a symmetric request goes straight to a dense eigensolver.
#[derive(Debug, Clone, Default)]
pub struct KrylovDecomposer {
    config: SpectralConfig,
}

impl KrylovDecomposer {
    pub fn new(config: SpectralConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SpectralConfig {
        &self.config
    }

    fn subspace_dim(&self, order: usize, count: usize) -> usize {
        self.config
            .subspace_dim
            .unwrap_or(order)
            .max(count + 1)
            .min(order)
    }
}

impl Decomposer for KrylovDecomposer {
    fn decompose(&self, matrix: &DMatrix<f64>, request: EigenRequest) -> Result<EigenPairs> {
        let n = matrix.nrows();
        if matrix.ncols() != n {
            return Err(RomError::DimensionMismatch(format!(
                "eigen decomposition needs a square matrix, got {}x{}",
                n,
                matrix.ncols()
            )));
        }
        let k = request.count;
        if k == 0 || k > n {
            return Err(RomError::DimensionMismatch(format!(
                "cannot extract {k} eigenpairs from a matrix of order {n}"
            )));
        }

        if request.target == EigenTarget::Canonical {
            if k != 1 {
                return Err(RomError::DimensionMismatch(format!(
                    "the canonical pair answers one mode, {k} were requested"
                )));
            }
            return Ok(EigenPairs::canonical_unit(matrix));
        }

        let m = self.subspace_dim(n, k);
        if m == n && request.target == EigenTarget::LargestAlgebraic {
            debug!("subspace covers the full order {n}, using the dense symmetric solver");
            let ritz = symmetric_ritz(matrix, k);
            let values = DVector::from_iterator(k, ritz.iter().map(|(theta, _)| *theta));
            let vectors: Vec<DVector<f64>> = ritz.into_iter().map(|(_, v)| v).collect();
            let mut pairs = EigenPairs::new(values, DMatrix::from_columns(&vectors));
            pairs.normalize_signs();
            return Ok(pairs);
        }

        let restarts = self.config.max_restarts.max(1);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.config.seed);
        let mut start = random_unit(n, &mut rng);
        let mut converged = 0;

        for restart in 0..restarts {
            let factorization = arnoldi(matrix, &start, m, &mut rng);
            let ritz = match request.target {
                EigenTarget::LargestReal => real_ritz(&factorization.hessenberg, k)?,
                EigenTarget::LargestAlgebraic | EigenTarget::Canonical => {
                    symmetric_ritz(&factorization.hessenberg, k)
                }
            };

            // A full-order subspace is invariant, so its residual vanishes.
            let beta = if m == n { 0.0 } else { factorization.beta };
            let theta_max = ritz.iter().map(|(theta, _)| theta.abs()).fold(0.0, f64::max);
            let floor = f64::EPSILON.powf(2.0 / 3.0) * theta_max;
            converged = ritz
                .iter()
                .filter(|(theta, y)| {
                    beta * y[m - 1].abs() <= self.config.tolerance * theta.abs().max(floor)
                })
                .count();
            debug!(
                "krylov restart {}: {}/{} Ritz pairs converged (subspace {})",
                restart, converged, k, m
            );

            let vectors: Vec<DVector<f64>> = ritz
                .iter()
                .map(|(_, y)| {
                    let x = &factorization.basis * y;
                    let norm = x.norm();
                    if norm > 0.0 { x / norm } else { x }
                })
                .collect();

            if converged == k {
                let values = DVector::from_iterator(k, ritz.iter().map(|(theta, _)| *theta));
                let mut pairs = EigenPairs::new(values, DMatrix::from_columns(&vectors));
                pairs.normalize_signs();
                return Ok(pairs);
            }

            let combined = vectors
                .iter()
                .fold(DVector::zeros(n), |acc: DVector<f64>, v| acc + v);
            let norm = combined.norm();
            start = if norm > BREAKDOWN {
                combined / norm
            } else {
                random_unit(n, &mut rng)
            };
        }

        Err(RomError::DecompositionFailure {
            requested: k,
            converged,
            restarts,
        })
    }
}

struct Arnoldi {
    basis: DMatrix<f64>,
    hessenberg: DMatrix<f64>,
    beta: f64,
}

fn arnoldi(
    matrix: &DMatrix<f64>,
    start: &DVector<f64>,
    m: usize,
    rng: &mut Xoshiro256PlusPlus,
) -> Arnoldi {
    let n = matrix.nrows();
    let scale = matrix.norm().max(f64::MIN_POSITIVE);
    let mut basis = DMatrix::zeros(n, m);
    let mut hessenberg = DMatrix::zeros(m, m);
    let mut beta = 0.0;
    basis.set_column(0, start);

    for j in 0..m {
        let mut w = matrix * basis.column(j);
        for _ in 0..2 {
            for i in 0..=j {
                let coefficient = basis.column(i).dot(&w);
                w.axpy(-coefficient, &basis.column(i), 1.0);
                hessenberg[(i, j)] += coefficient;
            }
        }
        let norm = w.norm();
        if j + 1 == m {
            beta = norm;
            break;
        }
        if norm > BREAKDOWN * scale {
            hessenberg[(j + 1, j)] = norm;
            basis.set_column(j + 1, &(w / norm));
        } else {
            // Invariant subspace found; continue from a fresh orthogonal direction.
            let fresh = orthogonal_direction(&basis, j + 1, rng);
            basis.set_column(j + 1, &fresh);
        }
    }

    Arnoldi {
        basis,
        hessenberg,
        beta,
    }
}

fn random_unit(n: usize, rng: &mut Xoshiro256PlusPlus) -> DVector<f64> {
    let v = DVector::from_iterator(n, (0..n).map(|_| rng.r#gen::<f64>() - 0.5));
    let norm = v.norm();
    if norm > 0.0 {
        v / norm
    } else {
        let mut e = DVector::zeros(n);
        e[0] = 1.0;
        e
    }
}

/// Unit vector orthogonal to the first `used` columns of `basis`; requires `used < n`.
fn orthogonal_direction(basis: &DMatrix<f64>, used: usize, rng: &mut Xoshiro256PlusPlus) -> DVector<f64> {
    let n = basis.nrows();
    let project_out = |mut v: DVector<f64>| {
        for _ in 0..2 {
            for i in 0..used {
                let coefficient = basis.column(i).dot(&v);
                v.axpy(-coefficient, &basis.column(i), 1.0);
            }
        }
        v
    };

    let candidate = project_out(random_unit(n, rng));
    let norm = candidate.norm();
    if norm > 1e-8 {
        return candidate / norm;
    }

    let mut best = DVector::zeros(n);
    let mut best_norm = 0.0;
    for axis in 0..n {
        let mut e = DVector::zeros(n);
        e[axis] = 1.0;
        let residual = project_out(e);
        let norm = residual.norm();
        if norm > best_norm {
            best_norm = norm;
            best = residual;
        }
    }
    if best_norm > 0.0 { best / best_norm } else { best }
}

fn symmetric_ritz(hessenberg: &DMatrix<f64>, k: usize) -> Vec<(f64, DVector<f64>)> {
    let symmetric = (hessenberg + hessenberg.transpose()) * 0.5;
    let eigen = SymmetricEigen::new(symmetric);
    let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    order
        .into_iter()
        .take(k)
        .map(|idx| (eigen.eigenvalues[idx], eigen.eigenvectors.column(idx).into_owned()))
        .collect()
}

fn real_ritz(hessenberg: &DMatrix<f64>, k: usize) -> Result<Vec<(f64, DVector<f64>)>> {
    let m = hessenberg.nrows();
    let mut values: Vec<(f64, f64)> = hessenberg
        .complex_eigenvalues()
        .iter()
        .map(|c| (c.re, c.im))
        .collect();
    values.sort_by(|a, b| b.0.total_cmp(&a.0));
    let scale = values.iter().map(|(re, im)| re.hypot(*im)).fold(1.0, f64::max);

    let mut ritz: Vec<(f64, DVector<f64>)> = Vec::with_capacity(k);
    for &(re, im) in values.iter().take(k) {
        if im.abs() > IMAGINARY_TOL * re.abs().max(1.0) {
            return Err(RomError::ComplexEigenvalue { re, im });
        }
        // Repeated eigenvalues take successive null-space directions.
        let repeat = ritz
            .iter()
            .filter(|(theta, _)| (theta - re).abs() <= IMAGINARY_TOL * scale)
            .count();
        let shifted = hessenberg - DMatrix::identity(m, m) * re;
        let svd = shifted.svd(false, true);
        let v_t = svd.v_t.as_ref().ok_or_else(|| {
            RomError::LinearSolveFailed("SVD of the shifted Hessenberg matrix".to_string())
        })?;
        let mut by_size: Vec<usize> = (0..svd.singular_values.len()).collect();
        by_size.sort_by(|&a, &b| svd.singular_values[a].total_cmp(&svd.singular_values[b]));
        let row = by_size[repeat.min(by_size.len() - 1)];
        let y = v_t.row(row).transpose();
        let norm = y.norm();
        ritz.push((re, if norm > 0.0 { y / norm } else { y }));
    }
    Ok(ritz)
}
