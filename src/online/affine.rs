use log::info;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::error::{Result, RomError};
use crate::reduced::{ProjectionSpace, ReducedOperatorAssembler};
use crate::snapshot::DenseColumn;
use crate::sparse::SparseOperator;

/// Parametrized linear problem `(Σ_i μ_i A_i) a = b` in reduced coordinates,
/// such as a reduced Laplacian with affine conductivities.
#[derive(Debug, Clone)]
pub struct AffineLinearProblem {
    terms: Vec<DMatrix<f64>>,
    rhs: DVector<f64>,
}

impl AffineLinearProblem {
    pub fn new(terms: Vec<DMatrix<f64>>, rhs: DVector<f64>) -> Result<Self> {
        let n = rhs.len();
        if terms.is_empty() {
            return Err(RomError::DimensionMismatch("affine problem without terms".to_string()));
        }
        if let Some(term) = terms.iter().find(|t| t.shape() != (n, n)) {
            return Err(RomError::DimensionMismatch(format!(
                "affine term of shape {}x{} for a reduced order of {n}",
                term.nrows(),
                term.ncols()
            )));
        }
        Ok(Self { terms, rhs })
    }

    /// Projects full-order affine terms and right-hand side onto `space`.
    pub fn from_projection<P: DenseColumn>(
        terms: &[SparseOperator],
        rhs: &DVector<f64>,
        space: &ProjectionSpace<P>,
    ) -> Result<Self> {
        let reduced = ReducedOperatorAssembler::project_affine_terms(terms, space, space)?;
        let rhs = ReducedOperatorAssembler::project_source(rhs, space)?;
        Self::new(reduced, rhs)
    }

    pub fn order(&self) -> usize {
        self.rhs.len()
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    pub fn terms(&self) -> &[DMatrix<f64>] {
        &self.terms
    }

    pub fn rhs(&self) -> &DVector<f64> {
        &self.rhs
    }

    pub fn assemble(&self, mu: &[f64]) -> Result<DMatrix<f64>> {
        if mu.len() != self.terms.len() {
            return Err(RomError::DimensionMismatch(format!(
                "{} parameters for {} affine terms",
                mu.len(),
                self.terms.len()
            )));
        }
        let n = self.order();
        Ok(self
            .terms
            .iter()
            .zip(mu)
            .fold(DMatrix::zeros(n, n), |acc, (term, weight)| acc + term * *weight))
    }

    pub fn solve(&self, mu: &[f64]) -> Result<DVector<f64>> {
        self.assemble(mu)?
            .lu()
            .solve(&self.rhs)
            .ok_or_else(|| RomError::LinearSolveFailed(format!("reduced affine system singular for mu = {mu:?}")))
    }

    /// One reduced solution per parameter row.
    pub fn solve_online(&self, parameters: &DMatrix<f64>) -> Result<Vec<DVector<f64>>> {
        info!(
            "solving the reduced affine problem for {} parameter samples",
            parameters.nrows()
        );
        (0..parameters.nrows())
            .into_par_iter()
            .map(|row| {
                let mu: Vec<f64> = parameters.row(row).iter().copied().collect();
                self.solve(&mu)
            })
            .collect()
    }
}
