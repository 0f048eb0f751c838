use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use once_cell::sync::OnceCell;
use rayon::prelude::*;

use crate::deim::DeimArtifact;
use crate::error::{Result, RomError};
use crate::pod::Basis;
use crate::snapshot::DenseColumn;
use crate::sparse::SparseOperator;

/// A basis together with its modes laid out as the columns of a dense
/// matrix; the matrix is built on first use and shared by every projection.
#[derive(Debug, Clone)]
pub struct ProjectionSpace<P> {
    basis: Arc<Basis<P>>,
    columns: Arc<OnceCell<Arc<DMatrix<f64>>>>,
}

impl<P: DenseColumn> ProjectionSpace<P> {
    pub fn new(basis: Arc<Basis<P>>) -> Self {
        Self {
            basis,
            columns: Arc::new(OnceCell::new()),
        }
    }

    pub fn basis(&self) -> &Basis<P> {
        &self.basis
    }

    pub fn dim(&self) -> usize {
        self.basis.len()
    }

    /// Length of every mode.
    pub fn full_dim(&self) -> usize {
        self.basis.shape().0
    }

    pub fn columns(&self) -> Arc<DMatrix<f64>> {
        let columns = self.columns.get_or_init(|| {
            let modes: Vec<DVector<f64>> = self.basis.modes().iter().map(|m| m.column()).collect();
            Arc::new(DMatrix::from_columns(&modes))
        });
        Arc::clone(columns)
    }

    pub fn is_assembled(&self) -> bool {
        self.columns.get().is_some()
    }
}

/// Reduced DEIM terms: `Φᵀ A_i Ψ` for every matrix mode and `Φᵀ b_i` for
/// every source mode.
#[derive(Debug, Clone)]
pub struct ProjectedDeim {
    pub matrices: Vec<DMatrix<f64>>,
    pub sources: Vec<DVector<f64>>,
}

impl ProjectedDeim {
    /// `(Σ θ_a[i] Ar_i, Σ θ_b[i] br_i)`
    pub fn assemble(&self, theta_a: &[f64], theta_b: &[f64]) -> Result<(DMatrix<f64>, DVector<f64>)> {
        if theta_a.len() != self.matrices.len() || theta_b.len() != self.sources.len() {
            return Err(RomError::DimensionMismatch(format!(
                "{}/{} DEIM coefficients for {}/{} reduced terms",
                theta_a.len(),
                theta_b.len(),
                self.matrices.len(),
                self.sources.len()
            )));
        }
        let (Some(first_matrix), Some(first_source)) = (self.matrices.first(), self.sources.first()) else {
            return Err(RomError::DimensionMismatch(
                "projected DEIM without matrix or source terms".to_string(),
            ));
        };
        let (rows, cols) = first_matrix.shape();
        let matrix = self
            .matrices
            .iter()
            .zip(theta_a)
            .fold(DMatrix::zeros(rows, cols), |acc, (m, t)| acc + m * *t);
        let source = self
            .sources
            .iter()
            .zip(theta_b)
            .fold(DVector::zeros(first_source.len()), |acc, (b, t)| acc + b * *t);
        Ok((matrix, source))
    }

    /// Interpolates the DEIM coefficients from sampled entries, then assembles.
    pub fn evaluate(
        &self,
        artifact: &DeimArtifact,
        matrix_samples: &DVector<f64>,
        source_samples: &DVector<f64>,
    ) -> Result<(DMatrix<f64>, DVector<f64>)> {
        let theta_a = artifact.matrix_interpolator()?.coefficients(matrix_samples)?;
        let theta_b = artifact.source_interpolator()?.coefficients(source_samples)?;
        self.assemble(theta_a.as_slice(), theta_b.as_slice())
    }
}

/// Galerkin projection of full-order terms onto reduced spaces.
#[derive(Debug, Default)]
pub struct ReducedOperatorAssembler;

impl ReducedOperatorAssembler {
    /// `Φᵀ A Ψ`
    pub fn project_matrix<P: DenseColumn, Q: DenseColumn>(
        operator: &SparseOperator,
        test: &ProjectionSpace<P>,
        trial: &ProjectionSpace<Q>,
    ) -> Result<DMatrix<f64>> {
        if operator.nrows() != test.full_dim() || operator.ncols() != trial.full_dim() {
            return Err(RomError::DimensionMismatch(format!(
                "{}x{} operator between spaces of length {} and {}",
                operator.nrows(),
                operator.ncols(),
                test.full_dim(),
                trial.full_dim()
            )));
        }
        let psi = trial.columns();
        let applied: Vec<DVector<f64>> = psi
            .column_iter()
            .map(|column| operator.mul_vec(&column.into_owned()))
            .collect::<Result<_>>()?;
        let applied = DMatrix::from_columns(&applied);
        Ok(test.columns().transpose() * applied)
    }

    /// `Φᵀ b`
    pub fn project_source<P: DenseColumn>(source: &DVector<f64>, test: &ProjectionSpace<P>) -> Result<DVector<f64>> {
        if source.len() != test.full_dim() {
            return Err(RomError::DimensionMismatch(format!(
                "source of length {} projected on a space of length {}",
                source.len(),
                test.full_dim()
            )));
        }
        Ok(test.columns().tr_mul(source))
    }

    /// One reduced matrix per full-order affine term.
    pub fn project_affine_terms<P: DenseColumn, Q: DenseColumn>(
        terms: &[SparseOperator],
        test: &ProjectionSpace<P>,
        trial: &ProjectionSpace<Q>,
    ) -> Result<Vec<DMatrix<f64>>> {
        // Shared column matrices are built once, before the parallel section.
        test.columns();
        trial.columns();
        terms
            .par_iter()
            .map(|term| Self::project_matrix(term, test, trial))
            .collect()
    }

    /// Reduced tensor of a bilinear full-order term `N(u, v)`:
    /// `C[i][(j, k)] = φ_i · N(ψ_j, ψ_k)`. The first error returned by
    /// `operator` aborts the projection.
    pub fn project_bilinear<P, Q, F>(
        test: &ProjectionSpace<P>,
        trial: &ProjectionSpace<Q>,
        operator: F,
    ) -> Result<Vec<DMatrix<f64>>>
    where
        P: DenseColumn,
        Q: DenseColumn,
        F: Fn(&DVector<f64>, &DVector<f64>) -> Result<DVector<f64>> + Sync,
    {
        let phi = test.columns();
        let psi = trial.columns();
        let n = trial.dim();
        let entries: Vec<DVector<f64>> = (0..n * n)
            .into_par_iter()
            .map(|flat| {
                let (j, k) = (flat / n, flat % n);
                let value = operator(&psi.column(j).into_owned(), &psi.column(k).into_owned())?;
                if value.len() != phi.nrows() {
                    return Err(RomError::DimensionMismatch(format!(
                        "bilinear term returned length {}, expected {}",
                        value.len(),
                        phi.nrows()
                    )));
                }
                Ok(phi.tr_mul(&value))
            })
            .collect::<Result<_>>()?;

        let mut tensor = vec![DMatrix::zeros(n, n); test.dim()];
        for (flat, projected) in entries.iter().enumerate() {
            let (j, k) = (flat / n, flat % n);
            for (i, slice) in tensor.iter_mut().enumerate() {
                slice[(j, k)] = projected[i];
            }
        }
        Ok(tensor)
    }

    /// Projects every DEIM mode so that online evaluation is a weighted sum
    /// of small matrices.
    pub fn project_deim<P: DenseColumn>(
        artifact: &DeimArtifact,
        space: &ProjectionSpace<P>,
    ) -> Result<ProjectedDeim> {
        let matrices = Self::project_affine_terms(artifact.matrix_basis().modes(), space, space)?;
        let sources = artifact
            .source_basis()
            .modes()
            .iter()
            .map(|b| Self::project_source(b, space))
            .collect::<Result<_>>()?;
        Ok(ProjectedDeim { matrices, sources })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectral::EnergyProfile;

    fn space(modes: Vec<DVector<f64>>) -> ProjectionSpace<DVector<f64>> {
        let count = modes.len();
        let basis = Basis::from_parts(
            "U",
            0,
            modes,
            EnergyProfile::new(&vec![1.0; count], count as f64),
            vec![1.0; count],
        )
        .expect("basis");
        ProjectionSpace::new(Arc::new(basis))
    }

    fn axes() -> ProjectionSpace<DVector<f64>> {
        space(vec![
            DVector::from_vec(vec![1.0, 0.0, 0.0]),
            DVector::from_vec(vec![0.0, 1.0, 0.0]),
        ])
    }

    #[test]
    fn matrix_projection_picks_the_leading_block() {
        let operator = SparseOperator::from_dense(&DMatrix::from_row_slice(
            3,
            3,
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
        ));
        let space = axes();
        assert!(!space.is_assembled());
        let reduced = ReducedOperatorAssembler::project_matrix(&operator, &space, &space)
            .expect("projection");
        assert!(space.is_assembled());
        assert_eq!(reduced, DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 4.0, 5.0]));

        let source = ReducedOperatorAssembler::project_source(&DVector::from_vec(vec![3.0, -1.0, 8.0]), &space)
            .expect("source");
        assert_eq!(source, DVector::from_vec(vec![3.0, -1.0]));
    }

    #[test]
    fn bilinear_projection_of_pointwise_product() {
        let space = axes();
        let tensor = ReducedOperatorAssembler::project_bilinear(&space, &space, |u, v| Ok(u.component_mul(v)))
            .expect("bilinear");
        assert_eq!(tensor.len(), 2);
        assert_eq!(tensor[0][(0, 0)], 1.0);
        assert_eq!(tensor[0][(1, 1)], 0.0);
        assert_eq!(tensor[1][(1, 1)], 1.0);
        assert_eq!(tensor[1][(0, 1)], 0.0);
    }

    #[test]
    fn empty_projected_deim_is_rejected() {
        let projected = ProjectedDeim {
            matrices: Vec::new(),
            sources: Vec::new(),
        };
        assert!(matches!(
            projected.assemble(&[], &[]),
            Err(RomError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn mismatched_operator_is_rejected() {
        let operator = SparseOperator::zeros(4, 4);
        let space = axes();
        let result = ReducedOperatorAssembler::project_matrix(&operator, &space, &space);
        assert!(matches!(result, Err(RomError::DimensionMismatch(_))));
    }
}
