use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::config::Stabilization;
use crate::error::{Result, RomError};
use crate::reduced::assembler::{ProjectionSpace, ReducedOperatorAssembler};
use crate::snapshot::DenseColumn;
use crate::sparse::SparseOperator;

/// Row-major dense matrix as stored in `online.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseRecord {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl DenseRecord {
    pub fn from_matrix(matrix: &DMatrix<f64>) -> Self {
        Self {
            rows: matrix.nrows(),
            cols: matrix.ncols(),
            data: matrix.transpose().as_slice().to_vec(),
        }
    }

    pub fn to_matrix(&self) -> Result<DMatrix<f64>> {
        if self.data.len() != self.rows * self.cols {
            return Err(RomError::DimensionMismatch(format!(
                "{} values for a {}x{} matrix",
                self.data.len(),
                self.rows,
                self.cols
            )));
        }
        Ok(DMatrix::from_row_slice(self.rows, self.cols, &self.data))
    }
}

/// Serialized form of [`NavierStokesOperators`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorFile {
    pub mass: DenseRecord,
    pub diffusion: DenseRecord,
    pub convection: Vec<DenseRecord>,
    pub gradient: DenseRecord,
    #[serde(default)]
    pub divergence: Option<DenseRecord>,
    #[serde(default)]
    pub pressure_laplacian: Option<DenseRecord>,
    #[serde(default)]
    pub pressure_convection: Vec<DenseRecord>,
    #[serde(default)]
    pub pressure_boundary: Option<DenseRecord>,
}

fn optional(record: &Option<DenseRecord>) -> Result<Option<DMatrix<f64>>> {
    record.as_ref().map(DenseRecord::to_matrix).transpose()
}

/// Galerkin-projected terms of the incompressible Navier-Stokes equations.
///
/// `n_u` is the velocity basis size (lift, POD and supremizer modes) and
/// `n_p` the pressure basis size.
#[derive(Debug, Clone, PartialEq)]
pub struct NavierStokesOperators {
    /// `M` (n_u × n_u)
    pub mass: DMatrix<f64>,
    /// `B` (n_u × n_u), the projected vector Laplacian.
    pub diffusion: DMatrix<f64>,
    /// `C_i` (n_u slices of n_u × n_u): `(C_i)_{jk} = φ_i · (ψ_j · ∇)ψ_k`.
    pub convection: Vec<DMatrix<f64>>,
    /// `K` (n_u × n_p)
    pub gradient: DMatrix<f64>,
    /// `P` (n_p × n_u), supremizer continuity rows.
    pub divergence: Option<DMatrix<f64>>,
    /// `D` (n_p × n_p), PPE pressure Laplacian.
    pub pressure_laplacian: Option<DMatrix<f64>>,
    /// `G_j` (n_p slices of n_u × n_u), PPE divergence of convection.
    pub pressure_convection: Vec<DMatrix<f64>>,
    /// `BC3` (n_p × n_u), PPE boundary term.
    pub pressure_boundary: Option<DMatrix<f64>>,
}

impl NavierStokesOperators {
    pub fn velocity_dim(&self) -> usize {
        self.mass.nrows()
    }

    pub fn pressure_dim(&self) -> usize {
        self.gradient.ncols()
    }

    /// Checks every shape, and that the terms the chosen stabilization needs
    /// are present.
    pub fn validate(&self, stabilization: Stabilization) -> Result<()> {
        let (nu, np) = (self.velocity_dim(), self.pressure_dim());
        check("mass", &self.mass, nu, nu)?;
        check("diffusion", &self.diffusion, nu, nu)?;
        check("gradient", &self.gradient, nu, np)?;
        check_slices("convection", &self.convection, nu, nu)?;

        match stabilization {
            Stabilization::Supremizer => {
                let divergence = self.divergence.as_ref().ok_or_else(|| missing("divergence"))?;
                check("divergence", divergence, np, nu)
            }
            Stabilization::Ppe => {
                let laplacian = self
                    .pressure_laplacian
                    .as_ref()
                    .ok_or_else(|| missing("pressure_laplacian"))?;
                check("pressure_laplacian", laplacian, np, np)?;
                check_slices("pressure_convection", &self.pressure_convection, np, nu)?;
                if let Some(boundary) = &self.pressure_boundary {
                    check("pressure_boundary", boundary, np, nu)?;
                }
                Ok(())
            }
        }
    }

    /// Projects full-order operators onto the velocity and pressure spaces.
    ///
    /// `convection(u, v)` evaluates the full-order `(u · ∇)v`; its divergence
    /// is tested against the pressure modes when a pressure Laplacian is
    /// supplied (PPE).
    pub fn project<U, Q, F>(
        terms: &FullOrderTerms,
        velocity: &ProjectionSpace<U>,
        pressure: &ProjectionSpace<Q>,
        convection: F,
    ) -> Result<Self>
    where
        U: DenseColumn,
        Q: DenseColumn,
        F: Fn(&DVector<f64>, &DVector<f64>) -> DVector<f64> + Sync,
    {
        let mass = ReducedOperatorAssembler::project_matrix(&terms.mass, velocity, velocity)?;
        let diffusion = ReducedOperatorAssembler::project_matrix(&terms.diffusion, velocity, velocity)?;
        let gradient = ReducedOperatorAssembler::project_matrix(&terms.gradient, velocity, pressure)?;
        let convection_tensor = ReducedOperatorAssembler::project_bilinear(velocity, velocity, |u, v| Ok(convection(u, v)))?;

        let divergence = terms
            .divergence
            .as_ref()
            .map(|div| ReducedOperatorAssembler::project_matrix(div, pressure, velocity))
            .transpose()?;
        let pressure_laplacian = terms
            .pressure_laplacian
            .as_ref()
            .map(|lap| ReducedOperatorAssembler::project_matrix(lap, pressure, pressure))
            .transpose()?;
        let pressure_boundary = terms
            .pressure_boundary
            .as_ref()
            .map(|bc| ReducedOperatorAssembler::project_matrix(bc, pressure, velocity))
            .transpose()?;
        let pressure_convection = match (&terms.divergence_of_vector, &pressure_laplacian) {
            (Some(div), Some(_)) => {
                ReducedOperatorAssembler::project_bilinear(pressure, velocity, |u, v| div.mul_vec(&convection(u, v)))?
            }
            _ => Vec::new(),
        };

        Ok(Self {
            mass,
            diffusion,
            convection: convection_tensor,
            gradient,
            divergence,
            pressure_laplacian,
            pressure_convection,
            pressure_boundary,
        })
    }

    pub fn to_file(&self) -> OperatorFile {
        OperatorFile {
            mass: DenseRecord::from_matrix(&self.mass),
            diffusion: DenseRecord::from_matrix(&self.diffusion),
            convection: self.convection.iter().map(DenseRecord::from_matrix).collect(),
            gradient: DenseRecord::from_matrix(&self.gradient),
            divergence: self.divergence.as_ref().map(DenseRecord::from_matrix),
            pressure_laplacian: self.pressure_laplacian.as_ref().map(DenseRecord::from_matrix),
            pressure_convection: self
                .pressure_convection
                .iter()
                .map(DenseRecord::from_matrix)
                .collect(),
            pressure_boundary: self.pressure_boundary.as_ref().map(DenseRecord::from_matrix),
        }
    }
}

impl TryFrom<&OperatorFile> for NavierStokesOperators {
    type Error = RomError;

    fn try_from(file: &OperatorFile) -> Result<Self> {
        Ok(Self {
            mass: file.mass.to_matrix()?,
            diffusion: file.diffusion.to_matrix()?,
            convection: file
                .convection
                .iter()
                .map(DenseRecord::to_matrix)
                .collect::<Result<_>>()?,
            gradient: file.gradient.to_matrix()?,
            divergence: optional(&file.divergence)?,
            pressure_laplacian: optional(&file.pressure_laplacian)?,
            pressure_convection: file
                .pressure_convection
                .iter()
                .map(DenseRecord::to_matrix)
                .collect::<Result<_>>()?,
            pressure_boundary: optional(&file.pressure_boundary)?,
        })
    }
}

/// Full-order sparse operators handed to [`NavierStokesOperators::project`].
#[derive(Debug, Clone)]
pub struct FullOrderTerms {
    pub mass: SparseOperator,
    pub diffusion: SparseOperator,
    pub gradient: SparseOperator,
    pub divergence: Option<SparseOperator>,
    pub pressure_laplacian: Option<SparseOperator>,
    /// Divergence applied to a full velocity-shaped vector, used for the
    /// PPE convection term.
    pub divergence_of_vector: Option<SparseOperator>,
    pub pressure_boundary: Option<SparseOperator>,
}

fn missing(term: &str) -> RomError {
    RomError::DimensionMismatch(format!("reduced operator {term} is required by the selected stabilization"))
}

fn check(term: &str, matrix: &DMatrix<f64>, rows: usize, cols: usize) -> Result<()> {
    if matrix.shape() != (rows, cols) {
        return Err(RomError::DimensionMismatch(format!(
            "reduced operator {term} is {}x{}, expected {rows}x{cols}",
            matrix.nrows(),
            matrix.ncols()
        )));
    }
    Ok(())
}

fn check_slices(term: &str, slices: &[DMatrix<f64>], count: usize, order: usize) -> Result<()> {
    if slices.len() != count {
        return Err(RomError::DimensionMismatch(format!(
            "reduced tensor {term} has {} slices, expected {count}",
            slices.len()
        )));
    }
    slices
        .iter()
        .try_for_each(|slice| check(term, slice, order, order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::Basis;
    use crate::spectral::EnergyProfile;
    use std::sync::Arc;

    fn unit_space(len: usize, count: usize) -> ProjectionSpace<DVector<f64>> {
        let modes = (0..count)
            .map(|m| DVector::from_fn(len, |i, _| if i == m { 1.0 } else { 0.0 }))
            .collect();
        let basis = Basis::from_parts(
            "axes",
            0,
            modes,
            EnergyProfile::new(&vec![1.0; count], count as f64),
            vec![1.0; count],
        )
        .expect("basis");
        ProjectionSpace::new(Arc::new(basis))
    }

    fn supremizer_ops() -> NavierStokesOperators {
        NavierStokesOperators {
            mass: DMatrix::identity(2, 2),
            diffusion: DMatrix::identity(2, 2),
            convection: vec![DMatrix::zeros(2, 2); 2],
            gradient: DMatrix::zeros(2, 1),
            divergence: Some(DMatrix::zeros(1, 2)),
            pressure_laplacian: None,
            pressure_convection: Vec::new(),
            pressure_boundary: None,
        }
    }

    #[test]
    fn validate_requires_stabilization_terms() {
        let ops = supremizer_ops();
        ops.validate(Stabilization::Supremizer).expect("valid supremizer operators");
        assert!(matches!(
            ops.validate(Stabilization::Ppe),
            Err(RomError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn wrong_tensor_slice_count_is_rejected() {
        let mut ops = supremizer_ops();
        ops.convection.pop();
        assert!(ops.validate(Stabilization::Supremizer).is_err());
    }

    #[test]
    fn divergence_failure_surfaces_from_projection() {
        let velocity = unit_space(3, 2);
        let pressure = unit_space(3, 1);
        let identity = SparseOperator::from_dense(&DMatrix::identity(3, 3));
        let terms = FullOrderTerms {
            mass: identity.clone(),
            diffusion: identity.clone(),
            gradient: identity.clone(),
            divergence: None,
            pressure_laplacian: Some(identity),
            divergence_of_vector: Some(SparseOperator::zeros(3, 5)),
            pressure_boundary: None,
        };
        let err = NavierStokesOperators::project(&terms, &velocity, &pressure, |u, v| u.component_mul(v))
            .expect_err("divergence of the wrong width");
        assert!(err.to_string().contains("5 columns"), "{err}");
    }

    #[test]
    fn file_form_keeps_row_major_order() {
        let mut ops = supremizer_ops();
        ops.gradient = DMatrix::from_row_slice(2, 1, &[3.0, -4.0]);
        ops.diffusion = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let file = ops.to_file();
        assert_eq!(file.diffusion.data, vec![1.0, 2.0, 3.0, 4.0]);
        let json = serde_json::to_string(&file).expect("serialize");
        let parsed: OperatorFile = serde_json::from_str(&json).expect("parse");
        let back = NavierStokesOperators::try_from(&parsed).expect("convert");
        assert_eq!(back, ops);
    }
}
