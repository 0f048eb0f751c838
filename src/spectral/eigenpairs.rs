use nalgebra::{DMatrix, DVector};
use ndarray::Array1;

/// Ranked eigenpairs; `vectors` holds one unit eigenvector per column.
#[derive(Debug, Clone)]
pub struct EigenPairs {
    values: DVector<f64>,
    vectors: DMatrix<f64>,
}

impl EigenPairs {
    pub fn new(values: DVector<f64>, vectors: DMatrix<f64>) -> Self {
        debug_assert_eq!(values.len(), vectors.ncols());
        Self { values, vectors }
    }

    /// Single pair `(λ, e_0)` used when one mode of a trivially constant term
    /// is requested. `λ = |C e_0|² / C_00` is the top eigenvalue whenever every
    /// snapshot is parallel to the first one.
    pub fn canonical_unit(matrix: &DMatrix<f64>) -> Self {
        let order = matrix.nrows();
        let mut vectors = DMatrix::zeros(order, 1);
        let mut value = 0.0;
        if order > 0 {
            vectors[(0, 0)] = 1.0;
            let diagonal = matrix[(0, 0)];
            if diagonal > 0.0 {
                value = matrix.column(0).norm_squared() / diagonal;
            }
        }
        Self {
            values: DVector::from_element(1, value),
            vectors,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn order(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    pub fn vectors(&self) -> &DMatrix<f64> {
        &self.vectors
    }

    pub fn value(&self, index: usize) -> f64 {
        self.values[index]
    }

    pub fn vector(&self, index: usize) -> DVector<f64> {
        self.vectors.column(index).into_owned()
    }

    /// Flips every vector so its largest-magnitude component is positive.
    pub fn normalize_signs(&mut self) {
        for mut column in self.vectors.column_iter_mut() {
            if let Some(pivot) = column.iter().copied().max_by(|a, b| a.abs().total_cmp(&b.abs())) {
                if pivot < 0.0 {
                    column.neg_mut();
                }
            }
        }
    }
}

/// Captured-energy metadata: each eigenvalue as a fraction of the total
/// snapshot energy, and the running sum of those fractions.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyProfile {
    pub eigenvalues: Array1<f64>,
    pub cumulative: Array1<f64>,
}

impl EnergyProfile {
    pub fn new(eigenvalues: &[f64], total: f64) -> Self {
        let fractions: Array1<f64> = if total > 0.0 {
            eigenvalues.iter().map(|v| v.max(0.0) / total).collect()
        } else {
            Array1::zeros(eigenvalues.len())
        };
        let mut running = 0.0;
        let cumulative = fractions
            .iter()
            .map(|fraction| {
                running += fraction;
                running
            })
            .collect();
        Self {
            eigenvalues: fractions,
            cumulative,
        }
    }

    pub fn from_parts(eigenvalues: Vec<f64>, cumulative: Vec<f64>) -> Self {
        Self {
            eigenvalues: Array1::from(eigenvalues),
            cumulative: Array1::from(cumulative),
        }
    }

    pub fn len(&self) -> usize {
        self.eigenvalues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eigenvalues.is_empty()
    }

    /// Fraction of the total energy captured by all retained modes.
    pub fn captured(&self) -> f64 {
        self.cumulative.iter().last().copied().unwrap_or(0.0)
    }

    pub fn truncated(&self, count: usize) -> Self {
        let count = count.min(self.len());
        Self {
            eigenvalues: self.eigenvalues.slice(ndarray::s![..count]).to_owned(),
            cumulative: self.cumulative.slice(ndarray::s![..count]).to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_energy_is_monotone_and_bounded() {
        let profile = EnergyProfile::new(&[6.0, 3.0, 1.0, -1e-15], 10.0);
        assert_eq!(profile.eigenvalues[3], 0.0);
        let cumulative = &profile.cumulative;
        assert!(cumulative.iter().zip(cumulative.iter().skip(1)).all(|(a, b)| b >= a));
        assert!((profile.captured() - 1.0).abs() < 1e-14);
        assert_eq!(profile.truncated(2).cumulative.len(), 2);
    }

    #[test]
    fn sign_normalization_flips_negative_pivots() {
        let mut pairs = EigenPairs::new(
            DVector::from_vec(vec![2.0, 1.0]),
            DMatrix::from_column_slice(2, 2, &[0.6, -0.8, 0.8, 0.6]),
        );
        pairs.normalize_signs();
        assert_eq!(pairs.vector(0), DVector::from_vec(vec![-0.6, 0.8]));
        assert_eq!(pairs.vector(1), DVector::from_vec(vec![0.8, 0.6]));
    }

    #[test]
    fn canonical_pair_selects_first_snapshot() {
        let u = DVector::from_vec(vec![2.0, -1.0, 0.5, 3.0]);
        let pairs = EigenPairs::canonical_unit(&(&u * u.transpose()));
        assert_eq!(pairs.len(), 1);
        assert!((pairs.value(0) - u.norm_squared()).abs() < 1e-12);
        assert_eq!(pairs.vector(0), DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0]));
    }
}
