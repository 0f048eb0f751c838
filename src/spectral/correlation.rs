use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::snapshot::{SnapshotPayload, SnapshotSet};

/// Builds the N×N matrix of pairwise snapshot inner products.
#[derive(Debug, Default)]
pub struct CorrelationBuilder;

impl CorrelationBuilder {
    pub fn from_set<P: SnapshotPayload>(set: &SnapshotSet<P>) -> DMatrix<f64> {
        Self::from_payloads(&set.payloads())
    }

    /// Only the upper triangle is evaluated; the lower one is mirrored so the
    /// result is exactly symmetric.
    pub fn from_payloads<P: SnapshotPayload>(items: &[&P]) -> DMatrix<f64> {
        let n = items.len();
        let rows: Vec<Vec<f64>> = (0..n)
            .into_par_iter()
            .map(|i| (i..n).map(|j| items[i].inner(items[j])).collect())
            .collect();

        let mut matrix = DMatrix::zeros(n, n);
        for (i, row) in rows.into_iter().enumerate() {
            for (offset, value) in row.into_iter().enumerate() {
                let j = i + offset;
                matrix[(i, j)] = value;
                matrix[(j, i)] = value;
            }
        }
        matrix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::SparseOperator;
    use nalgebra::DVector;

    #[test]
    fn exactly_symmetric_gram_matrix() {
        let set = SnapshotSet::new(
            "T",
            (0..5)
                .map(|k| DVector::from_fn(7, |i, _| ((i + 1) as f64 * 0.37 * (k + 1) as f64).sin()))
                .collect(),
        )
        .expect("snapshot set");
        let matrix = CorrelationBuilder::from_set(&set);
        assert_eq!(matrix.nrows(), 5);
        assert_eq!(matrix, matrix.transpose());

        let first = set.get(0).expect("first").payload.clone();
        let third = set.get(2).expect("third").payload.clone();
        assert!((matrix[(0, 2)] - first.dot(&third)).abs() < 1e-14);
    }

    #[test]
    fn operators_use_frobenius_product() {
        let ops: Vec<SparseOperator> = (0..3)
            .map(|k| {
                SparseOperator::from_triplets(2, 2, &[(0, 0, 1.0 + k as f64), (1, 0, 2.0)])
                    .expect("operator")
            })
            .collect();
        let refs: Vec<&SparseOperator> = ops.iter().collect();
        let matrix = CorrelationBuilder::from_payloads(&refs);
        assert!((matrix[(1, 2)] - (2.0 * 3.0 + 4.0)).abs() < 1e-14);
    }
}
