use std::cmp::Ordering;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RomError};
use crate::snapshot::{PayloadRecord, Shape, SnapshotPayload};

/// Compressed sparse row matrix with sorted, duplicate-free column indices per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseOperator {
    rows: usize,
    cols: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl SparseOperator {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            row_ptr: vec![0; rows + 1],
            col_idx: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Builds from `(row, col, value)` triplets; duplicates are summed.
    pub fn from_triplets(rows: usize, cols: usize, triplets: &[(usize, usize, f64)]) -> Result<Self> {
        let mut per_row: Vec<Vec<(usize, f64)>> = vec![Vec::new(); rows];
        for &(row, col, value) in triplets {
            if row >= rows || col >= cols {
                return Err(RomError::DimensionMismatch(format!(
                    "entry ({row}, {col}) outside a {rows}x{cols} operator"
                )));
            }
            per_row[row].push((col, value));
        }
        Ok(Self::from_rows(rows, cols, per_row))
    }

    pub fn from_dense(matrix: &DMatrix<f64>) -> Self {
        let per_row = (0..matrix.nrows())
            .map(|i| {
                (0..matrix.ncols())
                    .filter(|&j| matrix[(i, j)] != 0.0)
                    .map(|j| (j, matrix[(i, j)]))
                    .collect()
            })
            .collect();
        Self::from_rows(matrix.nrows(), matrix.ncols(), per_row)
    }

    fn from_rows(rows: usize, cols: usize, per_row: Vec<Vec<(usize, f64)>>) -> Self {
        let mut row_ptr = Vec::with_capacity(rows + 1);
        let mut col_idx = Vec::new();
        let mut values = Vec::new();
        row_ptr.push(0);
        for mut entries in per_row {
            entries.sort_by_key(|(col, _)| *col);
            let mut iter = entries.into_iter();
            if let Some((mut current_col, mut current_sum)) = iter.next() {
                for (col, value) in iter {
                    if col == current_col {
                        current_sum += value;
                    } else {
                        col_idx.push(current_col);
                        values.push(current_sum);
                        current_col = col;
                        current_sum = value;
                    }
                }
                col_idx.push(current_col);
                values.push(current_sum);
            }
            row_ptr.push(col_idx.len());
        }
        Self {
            rows,
            cols,
            row_ptr,
            col_idx,
            values,
        }
    }

    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.cols
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn row(&self, row: usize) -> (&[usize], &[f64]) {
        let range = self.row_ptr[row]..self.row_ptr[row + 1];
        (&self.col_idx[range.clone()], &self.values[range])
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        if row >= self.rows {
            return 0.0;
        }
        let (cols, vals) = self.row(row);
        cols.binary_search(&col).map(|k| vals[k]).unwrap_or(0.0)
    }

    /// Iterates stored entries as `(row, col, value)`.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        (0..self.rows).flat_map(move |row| {
            let (cols, vals) = self.row(row);
            cols.iter().zip(vals.iter()).map(move |(&c, &v)| (row, c, v))
        })
    }

    pub fn mul_vec(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        if x.len() != self.cols {
            return Err(RomError::DimensionMismatch(format!(
                "operator with {} columns applied to vector of length {}",
                self.cols,
                x.len()
            )));
        }
        Ok(DVector::from_fn(self.rows, |i, _| {
            let (cols, vals) = self.row(i);
            cols.iter().zip(vals.iter()).map(|(&j, v)| v * x[j]).sum()
        }))
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.rows, self.cols);
        for (i, j, v) in self.entries() {
            dense[(i, j)] = v;
        }
        dense
    }

    pub fn frobenius_norm(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    fn merge_rows(&self, alpha: f64, other: &Self) -> Self {
        let mut row_ptr = Vec::with_capacity(self.rows + 1);
        let mut col_idx = Vec::with_capacity(self.nnz().max(other.nnz()));
        let mut values = Vec::with_capacity(self.nnz().max(other.nnz()));
        row_ptr.push(0);
        for row in 0..self.rows {
            let (a_cols, a_vals) = self.row(row);
            let (b_cols, b_vals) = other.row(row);
            let (mut p, mut q) = (0, 0);
            while p < a_cols.len() || q < b_cols.len() {
                let ordering = match (a_cols.get(p), b_cols.get(q)) {
                    (Some(a), Some(b)) => a.cmp(b),
                    (Some(_), None) => Ordering::Less,
                    _ => Ordering::Greater,
                };
                match ordering {
                    Ordering::Less => {
                        col_idx.push(a_cols[p]);
                        values.push(a_vals[p]);
                        p += 1;
                    }
                    Ordering::Greater => {
                        col_idx.push(b_cols[q]);
                        values.push(alpha * b_vals[q]);
                        q += 1;
                    }
                    Ordering::Equal => {
                        col_idx.push(a_cols[p]);
                        values.push(a_vals[p] + alpha * b_vals[q]);
                        p += 1;
                        q += 1;
                    }
                }
            }
            row_ptr.push(col_idx.len());
        }
        Self {
            rows: self.rows,
            cols: self.cols,
            row_ptr,
            col_idx,
            values,
        }
    }
}

impl SnapshotPayload for SparseOperator {
    fn shape(&self) -> Shape {
        (self.rows, self.cols)
    }

    /// Frobenius inner product over the intersection of both patterns.
    fn inner(&self, other: &Self) -> f64 {
        let mut sum = 0.0;
        for row in 0..self.rows.min(other.rows) {
            let (a_cols, a_vals) = self.row(row);
            let (b_cols, b_vals) = other.row(row);
            let (mut p, mut q) = (0, 0);
            while p < a_cols.len() && q < b_cols.len() {
                match a_cols[p].cmp(&b_cols[q]) {
                    Ordering::Less => p += 1,
                    Ordering::Greater => q += 1,
                    Ordering::Equal => {
                        sum += a_vals[p] * b_vals[q];
                        p += 1;
                        q += 1;
                    }
                }
            }
        }
        sum
    }

    fn scale(&mut self, factor: f64) {
        self.values.iter_mut().for_each(|v| *v *= factor);
    }

    fn axpy(&mut self, alpha: f64, other: &Self) {
        *self = self.merge_rows(alpha, other);
    }

    fn to_record(&self) -> PayloadRecord {
        PayloadRecord::Sparse {
            rows: self.rows,
            cols: self.cols,
            row_ptr: self.row_ptr.clone(),
            col_idx: self.col_idx.clone(),
            values: self.values.clone(),
        }
    }

    fn from_record(record: PayloadRecord, template: &Self) -> std::result::Result<Self, String> {
        let PayloadRecord::Sparse {
            rows,
            cols,
            row_ptr,
            col_idx,
            values,
        } = record
        else {
            return Err("expected a sparse record".to_string());
        };
        if (rows, cols) != template.shape() {
            return Err(format!(
                "sparse record is {rows}x{cols}, expected {}x{}",
                template.rows, template.cols
            ));
        }
        let consistent = row_ptr.len() == rows + 1
            && row_ptr.first() == Some(&0)
            && row_ptr.windows(2).all(|w| w[0] <= w[1])
            && row_ptr.last() == Some(&col_idx.len())
            && col_idx.len() == values.len()
            && col_idx.iter().all(|&c| c < cols);
        if !consistent {
            return Err("inconsistent CSR layout".to_string());
        }
        Ok(Self {
            rows,
            cols,
            row_ptr,
            col_idx,
            values,
        })
    }

    fn digest(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&self.rows.to_le_bytes());
        hasher.update(&self.cols.to_le_bytes());
        for (i, j, v) in self.entries() {
            hasher.update(&i.to_le_bytes());
            hasher.update(&j.to_le_bytes());
            hasher.update(&v.to_le_bytes());
        }
    }
}

/// One full-order sample of an affine operator term: `A(μ) x = b(μ)`.
#[derive(Debug, Clone)]
pub struct OperatorSnapshot {
    pub matrix: SparseOperator,
    pub source: DVector<f64>,
}

impl OperatorSnapshot {
    pub fn new(matrix: SparseOperator, source: DVector<f64>) -> Result<Self> {
        if matrix.nrows() != source.len() {
            return Err(RomError::DimensionMismatch(format!(
                "operator with {} rows paired with source of length {}",
                matrix.nrows(),
                source.len()
            )));
        }
        Ok(Self { matrix, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tridiagonal(n: usize, diag: f64) -> SparseOperator {
        let mut triplets = Vec::new();
        for i in 0..n {
            triplets.push((i, i, diag));
            if i + 1 < n {
                triplets.push((i, i + 1, -1.0));
                triplets.push((i + 1, i, -1.0));
            }
        }
        SparseOperator::from_triplets(n, n, &triplets).expect("tridiagonal")
    }

    #[test]
    fn triplets_sum_duplicates() {
        let op = SparseOperator::from_triplets(2, 2, &[(0, 1, 1.0), (0, 1, 2.5), (1, 0, 4.0)])
            .expect("operator");
        assert_eq!(op.nnz(), 2);
        assert_eq!(op.get(0, 1), 3.5);
        assert_eq!(op.get(1, 1), 0.0);
    }

    #[test]
    fn frobenius_matches_dense() {
        let a = tridiagonal(5, 2.0);
        let b = SparseOperator::from_triplets(5, 5, &[(0, 0, 1.0), (4, 3, 3.0), (2, 2, -1.0)])
            .expect("operator");
        let dense = a.to_dense().component_mul(&b.to_dense()).sum();
        assert!((a.inner(&b) - dense).abs() < 1e-14);
        assert!((a.norm() - a.to_dense().norm()).abs() < 1e-12);
    }

    #[test]
    fn axpy_merges_patterns() {
        let mut a = tridiagonal(4, 2.0);
        let b = SparseOperator::from_triplets(4, 4, &[(0, 3, 1.0), (1, 1, 1.0)]).expect("b");
        let expected = a.to_dense() + b.to_dense() * 2.0;
        a.axpy(2.0, &b);
        assert!((a.to_dense() - expected).norm() < 1e-14);
        assert_eq!(a.get(0, 3), 2.0);
    }

    #[test]
    fn record_round_trip_validates_layout() {
        let a = tridiagonal(3, 4.0);
        let restored = SparseOperator::from_record(a.to_record(), &a).expect("restore");
        assert_eq!(restored, a);

        let mut broken = a.to_record();
        if let PayloadRecord::Sparse { row_ptr, .. } = &mut broken {
            row_ptr.pop();
        }
        assert!(SparseOperator::from_record(broken, &a).is_err());
    }
}
