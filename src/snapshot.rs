use std::sync::Arc;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RomError};

/// Smallest snapshot count that still yields a non-degenerate decomposition.
pub const MIN_SNAPSHOTS: usize = 3;
/// Trailing modes withheld from every decomposition.
pub const MODE_MARGIN: usize = 2;

/// `(rows, cols)`; dense vectors report a single column.
pub type Shape = (usize, usize);

/// Storage representation of a payload, independent of its in-memory type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadRecord {
    Dense {
        values: Vec<f64>,
    },
    Sparse {
        rows: usize,
        cols: usize,
        row_ptr: Vec<usize>,
        col_idx: Vec<usize>,
        values: Vec<f64>,
    },
}

/// Inner-product and reconstruct-from-weights strategy shared by every snapshot kind.
///
/// The decomposition pipeline only ever touches snapshots through this trait, so
/// weighted fields, plain vectors and sparse operators run through the same code.
pub trait SnapshotPayload: Clone + Send + Sync {
    fn shape(&self) -> Shape;

    /// Natural inner product of the field (mass-weighted L2, Euclidean, Frobenius).
    fn inner(&self, other: &Self) -> f64;

    fn scale(&mut self, factor: f64);

    /// `self += alpha * other`
    fn axpy(&mut self, alpha: f64, other: &Self);

    fn to_record(&self) -> PayloadRecord;

    /// Rebuilds a payload from storage; `template` supplies whatever the record
    /// does not carry (mesh weights, component count).
    fn from_record(record: PayloadRecord, template: &Self) -> std::result::Result<Self, String>;

    fn digest(&self, hasher: &mut blake3::Hasher);

    fn norm(&self) -> f64 {
        self.inner(self).max(0.0).sqrt()
    }

    /// `Σ coefficients[k] * items[k]`. `items` must not be empty.
    fn combine(coefficients: &[f64], items: &[&Self]) -> Self {
        debug_assert!(!items.is_empty() && coefficients.len() == items.len());
        let mut out = items[0].clone();
        out.scale(coefficients[0]);
        for (coefficient, item) in coefficients.iter().zip(items.iter()).skip(1) {
            out.axpy(*coefficient, item);
        }
        out
    }
}

/// Payloads that can be laid out as a single dense column.
pub trait DenseColumn: SnapshotPayload {
    fn column(&self) -> DVector<f64>;

    /// Column scaled so that the Euclidean product equals [`SnapshotPayload::inner`].
    fn weighted_column(&self) -> DVector<f64>;

    /// Payload with the same layout as `self` holding `values`.
    fn with_values(&self, values: DVector<f64>) -> Self;
}

impl SnapshotPayload for DVector<f64> {
    fn shape(&self) -> Shape {
        (self.len(), 1)
    }

    fn inner(&self, other: &Self) -> f64 {
        self.dot(other)
    }

    fn scale(&mut self, factor: f64) {
        *self *= factor;
    }

    fn axpy(&mut self, alpha: f64, other: &Self) {
        nalgebra::Matrix::axpy(self, alpha, other, 1.0);
    }

    fn to_record(&self) -> PayloadRecord {
        PayloadRecord::Dense {
            values: self.as_slice().to_vec(),
        }
    }

    fn from_record(record: PayloadRecord, template: &Self) -> std::result::Result<Self, String> {
        match record {
            PayloadRecord::Dense { values } if values.len() == template.len() => {
                Ok(DVector::from_vec(values))
            }
            PayloadRecord::Dense { values } => Err(format!(
                "dense record holds {} values, expected {}",
                values.len(),
                template.len()
            )),
            PayloadRecord::Sparse { .. } => Err("expected a dense record".to_string()),
        }
    }

    fn digest(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&self.len().to_le_bytes());
        for value in self.iter() {
            hasher.update(&value.to_le_bytes());
        }
    }
}

impl DenseColumn for DVector<f64> {
    fn column(&self) -> DVector<f64> {
        self.clone()
    }

    fn weighted_column(&self) -> DVector<f64> {
        self.clone()
    }

    fn with_values(&self, values: DVector<f64>) -> Self {
        values
    }
}

/// Discretised field sampled on mesh cells, `components` values per cell.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSnapshot {
    components: usize,
    values: DVector<f64>,
    weights: Arc<DVector<f64>>,
}

impl FieldSnapshot {
    pub fn new(values: DVector<f64>, components: usize, weights: Arc<DVector<f64>>) -> Result<Self> {
        if components == 0 || values.len() != weights.len() * components {
            return Err(RomError::DimensionMismatch(format!(
                "field with {} values does not fit {} cells of {} components",
                values.len(),
                weights.len(),
                components
            )));
        }
        Ok(Self {
            components,
            values,
            weights,
        })
    }

    /// Scalar field on cells of unit volume.
    pub fn uniform(values: DVector<f64>) -> Self {
        let weights = Arc::new(DVector::from_element(values.len(), 1.0));
        Self {
            components: 1,
            values,
            weights,
        }
    }

    pub fn components(&self) -> usize {
        self.components
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    pub fn weights(&self) -> &Arc<DVector<f64>> {
        &self.weights
    }

    pub fn cell_count(&self) -> usize {
        self.weights.len()
    }
}

impl SnapshotPayload for FieldSnapshot {
    fn shape(&self) -> Shape {
        (self.values.len(), 1)
    }

    fn inner(&self, other: &Self) -> f64 {
        let m = self.components;
        self.weights
            .iter()
            .enumerate()
            .map(|(cell, volume)| {
                let start = cell * m;
                let local: f64 = (start..start + m)
                    .map(|i| self.values[i] * other.values[i])
                    .sum();
                volume * local
            })
            .sum()
    }

    fn scale(&mut self, factor: f64) {
        self.values *= factor;
    }

    fn axpy(&mut self, alpha: f64, other: &Self) {
        self.values.axpy(alpha, &other.values, 1.0);
    }

    fn to_record(&self) -> PayloadRecord {
        PayloadRecord::Dense {
            values: self.values.as_slice().to_vec(),
        }
    }

    fn from_record(record: PayloadRecord, template: &Self) -> std::result::Result<Self, String> {
        let values = <DVector<f64> as SnapshotPayload>::from_record(record, &template.values)?;
        Ok(Self {
            components: template.components,
            values,
            weights: Arc::clone(&template.weights),
        })
    }

    fn digest(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&self.components.to_le_bytes());
        self.values.digest(hasher);
        self.weights.digest(hasher);
    }
}

impl DenseColumn for FieldSnapshot {
    fn column(&self) -> DVector<f64> {
        self.values.clone()
    }

    fn weighted_column(&self) -> DVector<f64> {
        let m = self.components;
        DVector::from_fn(self.values.len(), |i, _| {
            self.values[i] * self.weights[i / m].max(0.0).sqrt()
        })
    }

    fn with_values(&self, values: DVector<f64>) -> Self {
        Self {
            components: self.components,
            values,
            weights: Arc::clone(&self.weights),
        }
    }
}

/// One sample of a physical quantity, tagged with its time/parameter index.
#[derive(Debug, Clone)]
pub struct Snapshot<P> {
    pub index: usize,
    pub field: String,
    pub payload: P,
}

/// Ordered, shape-homogeneous snapshots of a single field.
#[derive(Debug, Clone)]
pub struct SnapshotSet<P> {
    field: String,
    snapshots: Vec<Snapshot<P>>,
}

impl<P: SnapshotPayload> SnapshotSet<P> {
    /// Tags `payloads` with consecutive indices.
    pub fn new(field: impl Into<String>, payloads: Vec<P>) -> Result<Self> {
        let field = field.into();
        let snapshots = payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| Snapshot {
                index,
                field: field.clone(),
                payload,
            })
            .collect();
        Self::from_snapshots(field, snapshots)
    }

    pub fn from_snapshots(field: impl Into<String>, snapshots: Vec<Snapshot<P>>) -> Result<Self> {
        let field = field.into();
        if snapshots.len() < MIN_SNAPSHOTS {
            return Err(RomError::TooFewSnapshots {
                field,
                minimum: MIN_SNAPSHOTS,
                found: snapshots.len(),
            });
        }

        let expected = snapshots[0].payload.shape();
        for (position, snapshot) in snapshots.iter().enumerate() {
            if snapshot.field != field {
                return Err(RomError::FieldMismatch {
                    index: position,
                    expected: field,
                    found: snapshot.field.clone(),
                });
            }
            let found = snapshot.payload.shape();
            if found != expected {
                return Err(RomError::ShapeMismatch {
                    field,
                    index: position,
                    expected,
                    found,
                });
            }
        }

        Ok(Self { field, snapshots })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn shape(&self) -> Shape {
        self.snapshots[0].payload.shape()
    }

    /// First payload; supplies layout (weights, components) when decoding stored modes.
    pub fn template(&self) -> &P {
        &self.snapshots[0].payload
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snapshot<P>> {
        self.snapshots.iter()
    }

    pub fn get(&self, position: usize) -> Option<&Snapshot<P>> {
        self.snapshots.get(position)
    }

    pub fn payloads(&self) -> Vec<&P> {
        self.snapshots.iter().map(|s| &s.payload).collect()
    }

    /// Largest mode count any decomposition of this set may return.
    pub fn max_modes(&self) -> usize {
        self.len().saturating_sub(MODE_MARGIN)
    }

    /// Maps a requested count onto a valid one; 0 selects the maximum.
    pub fn resolve_mode_count(&self, requested: usize) -> Result<usize> {
        check_mode_count(&self.field, requested, self.len())
    }

    /// Hex blake3 digest of the field name and every payload.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.field.as_bytes());
        hasher.update(&self.len().to_le_bytes());
        for snapshot in &self.snapshots {
            hasher.update(&snapshot.index.to_le_bytes());
            snapshot.payload.digest(&mut hasher);
        }
        hasher.finalize().to_hex().to_string()
    }
}

pub(crate) fn check_mode_count(term: &str, requested: usize, snapshots: usize) -> Result<usize> {
    let available = snapshots.saturating_sub(MODE_MARGIN);
    let resolved = if requested == 0 { available } else { requested };
    if resolved == 0 || resolved > available {
        return Err(RomError::InvalidModeCount {
            term: term.to_string(),
            requested,
            available,
            snapshots,
        });
    }
    Ok(resolved)
}
