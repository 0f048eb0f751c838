use nalgebra::{DMatrix, DVector};

use crate::error::{Result, RomError};
use crate::snapshot::{Shape, SnapshotPayload};
use crate::spectral::EnergyProfile;

/// A direction counts as linearly dependent once orthogonalisation removes
/// all but this fraction of its norm.
const DEPENDENCE_TOL: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalization {
    /// Every mode has unit norm.
    Unit,
    /// Modes are rescaled against the raw norms of another field's basis.
    Companion { term: String },
}

/// Ordered modes of one field: lift modes first, then POD modes carrying
/// energy metadata, then any appended (supremizer) modes.
#[derive(Debug, Clone)]
pub struct Basis<P> {
    term: String,
    lift: usize,
    modes: Vec<P>,
    energy: EnergyProfile,
    raw_norms: Vec<f64>,
    normalization: Normalization,
}

impl<P: SnapshotPayload> Basis<P> {
    pub fn from_parts(
        term: impl Into<String>,
        lift: usize,
        modes: Vec<P>,
        energy: EnergyProfile,
        raw_norms: Vec<f64>,
    ) -> Result<Self> {
        let term = term.into();
        if modes.is_empty() {
            return Err(RomError::DimensionMismatch(format!("basis {term} has no modes")));
        }
        if lift + energy.len() > modes.len() || raw_norms.len() != modes.len() {
            return Err(RomError::DimensionMismatch(format!(
                "basis {term}: {} modes cannot hold {lift} lift modes, {} POD modes and {} norms",
                modes.len(),
                energy.len(),
                raw_norms.len()
            )));
        }
        let expected = modes[0].shape();
        if let Some((index, mode)) = modes.iter().enumerate().find(|(_, m)| m.shape() != expected) {
            return Err(RomError::ShapeMismatch {
                field: term,
                index,
                expected,
                found: mode.shape(),
            });
        }
        Ok(Self {
            term,
            lift,
            modes,
            energy,
            raw_norms,
            normalization: Normalization::Unit,
        })
    }

    pub fn term(&self) -> &str {
        &self.term
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn shape(&self) -> Shape {
        self.modes[0].shape()
    }

    pub fn lift_count(&self) -> usize {
        self.lift
    }

    pub fn pod_count(&self) -> usize {
        self.energy.len()
    }

    /// Modes appended after the POD modes.
    pub fn extra_count(&self) -> usize {
        self.modes.len() - self.lift - self.energy.len()
    }

    pub fn modes(&self) -> &[P] {
        &self.modes
    }

    pub fn mode(&self, index: usize) -> Option<&P> {
        self.modes.get(index)
    }

    pub fn pod_modes(&self) -> &[P] {
        &self.modes[self.lift..self.lift + self.energy.len()]
    }

    pub fn energy(&self) -> &EnergyProfile {
        &self.energy
    }

    /// `(eigenvalue fraction, cumulative fraction)` of a POD mode.
    pub fn mode_energy(&self, index: usize) -> Option<(f64, f64)> {
        let pod = index.checked_sub(self.lift)?;
        if pod >= self.energy.len() {
            return None;
        }
        Some((self.energy.eigenvalues[pod], self.energy.cumulative[pod]))
    }

    /// Norm of every mode before it was normalised.
    pub fn raw_norms(&self) -> &[f64] {
        &self.raw_norms
    }

    pub fn normalization(&self) -> &Normalization {
        &self.normalization
    }

    pub fn gram_matrix(&self) -> DMatrix<f64> {
        let n = self.modes.len();
        let mut gram = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in i..n {
                let value = self.modes[i].inner(&self.modes[j]);
                gram[(i, j)] = value;
                gram[(j, i)] = value;
            }
        }
        gram
    }

    /// Coefficients of `payload` on every mode, so that [`Basis::expand`]
    /// returns its orthogonal projection. Modes are mutually orthogonal, so
    /// the Gram matrix is diagonal; after companion normalization its
    /// entries are no longer one.
    pub fn project(&self, payload: &P) -> DVector<f64> {
        let unit = self.normalization == Normalization::Unit;
        DVector::from_iterator(
            self.modes.len(),
            self.modes.iter().map(|m| {
                let coefficient = m.inner(payload);
                let scale = if unit { 1.0 } else { m.inner(m) };
                if scale > 0.0 { coefficient / scale } else { coefficient }
            }),
        )
    }

    /// `Σ coefficients[m] * mode[m]` over the leading `coefficients.len()` modes.
    pub fn expand(&self, coefficients: &[f64]) -> Result<P> {
        if coefficients.is_empty() || coefficients.len() > self.modes.len() {
            return Err(RomError::DimensionMismatch(format!(
                "{} coefficients for basis {} with {} modes",
                coefficients.len(),
                self.term,
                self.modes.len()
            )));
        }
        let modes: Vec<&P> = self.modes.iter().take(coefficients.len()).collect();
        Ok(P::combine(coefficients, &modes))
    }

    /// Keeps the lift modes and the leading `count` POD modes.
    pub fn truncate(&self, count: usize) -> Result<Self> {
        if count == 0 || count > self.energy.len() {
            return Err(RomError::DimensionMismatch(format!(
                "cannot keep {count} of the {} POD modes of {}",
                self.energy.len(),
                self.term
            )));
        }
        let keep = self.lift + count;
        Ok(Self {
            term: self.term.clone(),
            lift: self.lift,
            modes: self.modes[..keep].to_vec(),
            energy: self.energy.truncated(count),
            raw_norms: self.raw_norms[..keep].to_vec(),
            normalization: self.normalization.clone(),
        })
    }

    /// Appends `extra` modes, each orthonormalised against the whole basis.
    pub fn augment(&self, extra: &[P]) -> Result<Self> {
        let expected = self.shape();
        let mut modes = self.modes.clone();
        let mut raw_norms = self.raw_norms.clone();
        for (offset, candidate) in extra.iter().enumerate() {
            let index = modes.len();
            if candidate.shape() != expected {
                return Err(RomError::ShapeMismatch {
                    field: self.term.clone(),
                    index,
                    expected,
                    found: candidate.shape(),
                });
            }
            let mut mode = candidate.clone();
            let raw = mode.norm();
            let residual = orthogonalize_against(&mut mode, &modes);
            if raw == 0.0 || residual <= DEPENDENCE_TOL * raw {
                return Err(RomError::DegenerateMode {
                    term: self.term.clone(),
                    index: self.lift + self.energy.len() + offset,
                    norm: residual,
                });
            }
            mode.scale(1.0 / residual);
            modes.push(mode);
            raw_norms.push(raw);
        }
        Ok(Self {
            term: self.term.clone(),
            lift: self.lift,
            modes,
            energy: self.energy.clone(),
            raw_norms,
            normalization: self.normalization.clone(),
        })
    }

    /// Rescales each POD mode by the ratio of its raw norm to the raw norm of
    /// the matching POD mode of `companion`.
    pub fn normalize_against<Q: SnapshotPayload>(&self, companion: &Basis<Q>) -> Result<Self> {
        if companion.pod_count() < self.pod_count() {
            return Err(RomError::DimensionMismatch(format!(
                "companion {} has {} POD modes, {} needs {}",
                companion.term,
                companion.pod_count(),
                self.term,
                self.pod_count()
            )));
        }
        let mut modes = self.modes.clone();
        for pod in 0..self.pod_count() {
            let index = self.lift + pod;
            let reference = companion.raw_norms[companion.lift + pod];
            if reference <= 0.0 {
                return Err(RomError::DegenerateMode {
                    term: companion.term.clone(),
                    index: companion.lift + pod,
                    norm: reference,
                });
            }
            modes[index].scale(self.raw_norms[index] / reference);
        }
        Ok(Self {
            term: self.term.clone(),
            lift: self.lift,
            modes,
            energy: self.energy.clone(),
            raw_norms: self.raw_norms.clone(),
            normalization: Normalization::Companion {
                term: companion.term.clone(),
            },
        })
    }
}

/// Removes the components of `vector` along the (orthonormal) `basis`, twice
/// for stability, and returns the remaining norm.
pub(crate) fn orthogonalize_against<P: SnapshotPayload>(vector: &mut P, basis: &[P]) -> f64 {
    for _ in 0..2 {
        for mode in basis {
            let coefficient = mode.inner(vector);
            vector.axpy(-coefficient, mode);
        }
    }
    vector.norm()
}

/// Modified Gram-Schmidt under the payload inner product. Returns the norm of
/// every vector before it was normalised.
pub fn gram_schmidt<P: SnapshotPayload>(vectors: &mut [P], term: &str) -> Result<Vec<f64>> {
    let mut norms = Vec::with_capacity(vectors.len());
    for index in 0..vectors.len() {
        let (done, rest) = vectors.split_at_mut(index);
        let current = &mut rest[0];
        let raw = current.norm();
        let residual = orthogonalize_against(current, done);
        if raw == 0.0 || !residual.is_finite() || residual <= DEPENDENCE_TOL * raw {
            return Err(RomError::DegenerateMode {
                term: term.to_string(),
                index,
                norm: residual,
            });
        }
        current.scale(1.0 / residual);
        norms.push(residual);
    }
    Ok(norms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_basis() -> Basis<DVector<f64>> {
        let modes = vec![
            DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0]),
            DVector::from_vec(vec![0.0, 1.0, 0.0, 0.0]),
        ];
        Basis::from_parts("U", 0, modes, EnergyProfile::new(&[3.0, 1.0], 4.0), vec![3.0, 1.5])
            .expect("basis")
    }

    #[test]
    fn gram_schmidt_orthonormalises() {
        let mut vectors = vec![
            DVector::from_vec(vec![2.0, 1.0, 0.0]),
            DVector::from_vec(vec![1.0, 1.0, 1.0]),
            DVector::from_vec(vec![0.0, 3.0, 1.0]),
        ];
        gram_schmidt(&mut vectors, "T").expect("independent vectors");
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((vectors[i].dot(&vectors[j]) - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn gram_schmidt_flags_dependent_vectors() {
        let mut vectors = vec![
            DVector::from_vec(vec![1.0, 2.0]),
            DVector::from_vec(vec![2.0, 4.0]),
        ];
        let result = gram_schmidt(&mut vectors, "T");
        assert!(matches!(result, Err(RomError::DegenerateMode { index: 1, .. })));
    }

    #[test]
    fn augment_appends_orthonormal_modes() {
        let basis = unit_basis();
        let augmented = basis
            .augment(&[DVector::from_vec(vec![1.0, 1.0, 2.0, 0.0])])
            .expect("augment");
        assert_eq!(augmented.len(), 3);
        assert_eq!(augmented.extra_count(), 1);
        assert_eq!(augmented.mode(2), Some(&DVector::from_vec(vec![0.0, 0.0, 1.0, 0.0])));
        assert!(augmented.mode_energy(2).is_none());
    }

    #[test]
    fn project_then_expand() {
        let basis = unit_basis();
        let target = DVector::from_vec(vec![2.0, -1.0, 0.0, 0.0]);
        let coefficients = basis.project(&target);
        let rebuilt = basis.expand(coefficients.as_slice()).expect("expand");
        assert!((rebuilt - target).norm() < 1e-14);
        assert!(basis.expand(&[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn truncate_and_companion_normalization() {
        let basis = unit_basis();
        let single = basis.truncate(1).expect("truncate");
        assert_eq!(single.len(), 1);
        assert_eq!(single.energy().len(), 1);

        let companion = Basis::from_parts(
            "p",
            0,
            vec![
                DVector::from_vec(vec![1.0, 0.0]),
                DVector::from_vec(vec![0.0, 1.0]),
            ],
            EnergyProfile::new(&[1.0, 1.0], 2.0),
            vec![1.5, 3.0],
        )
        .expect("companion");
        let scaled = basis.normalize_against(&companion).expect("normalize");
        assert_eq!(
            scaled.normalization(),
            &Normalization::Companion { term: "p".into() }
        );
        assert!((scaled.modes()[0].norm() - 2.0).abs() < 1e-14);
        assert!((scaled.modes()[1].norm() - 0.5).abs() < 1e-14);
    }

    #[test]
    fn projection_survives_companion_normalization() {
        let companion = Basis::from_parts(
            "p",
            0,
            vec![DVector::from_vec(vec![1.0, 0.0]), DVector::from_vec(vec![0.0, 1.0])],
            EnergyProfile::new(&[1.0, 1.0], 2.0),
            vec![1.5, 3.0],
        )
        .expect("companion");
        let scaled = unit_basis().normalize_against(&companion).expect("normalize");
        let target = DVector::from_vec(vec![2.0, -1.0, 0.0, 0.0]);
        let coefficients = scaled.project(&target);
        assert!((coefficients[0] - 1.0).abs() < 1e-14);
        assert!((coefficients[1] + 2.0).abs() < 1e-14);
        let rebuilt = scaled.expand(coefficients.as_slice()).expect("expand");
        assert!((rebuilt - target).norm() < 1e-14);
    }
}
