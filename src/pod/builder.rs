use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};

use crate::config::SpectralConfig;
use crate::error::{Result, RomError};
use crate::pod::basis::{gram_schmidt, orthogonalize_against, Basis};
use crate::snapshot::{DenseColumn, SnapshotPayload, SnapshotSet};
use crate::spectral::{
    CorrelationBuilder, Decomposer, EigenPairs, EigenRequest, EigenTarget, EnergyProfile,
    KrylovDecomposer,
};

/// Modes whose raw norm falls below this fraction of the total snapshot
/// norm carry no usable direction.
const DEGENERATE_TOL: f64 = 1e-12;
/// Eigenvalues below this fraction of the leading one lie outside the
/// numerical rank when the mode count was left to the builder.
const RANK_TOL: f64 = 1e-12;

/// Method-of-snapshots POD: correlation matrix, leading eigenpairs, then
/// each mode as the eigenvector-weighted sum of the original snapshots.
#[derive(Debug, Clone)]
pub struct BasisBuilder<D = KrylovDecomposer> {
    decomposer: D,
    orthogonalize: bool,
}

impl BasisBuilder<KrylovDecomposer> {
    pub fn new(config: SpectralConfig) -> Self {
        Self::with_decomposer(KrylovDecomposer::new(config))
    }
}

impl Default for BasisBuilder<KrylovDecomposer> {
    fn default() -> Self {
        Self::new(SpectralConfig::default())
    }
}

impl<D: Decomposer> BasisBuilder<D> {
    pub fn with_decomposer(decomposer: D) -> Self {
        Self {
            decomposer,
            orthogonalize: true,
        }
    }

    /// Whether a Gram-Schmidt pass follows mode reconstruction.
    pub fn orthogonalize(mut self, enabled: bool) -> Self {
        self.orthogonalize = enabled;
        self
    }

    pub fn decomposer(&self) -> &D {
        &self.decomposer
    }

    /// A `mode_count` of 0 asks for as many modes as the snapshots support:
    /// at most `N - 2`, cut back to the numerical rank of the set. An explicit
    /// count beyond the rank fails with [`RomError::DegenerateMode`].
    pub fn build<P: SnapshotPayload>(&self, set: &SnapshotSet<P>, mode_count: usize) -> Result<Basis<P>> {
        self.build_with_target(set, mode_count, EigenTarget::LargestAlgebraic)
    }

    pub fn build_with_target<P: SnapshotPayload>(
        &self,
        set: &SnapshotSet<P>,
        mode_count: usize,
        target: EigenTarget,
    ) -> Result<Basis<P>> {
        let count = set.resolve_mode_count(mode_count)?;
        info!("performing the POD decomposition for {}", set.field());
        let items = set.payloads();
        let correlation = CorrelationBuilder::from_payloads(&items);
        let total = correlation.trace();
        let pairs = self
            .decomposer
            .decompose(&correlation, EigenRequest { count, target })?;
        self.build_from_pairs(set.field(), &items, &pairs, total, mode_count == 0)
    }

    /// Orthonormalises `lift`, removes its span from every snapshot, runs POD
    /// on the remainder and prepends the lift modes.
    pub fn build_lifted<P: SnapshotPayload>(
        &self,
        set: &SnapshotSet<P>,
        lift: &[P],
        mode_count: usize,
    ) -> Result<Basis<P>> {
        if lift.is_empty() {
            return self.build(set, mode_count);
        }
        if let Some((index, mode)) = lift.iter().enumerate().find(|(_, m)| m.shape() != set.shape()) {
            return Err(RomError::ShapeMismatch {
                field: set.field().to_string(),
                index,
                expected: set.shape(),
                found: mode.shape(),
            });
        }

        let mut lift_modes = lift.to_vec();
        let lift_norms = gram_schmidt(&mut lift_modes, set.field())?;
        let homogeneous: Vec<P> = set
            .iter()
            .map(|snapshot| {
                let mut payload = snapshot.payload.clone();
                orthogonalize_against(&mut payload, &lift_modes);
                payload
            })
            .collect();
        let homogeneous = SnapshotSet::new(set.field(), homogeneous)?;
        let pod = self.build(&homogeneous, mode_count)?;
        debug!(
            "{}: {} lift modes prepended to {} POD modes",
            set.field(),
            lift_modes.len(),
            pod.len()
        );

        let lift_count = lift_modes.len();
        let mut modes = lift_modes;
        modes.extend_from_slice(pod.modes());
        let mut raw_norms = lift_norms;
        raw_norms.extend_from_slice(pod.raw_norms());
        Basis::from_parts(set.field(), lift_count, modes, pod.energy().clone(), raw_norms)
    }

    /// Reconstructs, normalises and (optionally) re-orthogonalises one mode
    /// per pair. With `to_rank` set, trailing pairs outside the numerical rank
    /// are dropped instead of failing.
    fn build_from_pairs<P: SnapshotPayload>(
        &self,
        term: &str,
        items: &[&P],
        pairs: &EigenPairs,
        total: f64,
        to_rank: bool,
    ) -> Result<Basis<P>> {
        let scale = total.max(0.0).sqrt();
        let leading = pairs.values().iter().copied().fold(0.0, f64::max);
        let mut modes = Vec::with_capacity(pairs.len());
        let mut raw_norms = Vec::with_capacity(pairs.len());
        for index in 0..pairs.len() {
            let weights = pairs.vector(index);
            let mut mode = P::combine(weights.as_slice(), items);
            let raw = mode.norm();
            let degenerate = !raw.is_finite() || raw <= DEGENERATE_TOL * scale || raw == 0.0;
            if to_rank && index > 0 && (degenerate || pairs.value(index) <= RANK_TOL * leading) {
                warn!(
                    "{term}: snapshots have numerical rank {index}, keeping {index} of {} modes",
                    pairs.len()
                );
                break;
            }
            if degenerate {
                return Err(RomError::DegenerateMode {
                    term: term.to_string(),
                    index,
                    norm: raw,
                });
            }
            mode.scale(1.0 / raw);
            modes.push(mode);
            raw_norms.push(raw);
        }
        if self.orthogonalize {
            gram_schmidt(&mut modes, term)?;
        }

        let values: Vec<f64> = pairs.values().iter().take(modes.len()).copied().collect();
        let energy = EnergyProfile::new(&values, total);
        info!(
            "{}: {} modes capture {:.6} of the snapshot energy",
            term,
            modes.len(),
            energy.captured()
        );
        Basis::from_parts(term, 0, modes, energy, raw_norms)
    }

    /// Direct SVD of the weighted snapshot matrix. Spans the same space as
    /// [`BasisBuilder::build`], up to the sign of each mode.
    pub fn build_svd<P: DenseColumn>(&self, set: &SnapshotSet<P>, mode_count: usize) -> Result<Basis<P>> {
        let count = set.resolve_mode_count(mode_count)?;
        info!("performing the SVD decomposition for {}", set.field());
        let items = set.payloads();
        let columns: Vec<DVector<f64>> = items.iter().map(|p| p.weighted_column()).collect();
        let matrix = DMatrix::from_columns(&columns);
        let total = matrix.norm_squared();

        let svd = matrix.svd(false, true);
        let v_t = svd.v_t.as_ref().ok_or_else(|| {
            RomError::LinearSolveFailed(format!("SVD of the {} snapshot matrix", set.field()))
        })?;
        let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
        order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
        if order.len() < count {
            return Err(RomError::DimensionMismatch(format!(
                "{} singular values cannot provide {count} modes of {}",
                order.len(),
                set.field()
            )));
        }
        order.truncate(count);

        let values = DVector::from_iterator(count, order.iter().map(|&i| svd.singular_values[i].powi(2)));
        let vectors: Vec<DVector<f64>> = order.iter().map(|&i| v_t.row(i).transpose()).collect();
        let mut pairs = EigenPairs::new(values, DMatrix::from_columns(&vectors));
        pairs.normalize_signs();
        self.build_from_pairs(set.field(), &items, &pairs, total, mode_count == 0)
    }

    /// One mode of a term known to be constant up to scale, taken from the
    /// decomposer's canonical pair.
    pub fn build_canonical<P: SnapshotPayload>(&self, set: &SnapshotSet<P>) -> Result<Basis<P>> {
        let items = set.payloads();
        let correlation = CorrelationBuilder::from_payloads(&items);
        let total = correlation.trace();
        let pairs = self.decomposer.decompose(&correlation, EigenRequest::canonical())?;
        self.build_from_pairs(set.field(), &items, &pairs, total, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::FieldSnapshot;

    fn waves(count: usize, len: usize) -> SnapshotSet<DVector<f64>> {
        let payloads = (0..count)
            .map(|k| {
                DVector::from_fn(len, |i, _| {
                    let x = i as f64 / len as f64;
                    (std::f64::consts::PI * (k + 1) as f64 * x).sin() / (k + 1) as f64 + 0.1 * x * k as f64
                })
            })
            .collect();
        SnapshotSet::new("T", payloads).expect("snapshot set")
    }

    #[test]
    fn modes_are_orthonormal_and_ranked() {
        let set = waves(8, 40);
        let basis = BasisBuilder::default().build(&set, 0).expect("basis");
        assert_eq!(basis.len(), 6);
        let gram = basis.gram_matrix();
        assert!((gram - DMatrix::identity(6, 6)).norm() < 1e-10);
        let values = &basis.energy().eigenvalues;
        assert!(values.iter().zip(values.iter().skip(1)).all(|(a, b)| a >= b));
        assert!(basis.energy().captured() <= 1.0 + 1e-12);
    }

    #[test]
    fn svd_path_spans_the_same_space() {
        let weights = std::sync::Arc::new(DVector::from_fn(30, |i, _| 1.0 + (i % 3) as f64));
        let payloads = (0..7)
            .map(|k| {
                let values = DVector::from_fn(30, |i, _| ((i * (k + 2)) as f64 * 0.11).cos());
                FieldSnapshot::new(values, 1, std::sync::Arc::clone(&weights)).expect("field")
            })
            .collect();
        let set = SnapshotSet::new("p", payloads).expect("set");
        let builder = BasisBuilder::default();
        let eig = builder.build(&set, 3).expect("snapshots path");
        let svd = builder.build_svd(&set, 3).expect("svd path");

        for (a, b) in eig.energy().eigenvalues.iter().zip(svd.energy().eigenvalues.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
        for mode in svd.modes() {
            let projected = eig.expand(eig.project(mode).as_slice()).expect("expand");
            let mut difference = mode.clone();
            SnapshotPayload::axpy(&mut difference, -1.0, &projected);
            assert!(difference.norm() < 1e-6);
        }
    }

    #[test]
    fn lifted_basis_starts_with_lift_modes() {
        let set = waves(6, 20);
        let lift = vec![DVector::from_element(20, 2.0)];
        let basis = BasisBuilder::default()
            .build_lifted(&set, &lift, 2)
            .expect("lifted basis");
        assert_eq!(basis.lift_count(), 1);
        assert_eq!(basis.pod_count(), 2);
        assert!((basis.modes()[0].norm() - 1.0).abs() < 1e-12);
        assert!((basis.gram_matrix() - DMatrix::identity(3, 3)).norm() < 1e-10);
        assert!(basis.mode_energy(0).is_none());
        assert!(basis.mode_energy(1).is_some());
    }

    #[test]
    fn canonical_mode_is_the_normalised_first_snapshot() {
        let set = waves(5, 12);
        let basis = BasisBuilder::default().build_canonical(&set).expect("canonical basis");
        assert_eq!(basis.len(), 1);
        let first = &set.get(0).expect("first snapshot").payload;
        let expected = first / first.norm();
        assert!((&basis.modes()[0] - expected).norm() < 1e-12);
        assert!(basis.energy().captured() <= 1.0 + 1e-12);
    }

    #[test]
    fn oversized_mode_count_fails_before_decomposition() {
        let set = waves(5, 10);
        let result = BasisBuilder::default().build(&set, 4);
        assert!(matches!(result, Err(RomError::InvalidModeCount { available: 3, .. })));
    }
}
