use std::collections::BTreeSet;

use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::cache::basis_cache::{corrupt, read_modes, write_modes, CACHE_VERSION, META};
use crate::cache::{ArtifactStore, BasisKey, CacheLookup};
use crate::deim::interpolation::{magic_points, DeimInterpolator};
use crate::error::{Result, RomError};
use crate::pod::{Basis, BasisBuilder};
use crate::snapshot::{check_mode_count, DenseColumn, SnapshotPayload, SnapshotSet, MIN_SNAPSHOTS};
use crate::sparse::{OperatorSnapshot, SparseOperator};
use crate::spectral::{Decomposer, EigenTarget, EnergyProfile, KrylovDecomposer};

const DEIM_ROOT: &str = "DEIM";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeimMeta {
    version: u32,
    key: BasisKey,
    raw_norms: Vec<Vec<f64>>,
}

/// File naming of one stored basis inside a DEIM directory.
struct Part {
    prefix: String,
    suffix: &'static str,
}

impl Part {
    fn entry(&self, base: &str) -> String {
        if self.suffix.is_empty() {
            base.to_string()
        } else {
            format!("{base}_{}", self.suffix)
        }
    }
}

/// DEIM bases of an affine operator `A(μ) x = b(μ)`: one for the matrix part,
/// one for the source part, each with its interpolation points.
#[derive(Debug, Clone)]
pub struct DeimArtifact {
    name: String,
    matrix_basis: Basis<SparseOperator>,
    source_basis: Basis<DVector<f64>>,
    matrix_points: Vec<(usize, usize)>,
    source_points: Vec<usize>,
}

impl DeimArtifact {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matrix_basis(&self) -> &Basis<SparseOperator> {
        &self.matrix_basis
    }

    pub fn source_basis(&self) -> &Basis<DVector<f64>> {
        &self.source_basis
    }

    /// Matrix entries `(row, col)` at which the operator is sampled online.
    pub fn matrix_points(&self) -> &[(usize, usize)] {
        &self.matrix_points
    }

    pub fn source_points(&self) -> &[usize] {
        &self.source_points
    }

    pub fn sample_matrix(&self, operator: &SparseOperator) -> DVector<f64> {
        DVector::from_iterator(
            self.matrix_points.len(),
            self.matrix_points.iter().map(|&(r, c)| operator.get(r, c)),
        )
    }

    pub fn sample_source(&self, source: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.source_points.len(),
            self.source_points.iter().map(|&i| source.get(i).copied().unwrap_or(0.0)),
        )
    }

    pub fn matrix_interpolator(&self) -> Result<DeimInterpolator> {
        let pattern = union_pattern(self.matrix_basis.modes());
        let columns = pattern_columns(self.matrix_basis.modes(), &pattern);
        let points = self
            .matrix_points
            .iter()
            .map(|entry| {
                pattern.binary_search(entry).map_err(|_| {
                    RomError::DimensionMismatch(format!(
                        "magic point {entry:?} of {} lies outside the mode pattern",
                        self.name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        DeimInterpolator::new(columns, points)
    }

    pub fn source_interpolator(&self) -> Result<DeimInterpolator> {
        DeimInterpolator::new(dense_columns(self.source_basis.modes()), self.source_points.clone())
    }

    /// `Σ c_i A_i` with `c` interpolated from the sampled entries.
    pub fn approximate_matrix(&self, samples: &DVector<f64>) -> Result<SparseOperator> {
        let coefficients = self.matrix_interpolator()?.coefficients(samples)?;
        self.matrix_basis.expand(coefficients.as_slice())
    }

    pub fn approximate_source(&self, samples: &DVector<f64>) -> Result<DVector<f64>> {
        self.source_interpolator()?.reconstruct(samples)
    }
}

/// DEIM basis of a dense nonlinear field term and its magic points.
#[derive(Debug, Clone)]
pub struct FieldDeim<P> {
    pub basis: Basis<P>,
    pub points: Vec<usize>,
}

impl<P: DenseColumn> FieldDeim<P> {
    pub fn interpolator(&self) -> Result<DeimInterpolator> {
        DeimInterpolator::new(dense_columns(self.basis.modes()), self.points.clone())
    }
}

pub struct DeimBuilder<S, D = KrylovDecomposer> {
    store: S,
    builder: BasisBuilder<D>,
}

impl<S: ArtifactStore, D: Decomposer> DeimBuilder<S, D> {
    pub fn new(store: S, builder: BasisBuilder<D>) -> Self {
        Self { store, builder }
    }

    pub fn builder(&self) -> &BasisBuilder<D> {
        &self.builder
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mode counts are validated before the store is consulted.
    pub fn compute_or_load_deim(
        &self,
        snapshots: &[OperatorSnapshot],
        n_a: usize,
        n_b: usize,
        name: &str,
    ) -> Result<DeimArtifact> {
        let count = snapshots.len();
        if count < MIN_SNAPSHOTS {
            return Err(RomError::TooFewSnapshots {
                field: name.to_string(),
                minimum: MIN_SNAPSHOTS,
                found: count,
            });
        }
        let matrix_term = format!("A_{name}");
        let source_term = format!("B_{name}");
        let (requested_a, requested_b) = (n_a, n_b);
        let n_a = check_mode_count(&matrix_term, n_a, count)?;
        let n_b = check_mode_count(&source_term, n_b, count)?;

        let matrices = SnapshotSet::new(
            matrix_term.as_str(),
            snapshots.iter().map(|s| s.matrix.clone()).collect(),
        )?;
        let sources = SnapshotSet::new(
            source_term.as_str(),
            snapshots.iter().map(|s| s.source.clone()).collect(),
        )?;

        let dir = format!("{DEIM_ROOT}/{name}");
        let key = BasisKey::new(name, vec![requested_a, requested_b], matrices.digest()).salted(&sources.digest());
        let parts = [
            Part { prefix: matrix_term.clone(), suffix: "A" },
            Part { prefix: source_term.clone(), suffix: "B" },
        ];
        if let CacheLookup::Hit(artifact) = self.lookup_operator(&dir, &key, &parts, &matrices, &sources)? {
            return Ok(artifact);
        }

        info!("computing DEIM modes for {name} ({n_a} matrix, {n_b} source)");
        let matrix_basis = self.builder.build(&matrices, requested_a)?;
        let source_basis = if n_b == 1 {
            self.builder.build_canonical(&sources)?
        } else {
            self.builder.build(&sources, requested_b)?
        };

        let pattern = union_pattern(matrix_basis.modes());
        let matrix_points = magic_points(&matrix_term, &pattern_columns(matrix_basis.modes(), &pattern))?
            .into_iter()
            .map(|index| pattern[index])
            .collect();
        let source_points = magic_points(&source_term, &dense_columns(source_basis.modes()))?;

        let artifact = DeimArtifact {
            name: name.to_string(),
            matrix_basis,
            source_basis,
            matrix_points,
            source_points,
        };

        info!("saving DEIM modes for {name} under {dir}");
        save_part(&self.store, &dir, &parts[0], &artifact.matrix_basis, &artifact.matrix_points)?;
        save_part(&self.store, &dir, &parts[1], &artifact.source_basis, &artifact.source_points)?;
        let meta = DeimMeta {
            version: CACHE_VERSION,
            key,
            raw_norms: vec![
                artifact.matrix_basis.raw_norms().to_vec(),
                artifact.source_basis.raw_norms().to_vec(),
            ],
        };
        self.store.save(&dir, META, &meta)?;
        Ok(artifact)
    }

    /// DEIM modes of a dense nonlinear field, ranked by the real part of the
    /// correlation spectrum.
    pub fn field_modes<P: DenseColumn>(
        &self,
        set: &SnapshotSet<P>,
        mode_count: usize,
        name: &str,
    ) -> Result<FieldDeim<P>> {
        set.resolve_mode_count(mode_count)?;
        let dir = format!("{DEIM_ROOT}/{name}");
        let key = BasisKey::new(name, vec![mode_count], set.digest()).salted(set.field());
        let part = Part {
            prefix: name.to_string(),
            suffix: "",
        };

        if let Some(meta) = self.matching_meta(&dir, &key)? {
            info!("loading DEIM modes for {name} from {dir}");
            let raw_norms = meta.raw_norms.into_iter().next().unwrap_or_default();
            let basis = load_part(&self.store, &dir, &part, raw_norms, set.template())?;
            let points: Vec<usize> = self.store.load(&dir, &part.entry("magic_points"))?;
            return Ok(FieldDeim { basis, points });
        }

        info!("computing DEIM modes for {name}");
        let basis = self
            .builder
            .build_with_target(set, mode_count, EigenTarget::LargestReal)?;
        let points = magic_points(name, &dense_columns(basis.modes()))?;
        save_part(&self.store, &dir, &part, &basis, &points)?;
        let meta = DeimMeta {
            version: CACHE_VERSION,
            key,
            raw_norms: vec![basis.raw_norms().to_vec()],
        };
        self.store.save(&dir, META, &meta)?;
        Ok(FieldDeim { basis, points })
    }

    fn matching_meta(&self, dir: &str, key: &BasisKey) -> Result<Option<DeimMeta>> {
        if !self.store.exists(dir, META) {
            return Ok(None);
        }
        let meta: DeimMeta = self.store.load(dir, META)?;
        if meta.version != CACHE_VERSION || meta.key != *key {
            warn!("stored DEIM artifact {dir} is stale, regenerating");
            return Ok(None);
        }
        Ok(Some(meta))
    }

    fn lookup_operator(
        &self,
        dir: &str,
        key: &BasisKey,
        parts: &[Part; 2],
        matrices: &SnapshotSet<SparseOperator>,
        sources: &SnapshotSet<DVector<f64>>,
    ) -> Result<CacheLookup<DeimArtifact>> {
        let Some(meta) = self.matching_meta(dir, key)? else {
            return Ok(CacheLookup::Miss);
        };
        let [matrix_norms, source_norms]: [Vec<f64>; 2] = meta
            .raw_norms
            .try_into()
            .map_err(|_| corrupt(dir, META, "expected raw norms for two bases"))?;

        info!("loading DEIM modes for {} from {dir}", key.term);
        let matrix_basis = load_part(
            &self.store,
            dir,
            &parts[0],
            matrix_norms,
            matrices.template(),
        )?;
        let source_basis = load_part(
            &self.store,
            dir,
            &parts[1],
            source_norms,
            sources.template(),
        )?;
        let matrix_points: Vec<(usize, usize)> = self.store.load(dir, &parts[0].entry("magic_points"))?;
        let source_points: Vec<usize> = self.store.load(dir, &parts[1].entry("magic_points"))?;
        if matrix_points.len() != matrix_basis.len() || source_points.len() != source_basis.len() {
            return Err(corrupt(dir, META, "magic point count differs from mode count").into());
        }

        Ok(CacheLookup::Hit(DeimArtifact {
            name: key.term.clone(),
            matrix_basis,
            source_basis,
            matrix_points,
            source_points,
        }))
    }
}

fn save_part<S: ArtifactStore, P: SnapshotPayload, T: Serialize>(
    store: &S,
    dir: &str,
    part: &Part,
    basis: &Basis<P>,
    points: &T,
) -> Result<()> {
    write_modes(store, dir, &part.prefix, basis.modes())?;
    store.save(dir, &part.entry("eigenvalues"), &basis.energy().eigenvalues.to_vec())?;
    store.save(
        dir,
        &part.entry("cumulative_eigenvalues"),
        &basis.energy().cumulative.to_vec(),
    )?;
    store.save(dir, &part.entry("magic_points"), points)?;
    Ok(())
}

fn load_part<S: ArtifactStore, P: SnapshotPayload>(
    store: &S,
    dir: &str,
    part: &Part,
    raw_norms: Vec<f64>,
    template: &P,
) -> Result<Basis<P>> {
    // One raw norm is stored per mode, so it also fixes the mode count.
    let modes = read_modes(store, dir, &part.prefix, raw_norms.len(), template)?;
    let eigenvalues: Vec<f64> = store.load(dir, &part.entry("eigenvalues"))?;
    let cumulative: Vec<f64> = store.load(dir, &part.entry("cumulative_eigenvalues"))?;
    if eigenvalues.len() != cumulative.len() {
        return Err(corrupt(dir, &part.entry("eigenvalues"), "eigenvalue files differ in length").into());
    }
    let energy = EnergyProfile::from_parts(eigenvalues, cumulative);
    Basis::from_parts(part.prefix.as_str(), 0, modes, energy, raw_norms)
        .map_err(|err| corrupt(dir, META, &err.to_string()).into())
}

/// Sorted union of the stored entries of every operator mode.
fn union_pattern(modes: &[SparseOperator]) -> Vec<(usize, usize)> {
    let pattern: BTreeSet<(usize, usize)> = modes
        .iter()
        .flat_map(|mode| mode.entries().map(|(r, c, _)| (r, c)))
        .collect();
    pattern.into_iter().collect()
}

fn pattern_columns(modes: &[SparseOperator], pattern: &[(usize, usize)]) -> DMatrix<f64> {
    DMatrix::from_fn(pattern.len(), modes.len(), |i, j| {
        let (r, c) = pattern[i];
        modes[j].get(r, c)
    })
}

fn dense_columns<P: DenseColumn>(modes: &[P]) -> DMatrix<f64> {
    let columns: Vec<DVector<f64>> = modes.iter().map(|m| m.column()).collect();
    DMatrix::from_columns(&columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryArtifactStore;
    use crate::spectral::{EigenPairs, EigenRequest};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        inner: KrylovDecomposer,
        targets: Mutex<Vec<EigenTarget>>,
    }

    impl Decomposer for Recording {
        fn decompose(&self, matrix: &DMatrix<f64>, request: EigenRequest) -> Result<EigenPairs> {
            self.targets.lock().push(request.target);
            self.inner.decompose(matrix, request)
        }
    }

    fn affine_snapshots(count: usize) -> Vec<OperatorSnapshot> {
        (0..count)
            .map(|k| {
                let mu = 0.5 + k as f64 * 0.25;
                let triplets: Vec<(usize, usize, f64)> = (0..4)
                    .flat_map(|i| {
                        let mut row = vec![(i, i, 2.0 + mu)];
                        if i + 1 < 4 {
                            row.push((i, i + 1, -mu * mu));
                            row.push((i + 1, i, -1.0));
                        }
                        row
                    })
                    .collect();
                let matrix = SparseOperator::from_triplets(4, 4, &triplets).expect("matrix");
                let source = DVector::from_fn(4, |i, _| 1.0 + mu * i as f64);
                OperatorSnapshot::new(matrix, source).expect("snapshot")
            })
            .collect()
    }

    #[test]
    fn single_source_mode_uses_the_canonical_pair() {
        let decomposer = Recording::default();
        let builder = DeimBuilder::new(
            MemoryArtifactStore::new(),
            BasisBuilder::with_decomposer(&decomposer),
        );
        let snapshots = affine_snapshots(6);
        let artifact = builder
            .compute_or_load_deim(&snapshots, 2, 1, "conduction")
            .expect("deim artifact");
        assert_eq!(
            *decomposer.targets.lock(),
            vec![EigenTarget::LargestAlgebraic, EigenTarget::Canonical]
        );
        assert_eq!(artifact.source_basis().len(), 1);
        assert_eq!(artifact.source_points().len(), 1);
        assert_eq!(artifact.matrix_points().len(), 2);
        let first = &snapshots[0].source;
        assert!((&artifact.source_basis().modes()[0] - first / first.norm()).norm() < 1e-12);
    }

    #[test]
    fn mode_counts_are_checked_before_the_store() {
        let store = MemoryArtifactStore::new();
        let builder = DeimBuilder::new(&store, BasisBuilder::default());
        let snapshots = affine_snapshots(5);
        builder
            .compute_or_load_deim(&snapshots, 2, 2, "conduction")
            .expect("first build");
        let result = builder.compute_or_load_deim(&snapshots, 4, 2, "conduction");
        assert!(matches!(result, Err(RomError::InvalidModeCount { requested: 4, .. })));
    }

    #[test]
    fn sampled_operator_is_recovered() {
        let builder = DeimBuilder::new(MemoryArtifactStore::new(), BasisBuilder::default());
        let snapshots = affine_snapshots(8);
        let artifact = builder
            .compute_or_load_deim(&snapshots, 3, 2, "conduction")
            .expect("deim");
        let target = &snapshots[3];
        let approx = artifact
            .approximate_matrix(&artifact.sample_matrix(&target.matrix))
            .expect("approximate matrix");
        assert!((approx.to_dense() - target.matrix.to_dense()).norm() < 1e-8);
        let source = artifact
            .approximate_source(&artifact.sample_source(&target.source))
            .expect("approximate source");
        assert!((source - &target.source).norm() < 1e-8);
    }

    #[test]
    fn field_modes_are_cached() {
        let store = MemoryArtifactStore::new();
        let builder = DeimBuilder::new(&store, BasisBuilder::default());
        let set = SnapshotSet::new(
            "nonlinear",
            (0..7)
                .map(|k| DVector::from_fn(15, |i, _| ((i as f64 + 1.0) * (0.3 + 0.1 * k as f64)).exp().ln_1p()))
                .collect(),
        )
        .expect("set");
        let first = builder.field_modes(&set, 3, "f").expect("field deim");
        assert_eq!(first.points.len(), 3);
        let second = builder.field_modes(&set, 3, "f").expect("cached field deim");
        assert_eq!(first.points, second.points);
        assert_eq!(first.basis.modes(), second.basis.modes());
        assert!(first.interpolator().is_ok());
    }
}
