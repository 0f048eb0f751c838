use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use nalgebra::{DMatrix, DVector};
use podrom::{
    Basis, BasisBuilder, Decomposer, DeimBuilder, EigenPairs, EigenRequest, EnergyProfile, FsArtifactStore,
    KrylovDecomposer, OperatorSnapshot, ProjectionSpace, ReducedOperatorAssembler, RomError, SnapshotPayload,
    SparseOperator,
};

fn temp_root(name: &str) -> PathBuf {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!("podrom_{}_{}", name, epoch));
    path
}

/// Forwards to the Krylov solver and counts the calls.
#[derive(Default)]
struct CountingDecomposer {
    inner: KrylovDecomposer,
    calls: AtomicUsize,
}

impl Decomposer for CountingDecomposer {
    fn decompose(&self, matrix: &DMatrix<f64>, request: EigenRequest) -> podrom::Result<EigenPairs> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.decompose(matrix, request)
    }
}

impl CountingDecomposer {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// `A(μ) = A0 + μ A1 + μ² A2` on a tridiagonal 5×5 pattern and
/// `b(μ) = b0 + μ b1 + μ² b2`.
fn affine_snapshots() -> Vec<OperatorSnapshot> {
    (0..10)
        .map(|k| {
            let mu = 0.2 + 0.3 * k as f64;
            let mut triplets = Vec::new();
            for i in 0..5 {
                triplets.push((i, i, 4.0 + mu));
                if i + 1 < 5 {
                    triplets.push((i, i + 1, -1.0 + mu * mu));
                    triplets.push((i + 1, i, -1.0 - 0.5 * mu));
                }
            }
            let matrix = SparseOperator::from_triplets(5, 5, &triplets).expect("operator");
            let source = DVector::from_fn(5, |i, _| 1.0 + mu * i as f64 - mu * mu * (i % 2) as f64);
            OperatorSnapshot::new(matrix, source).expect("operator snapshot")
        })
        .collect()
}

fn projection_error<P: SnapshotPayload>(basis: &Basis<P>, payload: &P) -> f64 {
    let coefficients = basis.project(payload);
    let mut rebuilt = basis.expand(coefficients.as_slice()).expect("expand");
    rebuilt.axpy(-1.0, payload);
    rebuilt.norm() / payload.norm()
}

#[test]
fn deim_bases_reconstruct_and_reload_without_decomposing() {
    let root = temp_root("deim_cache");
    let snapshots = affine_snapshots();

    let first = DeimBuilder::new(
        FsArtifactStore::new(&root),
        BasisBuilder::with_decomposer(CountingDecomposer::default()),
    );
    let artifact = first
        .compute_or_load_deim(&snapshots, 3, 3, "conduction")
        .expect("computed DEIM artifact");
    assert!(first.builder().decomposer().calls() > 0);
    assert_eq!(artifact.matrix_basis().len(), 3);
    assert_eq!(artifact.source_basis().len(), 3);
    assert!(root.join("DEIM").join("conduction").join("meta.json").is_file());

    for snapshot in &snapshots {
        assert!(projection_error(artifact.matrix_basis(), &snapshot.matrix) < 1e-8);
        assert!(projection_error(artifact.source_basis(), &snapshot.source) < 1e-8);

        let approximated = artifact
            .approximate_matrix(&artifact.sample_matrix(&snapshot.matrix))
            .expect("interpolated operator");
        let difference = approximated.to_dense() - snapshot.matrix.to_dense();
        assert!(difference.norm() < 1e-6 * snapshot.matrix.frobenius_norm());
        let source = artifact
            .approximate_source(&artifact.sample_source(&snapshot.source))
            .expect("interpolated source");
        assert!((source - &snapshot.source).norm() < 1e-6 * snapshot.source.norm());
    }

    let second = DeimBuilder::new(
        FsArtifactStore::new(&root),
        BasisBuilder::with_decomposer(CountingDecomposer::default()),
    );
    let reloaded = second
        .compute_or_load_deim(&snapshots, 3, 3, "conduction")
        .expect("cached DEIM artifact");
    assert_eq!(second.builder().decomposer().calls(), 0);
    assert_eq!(reloaded.matrix_points(), artifact.matrix_points());
    assert_eq!(reloaded.source_points(), artifact.source_points());
    assert_eq!(reloaded.source_basis().modes(), artifact.source_basis().modes());

    fs::remove_dir_all(&root).expect("cleanup");
}

#[test]
fn oversized_deim_request_fails_before_decomposing() {
    let root = temp_root("deim_precondition");
    let builder = DeimBuilder::new(
        FsArtifactStore::new(&root),
        BasisBuilder::with_decomposer(CountingDecomposer::default()),
    );
    let result = builder.compute_or_load_deim(&affine_snapshots(), 9, 3, "conduction");
    assert!(matches!(result, Err(RomError::InvalidModeCount { .. })));
    assert_eq!(builder.builder().decomposer().calls(), 0);
    assert!(!root.exists());
}

#[test]
fn projected_deim_matches_direct_projection() {
    let root = temp_root("deim_projection");
    let snapshots = affine_snapshots();
    let builder = DeimBuilder::new(FsArtifactStore::new(&root), BasisBuilder::default());
    let artifact = builder
        .compute_or_load_deim(&snapshots, 3, 3, "conduction")
        .expect("DEIM artifact");

    let modes = vec![
        DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0, 0.0]),
        DVector::from_vec(vec![0.0, 0.6, 0.8, 0.0, 0.0]),
    ];
    let basis = Basis::from_parts("T", 0, modes, EnergyProfile::new(&[1.0, 1.0], 2.0), vec![1.0, 1.0])
        .expect("basis");
    let space = ProjectionSpace::new(Arc::new(basis));
    let projected = ReducedOperatorAssembler::project_deim(&artifact, &space).expect("projected DEIM");
    assert_eq!(projected.matrices.len(), 3);

    let snapshot = &snapshots[4];
    let (matrix, source) = projected
        .evaluate(
            &artifact,
            &artifact.sample_matrix(&snapshot.matrix),
            &artifact.sample_source(&snapshot.source),
        )
        .expect("online evaluation");
    let direct = ReducedOperatorAssembler::project_matrix(&snapshot.matrix, &space, &space).expect("direct");
    let direct_source = ReducedOperatorAssembler::project_source(&snapshot.source, &space).expect("direct source");
    assert!((matrix - direct).norm() < 1e-8);
    assert!((source - direct_source).norm() < 1e-8);

    fs::remove_dir_all(&root).expect("cleanup");
}
