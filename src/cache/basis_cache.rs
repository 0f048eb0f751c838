use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::cache::store::ArtifactStore;
use crate::config::CachePolicy;
use crate::error::{Result, StoreError};
use crate::pod::{Basis, BasisBuilder};
use crate::snapshot::{DenseColumn, PayloadRecord, SnapshotPayload, SnapshotSet};
use crate::spectral::{Decomposer, EnergyProfile, KrylovDecomposer};

pub(crate) const CACHE_VERSION: u32 = 1;
pub(crate) const META: &str = "meta";
const EIGENVALUES: &str = "eigenvalues";
const CUMULATIVE: &str = "cumulative_eigenvalues";

/// Identity of a stored basis: term name, requested mode counts (0 stays 0,
/// since it may be cut to the numerical rank) and a content digest of
/// everything the basis was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasisKey {
    pub term: String,
    pub mode_counts: Vec<usize>,
    pub digest: String,
}

impl BasisKey {
    pub fn new(term: impl Into<String>, mode_counts: Vec<usize>, digest: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            mode_counts,
            digest: digest.into(),
        }
    }

    pub fn for_set<P: SnapshotPayload>(set: &SnapshotSet<P>, mode_count: usize) -> Self {
        Self::new(set.field(), vec![mode_count], set.digest())
    }

    /// Folds extra inputs (lift modes, decomposition method) into the digest.
    pub fn salted(mut self, salt: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.digest.as_bytes());
        hasher.update(salt.as_bytes());
        self.digest = hasher.finalize().to_hex().to_string();
        self
    }
}

#[derive(Debug, Clone)]
pub enum CacheLookup<T> {
    Miss,
    Hit(T),
}

impl<T> CacheLookup<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            CacheLookup::Hit(value) => Some(value),
            CacheLookup::Miss => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BasisMeta {
    version: u32,
    key: BasisKey,
    lift: usize,
    modes: usize,
    raw_norms: Vec<f64>,
}

/// Memoises POD bases on an [`ArtifactStore`]. Stale artifacts (different
/// digest, mode counts or format version) are a miss and get regenerated.
#[derive(Debug, Clone)]
pub struct BasisCache<S, D = KrylovDecomposer> {
    store: S,
    builder: BasisBuilder<D>,
}

impl<S: ArtifactStore, D: Decomposer> BasisCache<S, D> {
    pub fn new(store: S, builder: BasisBuilder<D>) -> Self {
        Self { store, builder }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn builder(&self) -> &BasisBuilder<D> {
        &self.builder
    }

    pub fn compute_or_load_basis<P: SnapshotPayload>(
        &self,
        set: &SnapshotSet<P>,
        mode_count: usize,
        policy: CachePolicy,
    ) -> Result<Basis<P>> {
        set.resolve_mode_count(mode_count)?;
        let key = BasisKey::for_set(set, mode_count);
        self.resolve(&key, set, policy, || self.builder.build(set, mode_count))
    }

    pub fn compute_or_load_lifted<P: SnapshotPayload>(
        &self,
        set: &SnapshotSet<P>,
        lift: &[P],
        mode_count: usize,
        policy: CachePolicy,
    ) -> Result<Basis<P>> {
        set.resolve_mode_count(mode_count)?;
        let key = BasisKey::for_set(set, mode_count).salted(&payload_digest(lift));
        self.resolve(&key, set, policy, || self.builder.build_lifted(set, lift, mode_count))
    }

    pub fn compute_or_load_svd<P: DenseColumn>(
        &self,
        set: &SnapshotSet<P>,
        mode_count: usize,
        policy: CachePolicy,
    ) -> Result<Basis<P>> {
        set.resolve_mode_count(mode_count)?;
        let key = BasisKey::for_set(set, mode_count).salted("svd");
        self.resolve(&key, set, policy, || self.builder.build_svd(set, mode_count))
    }

    fn resolve<P, F>(
        &self,
        key: &BasisKey,
        set: &SnapshotSet<P>,
        policy: CachePolicy,
        compute: F,
    ) -> Result<Basis<P>>
    where
        P: SnapshotPayload,
        F: FnOnce() -> Result<Basis<P>>,
    {
        if policy != CachePolicy::Recompute {
            match self.lookup(key, set.template())? {
                CacheLookup::Hit(basis) => return Ok(basis),
                CacheLookup::Miss if policy == CachePolicy::AlreadyComputed => {
                    return Err(StoreError::Missing {
                        dir: key.term.clone(),
                        name: META.to_string(),
                    }
                    .into());
                }
                CacheLookup::Miss => {}
            }
        }
        let basis = compute()?;
        self.save(key, &basis)?;
        Ok(basis)
    }

    /// A missing artifact is the expected `Miss`; a matching artifact whose
    /// parts cannot be read is a storage error.
    pub fn lookup<P: SnapshotPayload>(&self, key: &BasisKey, template: &P) -> Result<CacheLookup<Basis<P>>> {
        let dir = key.term.as_str();
        if !self.store.exists(dir, META) {
            return Ok(CacheLookup::Miss);
        }
        let meta: BasisMeta = self.store.load(dir, META)?;
        if meta.version != CACHE_VERSION || meta.key != *key {
            warn!(
                "stored basis for {} does not match the current snapshots, regenerating",
                key.term
            );
            return Ok(CacheLookup::Miss);
        }

        info!("loading POD bases for {} from {}", key.term, dir);
        let modes = read_modes(&self.store, dir, dir, meta.modes, template)?;
        let eigenvalues: Vec<f64> = self.store.load(dir, EIGENVALUES)?;
        let cumulative: Vec<f64> = self.store.load(dir, CUMULATIVE)?;
        if eigenvalues.len() != cumulative.len() {
            return Err(corrupt(dir, EIGENVALUES, "eigenvalue files differ in length").into());
        }
        let energy = EnergyProfile::from_parts(eigenvalues, cumulative);
        let basis = Basis::from_parts(dir, meta.lift, modes, energy, meta.raw_norms)
            .map_err(|err| corrupt(dir, META, &err.to_string()))?;
        Ok(CacheLookup::Hit(basis))
    }

    /// Writes modes and energies first and the metadata last, so an
    /// interrupted save never looks complete.
    pub fn save<P: SnapshotPayload>(&self, key: &BasisKey, basis: &Basis<P>) -> Result<()> {
        let dir = key.term.as_str();
        info!("saving POD bases for {} ({} modes)", key.term, basis.len());
        write_modes(&self.store, dir, dir, basis.modes())?;
        self.store
            .save(dir, EIGENVALUES, &basis.energy().eigenvalues.to_vec())?;
        self.store
            .save(dir, CUMULATIVE, &basis.energy().cumulative.to_vec())?;
        let meta = BasisMeta {
            version: CACHE_VERSION,
            key: key.clone(),
            lift: basis.lift_count(),
            modes: basis.len(),
            raw_norms: basis.raw_norms().to_vec(),
        };
        self.store.save(dir, META, &meta)?;
        Ok(())
    }
}

pub(crate) fn mode_name(prefix: &str, index: usize) -> String {
    format!("{prefix}_{index}")
}

pub(crate) fn write_modes<S: ArtifactStore, P: SnapshotPayload>(
    store: &S,
    dir: &str,
    prefix: &str,
    modes: &[P],
) -> Result<()> {
    for (index, mode) in modes.iter().enumerate() {
        store.save(dir, &mode_name(prefix, index), &mode.to_record())?;
    }
    Ok(())
}

pub(crate) fn read_modes<S: ArtifactStore, P: SnapshotPayload>(
    store: &S,
    dir: &str,
    prefix: &str,
    count: usize,
    template: &P,
) -> Result<Vec<P>> {
    (0..count)
        .map(|index| -> Result<P> {
            let name = mode_name(prefix, index);
            let record: PayloadRecord = store.load(dir, &name)?;
            P::from_record(record, template).map_err(|reason| corrupt(dir, &name, &reason).into())
        })
        .collect()
}

pub(crate) fn corrupt(dir: &str, name: &str, reason: &str) -> StoreError {
    StoreError::Corrupt {
        dir: dir.to_string(),
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

pub(crate) fn payload_digest<P: SnapshotPayload>(items: &[P]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&items.len().to_le_bytes());
    for item in items {
        item.digest(&mut hasher);
    }
    hasher.finalize().to_hex().to_string()
}
