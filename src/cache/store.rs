use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;

const EXTENSION: &str = "json";

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable key/value storage for artifacts, addressed by a directory (the
/// term name) and an entry name inside it.
pub trait ArtifactStore: Send + Sync {
    fn exists(&self, dir: &str, name: &str) -> bool;

    fn save_value(&self, dir: &str, name: &str, value: Value) -> StoreResult<()>;

    fn load_value(&self, dir: &str, name: &str) -> StoreResult<Value>;

    fn save<T: Serialize>(&self, dir: &str, name: &str, value: &T) -> StoreResult<()>
    where
        Self: Sized,
    {
        let value = serde_json::to_value(value).map_err(|source| StoreError::Format {
            path: entry_path(dir, name),
            source,
        })?;
        self.save_value(dir, name, value)
    }

    fn load<T: DeserializeOwned>(&self, dir: &str, name: &str) -> StoreResult<T>
    where
        Self: Sized,
    {
        let value = self.load_value(dir, name)?;
        serde_json::from_value(value).map_err(|source| StoreError::Format {
            path: entry_path(dir, name),
            source,
        })
    }
}

impl<S: ArtifactStore + ?Sized> ArtifactStore for &S {
    fn exists(&self, dir: &str, name: &str) -> bool {
        (**self).exists(dir, name)
    }

    fn save_value(&self, dir: &str, name: &str, value: Value) -> StoreResult<()> {
        (**self).save_value(dir, name, value)
    }

    fn load_value(&self, dir: &str, name: &str) -> StoreResult<Value> {
        (**self).load_value(dir, name)
    }
}

impl<S: ArtifactStore + ?Sized> ArtifactStore for Arc<S> {
    fn exists(&self, dir: &str, name: &str) -> bool {
        (**self).exists(dir, name)
    }

    fn save_value(&self, dir: &str, name: &str, value: Value) -> StoreResult<()> {
        (**self).save_value(dir, name, value)
    }

    fn load_value(&self, dir: &str, name: &str) -> StoreResult<Value> {
        (**self).load_value(dir, name)
    }
}

fn entry_path(dir: &str, name: &str) -> PathBuf {
    Path::new(dir).join(format!("{name}.{EXTENSION}"))
}

/// One JSON file per entry: `<root>/<dir>/<name>.json`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, dir: &str, name: &str) -> PathBuf {
        self.root.join(entry_path(dir, name))
    }

    /// Deletes every entry stored under `dir`.
    pub fn remove_dir(&self, dir: &str) -> StoreResult<()> {
        let path = self.root.join(dir);
        if !path.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&path).map_err(|source| StoreError::Io { path, source })
    }
}

impl ArtifactStore for FsArtifactStore {
    fn exists(&self, dir: &str, name: &str) -> bool {
        self.path_of(dir, name).is_file()
    }

    fn save_value(&self, dir: &str, name: &str, value: Value) -> StoreResult<()> {
        write_json(&self.path_of(dir, name), &value)
    }

    fn load_value(&self, dir: &str, name: &str) -> StoreResult<Value> {
        let path = self.path_of(dir, name);
        if !path.is_file() {
            return Err(StoreError::Missing {
                dir: dir.to_string(),
                name: name.to_string(),
            });
        }
        read_json(&path)
    }
}

pub(crate) fn read_json<T>(path: &Path) -> StoreResult<T>
where
    T: DeserializeOwned,
{
    let file = File::open(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).map_err(|source| StoreError::Format {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T>(path: &Path, value: &T) -> StoreResult<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let file = File::create(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value).map_err(|source| StoreError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Process-local store, handy for tests and single-run pipelines.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    entries: RwLock<HashMap<(String, String), Value>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn remove(&self, dir: &str, name: &str) -> Option<Value> {
        self.entries
            .write()
            .remove(&(dir.to_string(), name.to_string()))
    }

    /// Replaces an entry in place, bypassing serialisation.
    pub fn overwrite(&self, dir: &str, name: &str, value: Value) {
        self.entries
            .write()
            .insert((dir.to_string(), name.to_string()), value);
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn exists(&self, dir: &str, name: &str) -> bool {
        self.entries
            .read()
            .contains_key(&(dir.to_string(), name.to_string()))
    }

    fn save_value(&self, dir: &str, name: &str, value: Value) -> StoreResult<()> {
        self.overwrite(dir, name, value);
        Ok(())
    }

    fn load_value(&self, dir: &str, name: &str) -> StoreResult<Value> {
        self.entries
            .read()
            .get(&(dir.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::Missing {
                dir: dir.to_string(),
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_root(name: &str) -> PathBuf {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock after epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("podrom_store_{name}_{epoch}"))
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn buffered_write_failure_is_reported() {
        // Opening succeeds, every write fails with ENOSPC.
        let full = Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        let result = write_json(full, &vec![1.0, 2.0, 3.0]);
        assert!(matches!(result, Err(StoreError::Io { .. })), "{result:?}");
    }

    #[test]
    fn filesystem_round_trip() {
        let store = FsArtifactStore::new(temp_root("fs"));
        assert!(!store.exists("U", "eigenvalues"));
        store
            .save("U", "eigenvalues", &vec![0.75, 0.25])
            .expect("save eigenvalues");
        assert!(store.exists("U", "eigenvalues"));
        let loaded: Vec<f64> = store.load("U", "eigenvalues").expect("load eigenvalues");
        assert_eq!(loaded, vec![0.75, 0.25]);
        assert!(store.path_of("U", "eigenvalues").ends_with("U/eigenvalues.json"));

        let missing: StoreResult<Vec<f64>> = store.load("U", "cumulative_eigenvalues");
        assert!(matches!(missing, Err(StoreError::Missing { .. })));
        store.remove_dir("U").expect("cleanup");
        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn corrupt_file_is_a_format_error() {
        let store = FsArtifactStore::new(temp_root("corrupt"));
        let path = store.path_of("p", "p_0");
        fs::create_dir_all(path.parent().expect("parent")).expect("create dir");
        fs::write(&path, "{ not json").expect("write garbage");
        let result: StoreResult<Value> = store.load("p", "p_0");
        assert!(matches!(result, Err(StoreError::Format { .. })));
        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn memory_store_type_mismatch() {
        let store = MemoryArtifactStore::new();
        store.save("T", "meta", &"text").expect("save");
        let result: StoreResult<Vec<f64>> = store.load("T", "meta");
        assert!(matches!(result, Err(StoreError::Format { .. })));
        assert_eq!(store.len(), 1);
    }
}
