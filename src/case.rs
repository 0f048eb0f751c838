use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use nalgebra::DVector;
use serde::Deserialize;

use crate::cache::store::read_json;
use crate::config::{OfflineConfig, OnlineConfig};
use crate::reduced::{NavierStokesOperators, OperatorFile};
use crate::snapshot::{FieldSnapshot, SnapshotSet};

const DEFAULT_ROOT: &str = "cases";
const SNAPSHOT_DIR: &str = "snapshots";
const LIFT_DIR: &str = "lifts";
const CONFIG_FILE: &str = "config.json";
const ONLINE_FILE: &str = "online.json";

/// `snapshots/<field>.json`, also the format of `lifts/<field>.json`
#[derive(Debug, Deserialize)]
struct SnapshotFile {
    #[serde(default = "single_component")]
    components: usize,
    /// Cell volumes; unit volumes when absent.
    #[serde(default)]
    weights: Option<Vec<f64>>,
    snapshots: Vec<Vec<f64>>,
}

fn single_component() -> usize {
    1
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CaseConfig {
    pub offline: OfflineConfig,
    pub online: OnlineConfig,
}

#[derive(Debug, Deserialize)]
struct OnlineFile {
    #[serde(default = "default_velocity")]
    velocity: String,
    #[serde(default = "default_pressure")]
    pressure: String,
    operators: OperatorFile,
    parameters: Vec<f64>,
    #[serde(default)]
    start_index: usize,
    #[serde(default)]
    supremizer: Option<String>,
}

fn default_velocity() -> String {
    "U".to_string()
}

fn default_pressure() -> String {
    "p".to_string()
}

/// Inputs of the online stage of a case.
#[derive(Debug, Clone)]
pub struct OnlineCase {
    pub velocity: String,
    pub pressure: String,
    pub operators: NavierStokesOperators,
    pub parameters: DVector<f64>,
    pub start_index: usize,
    /// Snapshot field whose POD modes are appended to the velocity basis.
    pub supremizer: Option<String>,
}

/// A case directory: field snapshots, optional lift functions, optional
/// configuration overrides and optional online inputs.
#[derive(Debug, Clone)]
pub struct Case {
    pub name: String,
    pub dir: PathBuf,
    pub config: CaseConfig,
    pub fields: IndexMap<String, SnapshotSet<FieldSnapshot>>,
    /// Boundary lift functions per field, prepended to that field's basis.
    pub lifts: IndexMap<String, Vec<FieldSnapshot>>,
    pub online: Option<OnlineCase>,
}

impl Case {
    pub fn lift(&self, field: &str) -> &[FieldSnapshot] {
        self.lifts.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn field(&self, name: &str) -> Result<&SnapshotSet<FieldSnapshot>> {
        self.fields
            .get(name)
            .with_context(|| format!("case {} has no snapshots for field {name}", self.name))
    }

    /// Store root for bases, relative to the case directory unless absolute.
    pub fn output_root(&self) -> PathBuf {
        self.dir.join(&self.config.offline.output_root)
    }
}

#[derive(Debug, Clone)]
pub struct CaseLoader {
    root: PathBuf,
}

impl Default for CaseLoader {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl CaseLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every sub-directory of the root that holds a `snapshots` directory.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root).with_context(|| format!("list cases directory {:?}", self.root))?;
        let mut cases: Vec<String> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let path = entry.path();
                if path.join(SNAPSHOT_DIR).is_dir() {
                    Some(entry.file_name().to_string_lossy().into_owned())
                } else {
                    None
                }
            })
            .collect();
        cases.sort();
        Ok(cases)
    }

    pub fn load(&self, name: &str) -> Result<Case> {
        let dir = self.root.join(name);
        let config = match dir.join(CONFIG_FILE) {
            path if path.is_file() => {
                read_json(&path).with_context(|| format!("read case configuration {:?}", path))?
            }
            _ => CaseConfig::default(),
        };
        let mut fields = IndexMap::new();
        for (field, path) in json_files(&dir.join(SNAPSHOT_DIR))? {
            let payloads = load_payloads(&field, &path)?;
            let set = SnapshotSet::new(field.as_str(), payloads)
                .with_context(|| format!("build snapshot set for {field}"))?;
            fields.insert(field, set);
        }
        if fields.is_empty() {
            anyhow::bail!("no snapshot files under {:?}", dir.join(SNAPSHOT_DIR));
        }
        let mut lifts = IndexMap::new();
        let lift_dir = dir.join(LIFT_DIR);
        if lift_dir.is_dir() {
            for (field, path) in json_files(&lift_dir)? {
                if !fields.contains_key(&field) {
                    anyhow::bail!("lift functions {:?} belong to no snapshot field", path);
                }
                let payloads = load_payloads(&field, &path)?;
                lifts.insert(field, payloads);
            }
        }
        let online = match dir.join(ONLINE_FILE) {
            path if path.is_file() => Some(load_online(&path)?),
            _ => None,
        };
        Ok(Case {
            name: name.to_string(),
            dir,
            config,
            fields,
            lifts,
            online,
        })
    }
}

/// `(stem, path)` of every JSON file in `dir`, sorted by path.
fn json_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = fs::read_dir(dir).with_context(|| format!("list directory {:?}", dir))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(OsStr::to_str)
                    .map(|ext| ext.eq_ignore_ascii_case("json"))
                    .unwrap_or(false)
        })
        .collect();
    paths.sort();
    paths
        .into_iter()
        .map(|path| {
            let stem = path
                .file_stem()
                .and_then(OsStr::to_str)
                .with_context(|| format!("file name {:?}", path))?
                .to_string();
            Ok((stem, path))
        })
        .collect()
}

fn load_payloads(field: &str, path: &Path) -> Result<Vec<FieldSnapshot>> {
    let file: SnapshotFile = read_json(path).with_context(|| format!("read {field} vectors from {:?}", path))?;
    let length = file.snapshots.first().map(Vec::len).unwrap_or(0);
    let weights = match file.weights {
        Some(weights) => weights,
        None => vec![1.0; length / file.components.max(1)],
    };
    let weights = Arc::new(DVector::from_vec(weights));
    file.snapshots
        .into_iter()
        .map(|values| FieldSnapshot::new(DVector::from_vec(values), file.components, Arc::clone(&weights)))
        .collect::<crate::error::Result<Vec<_>>>()
        .with_context(|| format!("assemble {field} vectors from {:?}", path))
}

fn load_online(path: &Path) -> Result<OnlineCase> {
    let file: OnlineFile = read_json(path).with_context(|| format!("read online inputs from {:?}", path))?;
    let operators = NavierStokesOperators::try_from(&file.operators)
        .with_context(|| format!("convert reduced operators from {:?}", path))?;
    Ok(OnlineCase {
        velocity: file.velocity,
        pressure: file.pressure,
        operators,
        parameters: DVector::from_vec(file.parameters),
        start_index: file.start_index,
        supremizer: file.supremizer,
    })
}
