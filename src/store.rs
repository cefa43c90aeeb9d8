//! Calibration-object store.
//!
//! Objects are looked up by key and validity timestamp (ms since epoch), or by
//! run number. A missing key or validity window is not an error: callers get
//! `Ok(None)` and apply their own fallback.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::hist::Histogram;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize entry for {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("store cache lock poisoned")]
    Poisoned,
}

/// One alignment record; only the transverse offsets are consumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignParam {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CalibObject {
    AlignParams(Vec<AlignParam>),
    FloatVector(Vec<f32>),
    Histogram(Histogram),
}

impl CalibObject {
    pub fn into_align_params(self) -> Option<Vec<AlignParam>> {
        match self {
            CalibObject::AlignParams(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_float_vector(self) -> Option<Vec<f32>> {
        match self {
            CalibObject::FloatVector(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_histogram(self) -> Option<Histogram> {
        match self {
            CalibObject::Histogram(h) => Some(h),
            _ => None,
        }
    }
}

/// A stored object together with its validity metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub valid_from: i64,
    pub valid_until: i64,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub run: Option<i32>,
    pub object: CalibObject,
}

impl ObjectEntry {
    fn covers(&self, timestamp: i64) -> bool {
        self.valid_from <= timestamp && timestamp < self.valid_until
    }
}

pub trait ObjectStore {
    fn fetch(&self, key: &str, timestamp: i64) -> Result<Option<CalibObject>, StoreError>;

    fn fetch_for_run(&self, key: &str, run: i32) -> Result<Option<CalibObject>, StoreError>;
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(i64::MAX)
}

fn select_for_timestamp<'a>(
    entries: &'a [ObjectEntry],
    timestamp: i64,
    created_not_after: i64,
) -> Option<&'a ObjectEntry> {
    entries
        .iter()
        .filter(|e| e.covers(timestamp) && e.created <= created_not_after)
        .max_by_key(|e| e.created)
}

fn select_for_run(
    entries: &[ObjectEntry],
    run: i32,
    created_not_after: i64,
) -> Option<&ObjectEntry> {
    entries
        .iter()
        .filter(|e| e.run == Some(run) && e.created <= created_not_after)
        .max_by_key(|e| e.created)
}

/// Directory-backed snapshot of a calibration store.
///
/// Key `A/B/C` lives in `<root>/A/B/C/`, one JSON [`ObjectEntry`] per file.
/// Each key directory is read once and cached.
pub struct LocalStore {
    root: PathBuf,
    created_not_after: i64,
    cache: Mutex<HashMap<String, Vec<ObjectEntry>>>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, created_not_after: i64) -> Self {
        Self {
            root: root.into(),
            created_not_after,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |dir, part| dir.join(part))
    }

    fn load_entries(&self, key: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        let dir = self.key_dir(key);
        if !dir.is_dir() {
            debug!("[store] no objects under {}", dir.display());
            return Ok(Vec::new());
        }
        let read_dir = fs::read_dir(&dir).map_err(|source| StoreError::Read {
            path: dir.clone(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = Vec::new();
        for item in read_dir {
            let item = item.map_err(|source| StoreError::Read {
                path: dir.clone(),
                source,
            })?;
            let path = item.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            let text = fs::read_to_string(&path).map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?;
            let entry: ObjectEntry =
                serde_json::from_str(&text).map_err(|source| StoreError::Parse {
                    path: path.clone(),
                    source,
                })?;
            entries.push(entry);
        }
        debug!("[store] cached {} object(s) for {}", entries.len(), key);
        Ok(entries)
    }

    fn with_entries<T>(
        &self,
        key: &str,
        pick: impl FnOnce(&[ObjectEntry]) -> T,
    ) -> Result<T, StoreError> {
        let mut cache = self.cache.lock().map_err(|_| StoreError::Poisoned)?;
        if !cache.contains_key(key) {
            let entries = self.load_entries(key)?;
            cache.insert(key.to_string(), entries);
        }
        let entries = cache.get(key).map(Vec::as_slice).unwrap_or(&[]);
        Ok(pick(entries))
    }

    /// Write an entry under `key`; used to build snapshots.
    pub fn put(&self, key: &str, name: &str, entry: &ObjectEntry) -> Result<PathBuf, StoreError> {
        let dir = self.key_dir(key);
        fs::create_dir_all(&dir).map_err(|source| StoreError::Write {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(format!("{name}.json"));
        let text = serde_json::to_string(entry).map_err(|source| StoreError::Serialize {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, text).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(key);
        }
        Ok(path)
    }
}

impl ObjectStore for LocalStore {
    fn fetch(&self, key: &str, timestamp: i64) -> Result<Option<CalibObject>, StoreError> {
        let ceiling = self.created_not_after;
        self.with_entries(key, |entries| {
            select_for_timestamp(entries, timestamp, ceiling).map(|e| e.object.clone())
        })
    }

    fn fetch_for_run(&self, key: &str, run: i32) -> Result<Option<CalibObject>, StoreError> {
        let ceiling = self.created_not_after;
        self.with_entries(key, |entries| {
            select_for_run(entries, run, ceiling).map(|e| e.object.clone())
        })
    }
}

/// In-memory store; counts fetches so callers can check caching behaviour.
#[derive(Default)]
pub struct MemoryStore {
    entries: HashMap<String, Vec<ObjectEntry>>,
    fetches: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, entry: ObjectEntry) {
        self.entries.entry(key.to_string()).or_default().push(entry);
    }

    /// Insert an object valid for all timestamps.
    pub fn insert_always(&mut self, key: &str, object: CalibObject) {
        self.insert(
            key,
            ObjectEntry {
                valid_from: i64::MIN,
                valid_until: i64::MAX,
                created: 0,
                run: None,
                object,
            },
        );
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().map(|n| *n).unwrap_or(0)
    }

    fn bump(&self) {
        if let Ok(mut n) = self.fetches.lock() {
            *n += 1;
        }
    }
}

impl ObjectStore for MemoryStore {
    fn fetch(&self, key: &str, timestamp: i64) -> Result<Option<CalibObject>, StoreError> {
        self.bump();
        Ok(self
            .entries
            .get(key)
            .and_then(|entries| select_for_timestamp(entries, timestamp, i64::MAX))
            .map(|e| e.object.clone()))
    }

    fn fetch_for_run(&self, key: &str, run: i32) -> Result<Option<CalibObject>, StoreError> {
        self.bump();
        Ok(self
            .entries
            .get(key)
            .and_then(|entries| select_for_run(entries, run, i64::MAX))
            .map(|e| e.object.clone()))
    }
}
