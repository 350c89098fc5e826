//! Hierarchical, YAML-backed configuration store.
//!
//! The store is single-writer, multi-reader: reads take the `RwLock` read
//! side and never block each other; every mutation (`set_file`,
//! `remove_file`, `move_path`, `reload`) takes the write side, which
//! drains in-flight reads first.

use crate::error::BeaconError;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use walkdir::WalkDir;

struct Index {
    /// relative path -> raw file bytes
    files: HashMap<String, Vec<u8>>,
    /// object name -> (relative path, document index within the file)
    objects: HashMap<String, (String, usize)>,
}

impl Index {
    fn empty() -> Self {
        Index { files: HashMap::new(), objects: HashMap::new() }
    }
}

pub struct ConfigStore {
    root: PathBuf,
    index: RwLock<Index>,
}

impl ConfigStore {
    /// Builds a store rooted at `root`, walking it once to populate the
    /// initial index. A file that fails to parse is logged by the caller
    /// and skipped, not fatal: the store tolerates partial corruption of
    /// the tree rather than refusing to start.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BeaconError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(BeaconError::not_found(
                format!("config root '{}' does not exist", root.display()),
                "store",
            ));
        }
        let store = ConfigStore { root, index: RwLock::new(Index::empty()) };
        store.reload_quiet();
        Ok(store)
    }

    /// Rebuilds every index from disk from scratch. Files that fail to
    /// parse as YAML are kept in the raw-bytes index (so `GetFile` and
    /// `GetDbTree` still serve them, including non-YAML script files
    /// under `scripts/`) but contribute no object-name entries.
    pub fn reload(&self) -> Vec<(String, String)> {
        self.reload_quiet()
    }

    fn reload_quiet(&self) -> Vec<(String, String)> {
        let mut parse_errors = Vec::new();
        let mut files = HashMap::new();
        let mut objects = HashMap::new();

        for entry in WalkDir::new(&self.root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let abs_path = entry.path();
            let rel_path = match abs_path.strip_prefix(&self.root) {
                Ok(p) => p.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            let bytes = match fs::read(abs_path) {
                Ok(b) => b,
                Err(e) => {
                    parse_errors.push((rel_path, format!("{e}")));
                    continue;
                }
            };

            if is_yaml_path(&rel_path) {
                match parse_yaml_documents(&bytes) {
                    Ok(docs) => {
                        for (idx, doc) in docs.iter().enumerate() {
                            if let Some(name) = object_name(doc) {
                                objects.insert(name, (rel_path.clone(), idx));
                            }
                        }
                    }
                    Err(e) => parse_errors.push((rel_path.clone(), e)),
                }
            }

            files.insert(rel_path, bytes);
        }

        let mut index = self.index.write().unwrap();
        index.files = files;
        index.objects = objects;
        parse_errors
    }

    /// Resolves `path` to an absolute filesystem path, rejecting any
    /// attempt to escape `root` via `..` components.
    fn resolve(&self, path: &str) -> Result<PathBuf, BeaconError> {
        let candidate = self.root.join(path);
        let normalized = normalize(&candidate);
        if !normalized.starts_with(&self.root) {
            return Err(BeaconError::conflict(format!("path '{path}' escapes the config root"), "store"));
        }
        Ok(normalized)
    }

    pub fn get_file(&self, path: &str) -> Result<Vec<u8>, BeaconError> {
        self.resolve(path)?;
        let index = self.index.read().unwrap();
        index
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| BeaconError::not_found(format!("no such file '{path}'"), "store"))
    }

    /// Every `(relative_path, content)` pair under `base_path`.
    pub fn get_tree(&self, base_path: &str) -> Vec<(String, Vec<u8>)> {
        let prefix = base_path.trim_start_matches('/');
        let index = self.index.read().unwrap();
        let mut out: Vec<(String, Vec<u8>)> = index
            .files
            .iter()
            .filter(|(rel, _)| prefix.is_empty() || rel.starts_with(prefix))
            .map(|(rel, content)| (rel.clone(), content.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Writes `content` to `path` atomically: write to a temp file in the
    /// same directory, then rename over the target. Never truncates the
    /// destination in place, so a crash mid-write never leaves a
    /// half-written file behind.
    pub fn set_file(&self, path: &str, content: &[u8]) -> Result<(), BeaconError> {
        let target = self.resolve(path)?;
        let dir = target.parent().ok_or_else(|| BeaconError::conflict("path has no parent directory", "store"))?;
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, content)?;
        tmp.persist(&target).map_err(|e| BeaconError::io(e.error, "store"))?;

        let mut index = self.index.write().unwrap();
        index.files.insert(path.to_string(), content.to_vec());
        if is_yaml_path(path) {
            index.objects.retain(|_, (rel, _)| rel != path);
            if let Ok(docs) = parse_yaml_documents(content) {
                for (idx, doc) in docs.iter().enumerate() {
                    if let Some(name) = object_name(doc) {
                        index.objects.insert(name, (path.to_string(), idx));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn remove_file(&self, path: &str) -> Result<(), BeaconError> {
        let target = self.resolve(path)?;
        fs::remove_file(&target)?;

        let mut index = self.index.write().unwrap();
        index.files.remove(path);
        index.objects.retain(|_, (rel, _)| rel != path);
        Ok(())
    }

    pub fn move_path(&self, src: &str, dst: &str) -> Result<(), BeaconError> {
        let src_abs = self.resolve(src)?;
        let dst_abs = self.resolve(dst)?;
        if let Some(parent) = dst_abs.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src_abs, &dst_abs)?;
        drop(self.reload_quiet());
        Ok(())
    }

    /// Resolves an object name to its owning file's content, used by
    /// callers that still address configuration by object name rather
    /// than by path.
    pub fn get_object_file(&self, name: &str) -> Option<String> {
        let index = self.index.read().unwrap();
        index.objects.get(name).map(|(path, _)| path.clone())
    }
}

fn is_yaml_path(path: &str) -> bool {
    path.ends_with(".yml") || path.ends_with(".yaml")
}

fn parse_yaml_documents(bytes: &[u8]) -> Result<Vec<serde_yaml::Value>, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| format!("{e}"))?;
    let mut docs = Vec::new();
    for doc_text in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(doc_text).map_err(|e| format!("{e}"))?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

fn object_name(doc: &serde_yaml::Value) -> Option<String> {
    let mapping = doc.as_mapping()?;
    mapping.iter().find_map(|(k, v)| match k.as_str() {
        Some("name") => v.as_str().map(str::to_string),
        _ => None,
    })
}

/// Lexically normalizes `..`/`.` components without touching the
/// filesystem, so `resolve` can reject an escape before anything exists
/// on disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

use serde::Deserialize;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn loads_objects_from_yaml_on_open() {
        let dir = tempdir().unwrap();
        write(dir.path(), "axes/robz.yml", "name: robz\nsteps_per_unit: 1000\n");
        let store = ConfigStore::open(dir.path()).unwrap();
        assert_eq!(store.get_object_file("robz").as_deref(), Some("axes/robz.yml"));
    }

    #[test]
    fn get_file_roundtrips_set_file() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        store.set_file("axes/robz.yml", b"name: robz\n").unwrap();
        assert_eq!(store.get_file("axes/robz.yml").unwrap(), b"name: robz\n");
    }

    #[test]
    fn escaping_path_is_rejected() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        let err = store.set_file("../escape.yml", b"x: 1").unwrap_err();
        assert_eq!(err.kind, crate::error::BeaconErrorKind::Conflict);
    }

    #[test]
    fn remove_file_drops_its_objects() {
        let dir = tempdir().unwrap();
        write(dir.path(), "axes/robz.yml", "name: robz\n");
        let store = ConfigStore::open(dir.path()).unwrap();
        store.remove_file("axes/robz.yml").unwrap();
        assert!(store.get_file("axes/robz.yml").is_err());
        assert_eq!(store.get_object_file("robz"), None);
    }

    #[test]
    fn get_tree_filters_by_prefix() {
        let dir = tempdir().unwrap();
        write(dir.path(), "axes/robz.yml", "name: robz\n");
        write(dir.path(), "other/thing.yml", "name: thing\n");
        let store = ConfigStore::open(dir.path()).unwrap();
        let tree = store.get_tree("axes");
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].0, "axes/robz.yml");
    }

    #[test]
    fn move_path_reindexes() {
        let dir = tempdir().unwrap();
        write(dir.path(), "axes/robz.yml", "name: robz\n");
        let store = ConfigStore::open(dir.path()).unwrap();
        store.move_path("axes/robz.yml", "axes/robz2.yml").unwrap();
        assert!(store.get_file("axes/robz.yml").is_err());
        assert_eq!(store.get_file("axes/robz2.yml").unwrap(), b"name: robz\n");
        assert_eq!(store.get_object_file("robz").as_deref(), Some("axes/robz2.yml"));
    }
}
