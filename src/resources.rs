//! Content-addressed resource store (§4.B). Grounded in
//! `original_source/resources.py`.

use crate::error::StoreError;
use crate::model::{ParsedProfile, RESOURCE_SETTING_KEYS};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static HASH_REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^sha256:([0-9a-f]+)$").unwrap());

pub const RESOURCE_EXTENSIONS: &[&str] = &["stl", "svg", "png"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub filename: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: String,
}

pub struct ResourceStore {
    root: PathBuf,
    manifest: BTreeMap<String, ResourceEntry>,
}

impl ResourceStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io { path: root.clone(), source })?;
        let manifest = Self::load_manifest(&root)?;
        Ok(ResourceStore { root, manifest })
    }

    fn manifest_path(root: &Path) -> PathBuf {
        root.join("_manifest.json")
    }

    fn load_manifest(root: &Path) -> Result<BTreeMap<String, ResourceEntry>, StoreError> {
        let path = Self::manifest_path(root);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let bytes = fs::read(&path).map_err(|source| StoreError::Io { path: path.clone(), source })?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { path, source })
    }

    pub fn save_manifest(&self) -> Result<(), StoreError> {
        let path = Self::manifest_path(&self.root);
        let data = serde_json::to_vec_pretty(&self.manifest).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, data).map_err(|source| StoreError::Io { path, source })
    }

    /// Read `file_path`, hash its contents, write `{hex}.{ext}` if absent,
    /// update the manifest, return the hex digest.
    pub fn store(&mut self, file_path: &Path) -> Result<String, StoreError> {
        let bytes = fs::read(file_path).map_err(|source| StoreError::Io {
            path: file_path.to_path_buf(),
            source,
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let hex = hex_encode(&hasher.finalize());

        let ext = file_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        let dest = self.root.join(format!("{hex}.{ext}"));
        if !dest.exists() {
            fs::write(&dest, &bytes).map_err(|source| StoreError::Io {
                path: dest.clone(),
                source,
            })?;
        }
        self.manifest.insert(
            hex.clone(),
            ResourceEntry {
                filename: file_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string(),
                size: bytes.len() as u64,
                kind: ext,
            },
        );
        Ok(hex)
    }

    pub fn get_path(&self, hex: &str) -> Option<PathBuf> {
        let entry = self.manifest.get(hex)?;
        Some(self.root.join(format!("{hex}.{}", entry.kind)))
    }

    pub fn entry(&self, hex: &str) -> Option<&ResourceEntry> {
        self.manifest.get(hex)
    }

    pub fn manifest(&self) -> &BTreeMap<String, ResourceEntry> {
        &self.manifest
    }

    /// Find a stored hash whose recorded original filename matches `filename`.
    pub fn resolve_filename(&self, filename: &str) -> Option<&String> {
        self.manifest
            .iter()
            .find(|(_, entry)| entry.filename == filename)
            .map(|(hash, _)| hash)
    }

    /// Remove every manifest entry (and its file) not present in `referenced`.
    pub fn gc(&mut self, referenced: &std::collections::HashSet<String>) -> Result<Vec<String>, StoreError> {
        let stale: Vec<String> = self
            .manifest
            .keys()
            .filter(|hash| !referenced.contains(*hash))
            .cloned()
            .collect();
        for hash in &stale {
            if let Some(path) = self.get_path(hash) {
                let _ = fs::remove_file(path);
            }
            self.manifest.remove(hash);
        }
        if !stale.is_empty() {
            self.save_manifest()?;
        }
        Ok(stale)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Walk `source_dir` for resource files (`*.stl`, `*.svg`, `*.png`), storing
/// each and returning a filename -> hex-digest map.
pub fn collect_resources(
    store: &mut ResourceStore,
    source_dir: &Path,
) -> Result<HashMap<String, String>, StoreError> {
    let mut map = HashMap::new();
    for entry in walkdir::WalkDir::new(source_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());
        let Some(ext) = ext else { continue };
        if !RESOURCE_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }
        let hex = store.store(entry.path())?;
        if let Some(name) = entry.path().file_name().and_then(|n| n.to_str()) {
            map.insert(name.to_string(), hex);
        }
    }
    store.save_manifest()?;
    Ok(map)
}

/// Rewrite resource-key settings in place: a bare filename present in
/// `resource_map` becomes `"sha256:{digest}"`. Filenames absent from the map
/// are left unchanged.
pub fn rewrite_resource_refs(profile: &mut ParsedProfile, resource_map: &HashMap<String, String>) {
    for key in RESOURCE_SETTING_KEYS {
        if let Some(value) = profile.settings.get_mut(*key) {
            if let Some(filename) = value.as_str() {
                if let Some(hash) = resource_map.get(filename) {
                    *value = serde_json::Value::String(format!("sha256:{hash}"));
                }
            }
        }
    }
}

/// Scan every stored profile's versioned settings for resource-key values
/// matching `sha256:{hex}` and collect the referenced hashes.
pub fn collect_referenced_hashes(store_root: &Path, slicer_dir: &str) -> std::collections::HashSet<String> {
    let mut out = std::collections::HashSet::new();
    let slicer_path = store_root.join(slicer_dir);
    for entry in walkdir::WalkDir::new(&slicer_path).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .path()
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('_'))
        {
            continue;
        }
        if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(bytes) = fs::read(entry.path()) else { continue };
        let Ok(profile) = serde_json::from_slice::<crate::model::StoredProfile>(&bytes) else { continue };
        for key in RESOURCE_SETTING_KEYS {
            if let Some(history) = profile.settings.get(*key) {
                for value in history.values() {
                    if let Some(s) = value.as_str() {
                        if let Some(caps) = HASH_REF_RE.captures(s) {
                            out.insert(caps[1].to_string());
                        }
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn store_is_idempotent_and_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ResourceStore::open(dir.path()).unwrap();
        let file_a = dir.path().join("a.png");
        let mut f = fs::File::create(&file_a).unwrap();
        f.write_all(b"hello").unwrap();
        let file_b = dir.path().join("b.png");
        let mut f = fs::File::create(&file_b).unwrap();
        f.write_all(b"hello").unwrap();

        let h1 = store.store(&file_a).unwrap();
        let h2 = store.store(&file_a).unwrap();
        let h3 = store.store(&file_b).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1, h3);
        assert_eq!(store.manifest().len(), 1);
    }

    #[test]
    fn gc_removes_unreferenced() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ResourceStore::open(dir.path()).unwrap();
        let file_a = dir.path().join("a.png");
        fs::write(&file_a, b"one").unwrap();
        let h1 = store.store(&file_a).unwrap();
        store.save_manifest().unwrap();

        let referenced = std::collections::HashSet::new();
        let removed = store.gc(&referenced).unwrap();
        assert_eq!(removed, vec![h1.clone()]);
        assert!(store.get_path(&h1).is_none() || !store.get_path(&h1).unwrap().exists());
    }

    #[test]
    fn unmatched_filename_is_left_unchanged() {
        let mut profile = ParsedProfile::new(
            crate::model::SlicerType::BambuStudio,
            crate::model::ProfileType::MachineModel,
            "model".into(),
            "BBL".into(),
        );
        profile
            .settings
            .insert("bed_model".into(), serde_json::Value::String("missing.stl".into()));
        let map = HashMap::new();
        rewrite_resource_refs(&mut profile, &map);
        assert_eq!(profile.settings["bed_model"], serde_json::Value::String("missing.stl".into()));
    }
}
