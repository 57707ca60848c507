//! Persistent versioned profile store with change detection (§4.F).
//! Grounded in `original_source/store.py`.

use crate::error::StoreError;
use crate::model::{IngestionReport, ParsedProfile, ProfileType, SlicerType, StoredProfile};
use crate::parsers;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Keys carried on a `ParsedProfile` that are metadata, not versioned
/// settings.
const META_KEYS: &[&str] = &["renamed_from"];

static SANITIZE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r#"[<>:"/\\|?*]"#).unwrap());
static COLLAPSE_UNDERSCORE_RE: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"_+").unwrap());

pub struct ProfileStore {
    pub root: PathBuf,
}

impl ProfileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ProfileStore { root: root.into() }
    }

    /// Parse every profile under `profiles_dir` with the slicer's parser and
    /// ingest them as one version.
    pub fn ingest(
        &self,
        slicer: SlicerType,
        version: &str,
        profiles_dir: &Path,
    ) -> Result<IngestionReport, StoreError> {
        let parser = parsers::for_slicer(slicer);
        let parsed = parser.parse_directory(profiles_dir, None);
        self.ingest_profiles(slicer, version, parsed)
    }

    pub fn ingest_profiles(
        &self,
        slicer: SlicerType,
        version: &str,
        profiles: Vec<ParsedProfile>,
    ) -> Result<IngestionReport, StoreError> {
        let mut added = Vec::new();
        let mut changed: indexmap::IndexMap<String, Vec<String>> = indexmap::IndexMap::new();
        let mut seen_keys: HashSet<String> = HashSet::new();
        let processed = profiles.len();

        for p in &profiles {
            let key = Self::profile_key(slicer, p.profile_type, &p.vendor, &p.name);
            seen_keys.insert(key);

            let existing = self.load(slicer, p.profile_type, &p.vendor, &p.name)?;
            match existing {
                None => {
                    let mut stored = Self::create_stored(p, version);
                    if let Some(old_name) = extract_renamed_from(&p.settings) {
                        if let Some(old_profile) = self.load(slicer, p.profile_type, &p.vendor, &old_name)? {
                            merge_rename(&mut stored, &old_profile);
                            self.delete(slicer, p.profile_type, &p.vendor, &old_name)?;
                        }
                    }
                    self.save(&stored)?;
                    added.push(p.name.clone());
                }
                Some(mut existing) => {
                    let prev_last_seen = existing.last_seen.clone();
                    let changed_keys = Self::merge_version(&mut existing, p, version);
                    if !changed_keys.is_empty() {
                        changed.insert(p.name.clone(), changed_keys.clone());
                    }
                    if !changed_keys.is_empty() || prev_last_seen != version {
                        self.save(&existing)?;
                    }
                }
            }
        }

        let all_keys = self.list_profile_keys(slicer)?;
        let removed: Vec<String> = all_keys.into_iter().filter(|k| !seen_keys.contains(k)).collect();

        self.update_meta(slicer, version)?;

        let unchanged = processed.saturating_sub(added.len()).saturating_sub(changed.len());
        Ok(IngestionReport {
            slicer: Some(slicer),
            version: version.to_string(),
            profiles_processed: processed,
            added,
            removed,
            changed,
            unchanged,
        })
    }

    pub fn get(
        &self,
        slicer: SlicerType,
        profile_type: ProfileType,
        vendor: &str,
        name: &str,
    ) -> Result<Option<StoredProfile>, StoreError> {
        self.load(slicer, profile_type, vendor, name)
    }

    pub fn list_profiles(
        &self,
        slicer: SlicerType,
        profile_type: Option<ProfileType>,
    ) -> Result<Vec<StoredProfile>, StoreError> {
        let slicer_dir = self.root.join(slicer.value());
        if !slicer_dir.exists() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for vendor_entry in std::fs::read_dir(&slicer_dir).map_err(|source| StoreError::Io {
            path: slicer_dir.clone(),
            source,
        })? {
            let vendor_entry = vendor_entry.map_err(|source| StoreError::Io {
                path: slicer_dir.clone(),
                source,
            })?;
            let vendor_dir = vendor_entry.path();
            let is_hidden = vendor_dir
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('_'))
                .unwrap_or(true);
            if !vendor_dir.is_dir() || is_hidden {
                continue;
            }

            let type_dirs: Vec<PathBuf> = match profile_type {
                Some(pt) => vec![vendor_dir.join(pt.value())],
                None => std::fs::read_dir(&vendor_dir)
                    .map_err(|source| StoreError::Io { path: vendor_dir.clone(), source })?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_dir())
                    .collect(),
            };

            for type_dir in type_dirs {
                if !type_dir.exists() {
                    continue;
                }
                for entry in walkdir::WalkDir::new(&type_dir).into_iter().filter_map(|e| e.ok()) {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let Ok(bytes) = std::fs::read(entry.path()) else { continue };
                    if let Ok(profile) = serde_json::from_slice::<StoredProfile>(&bytes) {
                        out.push(profile);
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn get_versions(&self, slicer: SlicerType) -> Vec<String> {
        self.load_meta(slicer)
            .get("versions")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect())
            .unwrap_or_default()
    }

    fn merge_version(stored: &mut StoredProfile, parsed: &ParsedProfile, version: &str) -> Vec<String> {
        let mut changed = Vec::new();
        stored.last_seen = version.to_string();

        for (key, new_value) in &parsed.settings {
            if META_KEYS.contains(&key.as_str()) {
                continue;
            }
            let current = stored.get_latest(key);
            let current_normalized = current.map(crate::model::canonical_json).unwrap_or_default();
            let new_normalized = crate::model::canonical_json(new_value);
            if current_normalized != new_normalized {
                stored
                    .settings
                    .entry(key.clone())
                    .or_default()
                    .insert(version.to_string(), new_value.clone());
                changed.push(key.clone());
            }
        }
        changed
    }

    fn create_stored(parsed: &ParsedProfile, version: &str) -> StoredProfile {
        let mut stored = StoredProfile::new(
            parsed.slicer,
            parsed.profile_type,
            parsed.name.clone(),
            parsed.vendor.clone(),
            version,
        );
        stored.filament_id = parsed.filament_id.clone();
        stored.setting_id = parsed.setting_id.clone();
        for (key, value) in &parsed.settings {
            if META_KEYS.contains(&key.as_str()) {
                continue;
            }
            let mut history = indexmap::IndexMap::new();
            history.insert(version.to_string(), value.clone());
            stored.settings.insert(key.clone(), history);
        }
        stored
    }

    fn profile_key(slicer: SlicerType, profile_type: ProfileType, vendor: &str, name: &str) -> String {
        format!("{}/{}/{}/{}", slicer.value(), vendor, profile_type.value(), name)
    }

    fn profile_path(&self, slicer: SlicerType, profile_type: ProfileType, vendor: &str, name: &str) -> PathBuf {
        self.root
            .join(slicer.value())
            .join(vendor)
            .join(profile_type.value())
            .join(format!("{}.json", sanitize(name)))
    }

    fn load(
        &self,
        slicer: SlicerType,
        profile_type: ProfileType,
        vendor: &str,
        name: &str,
    ) -> Result<Option<StoredProfile>, StoreError> {
        let path = self.profile_path(slicer, profile_type, vendor, name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(|source| StoreError::Io { path: path.clone(), source })?;
        let profile = serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { path, source })?;
        Ok(Some(profile))
    }

    fn save(&self, stored: &StoredProfile) -> Result<(), StoreError> {
        let path = self.profile_path(stored.slicer, stored.profile_type, &stored.vendor, &stored.name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io { path: path.clone(), source })?;
        }
        let data = serde_json::to_vec_pretty(stored).map_err(|source| StoreError::Corrupt { path: path.clone(), source })?;
        std::fs::write(&path, data).map_err(|source| StoreError::Io { path, source })
    }

    fn delete(&self, slicer: SlicerType, profile_type: ProfileType, vendor: &str, name: &str) -> Result<(), StoreError> {
        let path = self.profile_path(slicer, profile_type, vendor, name);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| StoreError::Io { path, source })?;
        }
        Ok(())
    }

    fn list_profile_keys(&self, slicer: SlicerType) -> Result<HashSet<String>, StoreError> {
        let mut keys = HashSet::new();
        let slicer_dir = self.root.join(slicer.value());
        if !slicer_dir.exists() {
            return Ok(keys);
        }
        for vendor_entry in std::fs::read_dir(&slicer_dir).map_err(|source| StoreError::Io {
            path: slicer_dir.clone(),
            source,
        })? {
            let vendor_entry = vendor_entry.map_err(|source| StoreError::Io { path: slicer_dir.clone(), source })?;
            let vendor_dir = vendor_entry.path();
            let vendor_name = vendor_dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if !vendor_dir.is_dir() || vendor_name.starts_with('_') {
                continue;
            }
            let Ok(type_entries) = std::fs::read_dir(&vendor_dir) else { continue };
            for type_entry in type_entries.filter_map(|e| e.ok()) {
                let type_dir = type_entry.path();
                if !type_dir.is_dir() {
                    continue;
                }
                let profile_type = type_dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                for entry in walkdir::WalkDir::new(&type_dir).into_iter().filter_map(|e| e.ok()) {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                        keys.insert(format!("{}/{}/{}/{}", slicer.value(), vendor_name, profile_type, stem));
                    }
                }
            }
        }
        Ok(keys)
    }

    fn meta_path(&self, slicer: SlicerType) -> PathBuf {
        self.root.join(slicer.value()).join("_meta.json")
    }

    fn load_meta(&self, slicer: SlicerType) -> Value {
        let path = self.meta_path(slicer);
        std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }

    fn update_meta(&self, slicer: SlicerType, version: &str) -> Result<(), StoreError> {
        let mut meta = self.load_meta(slicer);
        let obj = meta.as_object_mut().expect("meta is always an object");
        let mut versions: Vec<Value> = obj
            .get("versions")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if !versions.iter().any(|v| v.as_str() == Some(version)) {
            versions.push(Value::String(version.to_string()));
        }
        obj.insert("versions".to_string(), Value::Array(versions));
        obj.insert("last_ingested".to_string(), Value::String(version.to_string()));

        let path = self.meta_path(slicer);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io { path: path.clone(), source })?;
        }
        let data = serde_json::to_vec_pretty(&meta).map_err(|source| StoreError::Corrupt { path: path.clone(), source })?;
        std::fs::write(&path, data).map_err(|source| StoreError::Io { path, source })
    }
}

fn extract_renamed_from(settings: &indexmap::IndexMap<String, Value>) -> Option<String> {
    match settings.get("renamed_from")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map.values().find_map(|v| v.as_str().map(|s| s.to_string())),
        _ => None,
    }
}

fn merge_rename(new_profile: &mut StoredProfile, old_profile: &StoredProfile) {
    new_profile.first_seen = old_profile.first_seen.clone();
    new_profile.renamed_from = Some(old_profile.name.clone());

    for (key, old_versions) in &old_profile.settings {
        match new_profile.settings.get_mut(key) {
            Some(new_versions) => {
                let mut merged = old_versions.clone();
                for (v, val) in new_versions.iter() {
                    merged.insert(v.clone(), val.clone());
                }
                *new_versions = merged;
            }
            None => {
                new_profile.settings.insert(key.clone(), old_versions.clone());
            }
        }
    }
}

fn sanitize(name: &str) -> String {
    let replaced = SANITIZE_RE.replace_all(name, "_");
    let collapsed = COLLAPSE_UNDERSCORE_RE.replace_all(&replaced, "_");
    collapsed.trim_matches(|c: char| c == '_' || c == '.' || c == ' ').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParsedProfile;

    fn profile(name: &str, value: &str) -> ParsedProfile {
        let mut p = ParsedProfile::new(SlicerType::BambuStudio, ProfileType::Filament, name.into(), "BBL".into());
        p.settings.insert("nozzle_temperature".into(), Value::String(value.into()));
        p
    }

    #[test]
    fn ingest_then_reingest_tracks_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path());

        let report1 = store
            .ingest_profiles(SlicerType::BambuStudio, "1.0.0", vec![profile("Bambu PLA", "220")])
            .unwrap();
        assert_eq!(report1.added, vec!["Bambu PLA".to_string()]);

        let report2 = store
            .ingest_profiles(SlicerType::BambuStudio, "1.1.0", vec![profile("Bambu PLA", "225")])
            .unwrap();
        assert!(report2.added.is_empty());
        assert_eq!(report2.changed.get("Bambu PLA"), Some(&vec!["nozzle_temperature".to_string()]));

        let stored = store
            .get(SlicerType::BambuStudio, ProfileType::Filament, "BBL", "Bambu PLA")
            .unwrap()
            .unwrap();
        assert_eq!(stored.get_at_version("nozzle_temperature", "1.0.0"), Some(&Value::String("220".into())));
        assert_eq!(stored.get_latest("nozzle_temperature"), Some(&Value::String("225".into())));
    }

    #[test]
    fn missing_profile_is_reported_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path());
        store
            .ingest_profiles(SlicerType::BambuStudio, "1.0.0", vec![profile("Bambu PLA", "220")])
            .unwrap();
        let report = store.ingest_profiles(SlicerType::BambuStudio, "1.1.0", vec![]).unwrap();
        assert_eq!(report.removed, vec!["bambustudio/BBL/filament/Bambu PLA".to_string()]);
    }
}
