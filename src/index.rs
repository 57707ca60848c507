//! In-memory lookup index over a [`ProfileStore`] (§4.H). Grounded in
//! `original_source/index.py`.

use crate::condition::{self, ConfigMap};
use crate::model::{ProfileType, SlicerType, StoredProfile};
use crate::store::ProfileStore;
use std::collections::HashMap;

fn first_str(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::Array(arr) => arr.first().and_then(|v| v.as_str()).map(|s| s.to_string()),
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn base_name(name: &str) -> &str {
    name.split(" @").next().unwrap_or(name)
}

pub struct ProfileIndex {
    by_slicer_id: HashMap<(SlicerType, String), Vec<StoredProfile>>,
    by_name: HashMap<(SlicerType, String, String), Vec<StoredProfile>>,
    generics: HashMap<(SlicerType, String, String), Vec<StoredProfile>>,
    by_type: HashMap<(SlicerType, ProfileType, String, String), Vec<StoredProfile>>,
    by_base_name: HashMap<(SlicerType, String, String), (String, Vec<StoredProfile>)>,
}

impl ProfileIndex {
    pub fn new() -> Self {
        ProfileIndex {
            by_slicer_id: HashMap::new(),
            by_name: HashMap::new(),
            generics: HashMap::new(),
            by_type: HashMap::new(),
            by_base_name: HashMap::new(),
        }
    }

    pub fn build(store: &ProfileStore, slicers: Option<&[SlicerType]>) -> Result<Self, crate::error::StoreError> {
        let mut index = ProfileIndex::new();
        let slicers = slicers.map(|s| s.to_vec()).unwrap_or_else(|| SlicerType::ALL.to_vec());
        for slicer in slicers {
            for profile in store.list_profiles(slicer, None)? {
                index.index_profile(slicer, profile);
            }
        }
        Ok(index)
    }

    fn index_profile(&mut self, slicer: SlicerType, profile: StoredProfile) {
        let slicer_id = profile.filament_id.clone().or_else(|| profile.setting_id.clone());
        if let Some(id) = slicer_id {
            self.by_slicer_id.entry((slicer, id)).or_default().push(profile.clone());
        }

        self.by_name
            .entry((slicer, profile.vendor.clone(), profile.name.clone()))
            .or_default()
            .push(profile.clone());

        let vendor_latest = profile.get_latest("filament_vendor").and_then(|v| first_str(Some(v)));
        if vendor_latest.as_deref() == Some("Generic") {
            if let Some(ftype) = profile.get_latest("filament_type").and_then(|v| first_str(Some(v))) {
                self.generics
                    .entry((slicer, profile.vendor.clone(), ftype))
                    .or_default()
                    .push(profile.clone());
            }
        }

        self.by_type
            .entry((slicer, profile.profile_type, profile.vendor.clone(), profile.name.clone()))
            .or_default()
            .push(profile.clone());

        let base = base_name(&profile.name).to_string();
        let key = (slicer, profile.vendor.clone(), base.to_lowercase());
        self.by_base_name
            .entry(key)
            .or_insert_with(|| (base.clone(), Vec::new()))
            .1
            .push(profile);
    }

    pub fn find_by_slicer_id(&self, slicer: SlicerType, id: &str) -> Vec<&StoredProfile> {
        self.by_slicer_id
            .get(&(slicer, id.to_string()))
            .map(|v| v.iter().collect())
            .unwrap_or_default()
    }

    pub fn find_by_name(&self, slicer: SlicerType, vendor: &str, name: &str) -> Vec<&StoredProfile> {
        self.by_name
            .get(&(slicer, vendor.to_string(), name.to_string()))
            .map(|v| v.iter().collect())
            .unwrap_or_default()
    }

    pub fn find_by_base_name(&self, slicer: SlicerType, vendor: &str, name: &str) -> Vec<&StoredProfile> {
        self.by_base_name
            .get(&(slicer, vendor.to_string(), name.to_lowercase()))
            .map(|(_, v)| v.iter().collect())
            .unwrap_or_default()
    }

    pub fn find_by_base_name_any_vendor(&self, slicer: SlicerType, name: &str) -> Vec<(String, Vec<&StoredProfile>)> {
        let needle = name.to_lowercase();
        self.by_base_name
            .iter()
            .filter(|((s, _, n), _)| *s == slicer && n == &needle)
            .map(|((_, vendor, _), (_, profiles))| (vendor.clone(), profiles.iter().collect()))
            .collect()
    }

    pub fn find_by_type(
        &self,
        slicer: SlicerType,
        profile_type: ProfileType,
        vendor: Option<&str>,
        name: Option<&str>,
    ) -> Vec<&StoredProfile> {
        match (vendor, name) {
            (Some(v), Some(n)) => self
                .by_type
                .get(&(slicer, profile_type, v.to_string(), n.to_string()))
                .map(|p| p.iter().collect())
                .unwrap_or_default(),
            (Some(v), None) => self
                .by_type
                .iter()
                .filter(|((s, pt, vd, _), _)| *s == slicer && *pt == profile_type && vd == v)
                .flat_map(|(_, p)| p.iter())
                .collect(),
            _ => self
                .by_type
                .iter()
                .filter(|((s, pt, _, _), _)| *s == slicer && *pt == profile_type)
                .flat_map(|(_, p)| p.iter())
                .collect(),
        }
    }

    pub fn find_generic(&self, slicer: SlicerType, vendor: &str, filament_type: &str) -> Vec<&StoredProfile> {
        self.generics
            .get(&(slicer, vendor.to_string(), filament_type.to_string()))
            .map(|v| v.iter().collect())
            .unwrap_or_default()
    }

    pub fn is_profile_generic(profile: &StoredProfile) -> bool {
        profile
            .get_latest("filament_vendor")
            .and_then(|v| first_str(Some(v)))
            .as_deref()
            == Some("Generic")
    }

    pub fn is_profile_model_specific(
        slicer: SlicerType,
        profile: &StoredProfile,
        model_counts: Option<&HashMap<(SlicerType, String), usize>>,
    ) -> bool {
        if slicer.is_prusaslicer_family() {
            let cond = profile
                .get_latest("compatible_printers_condition")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            return cond.contains(".*PRINTER_MODEL_") || cond.contains("printer_model=");
        }

        let compatible_count = profile
            .get_latest("compatible_printers")
            .map(|v| match v {
                serde_json::Value::Array(a) => a.len(),
                _ => 1,
            })
            .unwrap_or(0);
        let Some(counts) = model_counts else { return false };
        let Some(&total) = counts.get(&(slicer, profile.vendor.clone())) else { return false };
        total != 0 && compatible_count == total
    }

    /// Resolve `compatible_printers`/`compatible_printers_condition` against
    /// `printer_name`/`printer_data`, returning the first match.
    pub fn find_compatible<'a>(
        &self,
        profiles: &[&'a StoredProfile],
        printer_name: &str,
        printer_data: &ConfigMap,
        slicer: SlicerType,
    ) -> Option<&'a StoredProfile> {
        self.find_all_compatible(profiles, printer_name, printer_data, slicer)
            .into_iter()
            .next()
    }

    pub fn find_all_compatible<'a>(
        &self,
        profiles: &[&'a StoredProfile],
        printer_name: &str,
        printer_data: &ConfigMap,
        slicer: SlicerType,
    ) -> Vec<&'a StoredProfile> {
        let mut out = Vec::new();
        for profile in profiles {
            if is_compatible(profile, printer_name, printer_data, slicer) {
                out.push(*profile);
            }
        }
        out
    }

    /// Hierarchical 4-step filament profile search, mirroring the original's
    /// standalone `find_filament_profile` tool exactly, including its
    /// deliberate "skip if ambiguous across vendors" rule in steps 2 and 4.
    pub fn find_filament_profile(
        &self,
        slicer: SlicerType,
        vendor: &str,
        printer_name: &str,
        printer_data: &ConfigMap,
        filament_name: &str,
        filament_type: &str,
    ) -> Option<&StoredProfile> {
        let printer_name = if slicer == SlicerType::PrusaSlicer {
            printer_data
                .get("printer_settings_id")
                .and_then(|v| v.as_str())
                .unwrap_or(printer_name)
        } else {
            printer_name
        };

        let exact = self.find_by_name(slicer, vendor, filament_name);
        if let Some(p) = self.find_compatible(&exact, printer_name, printer_data, slicer) {
            return Some(p);
        }

        let across_vendors = self.find_by_base_name_any_vendor(slicer, filament_name);
        let mut candidates: Vec<&StoredProfile> = Vec::new();
        for (_, profiles) in &across_vendors {
            for p in profiles {
                if self.find_compatible(std::slice::from_ref(p), printer_name, printer_data, slicer).is_some() {
                    candidates.push(*p);
                }
            }
        }
        if candidates.len() == 1 {
            return Some(candidates[0]);
        }

        let generic = self.find_generic(slicer, vendor, filament_type);
        if let Some(p) = self.find_compatible(&generic, printer_name, printer_data, slicer) {
            return Some(p);
        }

        let mut generic_candidates: Vec<&StoredProfile> = Vec::new();
        for profile in self.by_type.values().flat_map(|v| v.iter()) {
            if profile.profile_type != ProfileType::Filament {
                continue;
            }
            if !ProfileIndex::is_profile_generic(profile) {
                continue;
            }
            let ftype = profile.get_latest("filament_type").and_then(|v| first_str(Some(v)));
            if ftype.as_deref() != Some(filament_type) {
                continue;
            }
            if self
                .find_compatible(std::slice::from_ref(&profile), printer_name, printer_data, slicer)
                .is_some()
            {
                generic_candidates.push(profile);
            }
        }
        if generic_candidates.len() == 1 {
            return Some(generic_candidates[0]);
        }

        None
    }
}

impl Default for ProfileIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn is_compatible(profile: &StoredProfile, printer_name: &str, printer_data: &ConfigMap, slicer: SlicerType) -> bool {
    if let Some(compatible) = profile.get_latest("compatible_printers") {
        match compatible {
            serde_json::Value::Array(arr) => {
                if arr.iter().any(|v| v.as_str() == Some(printer_name)) {
                    return true;
                }
            }
            serde_json::Value::String(s) => {
                if s
                    .split(';')
                    .map(|p| p.trim().trim_matches('"'))
                    .any(|p| p == printer_name)
                {
                    return true;
                }
            }
            _ => {}
        }
    }

    if let Some(cond) = profile.get_latest("compatible_printers_condition").and_then(|v| v.as_str()) {
        if !cond.is_empty() {
            return condition::evaluate(cond, slicer, printer_data, None).unwrap_or(false);
        }
    }

    false
}

/// Longest-name-first generic lookup table: `(lowercased name, FILAMENT_TYPE, filament_id)`.
pub fn build_generic_profile_index(
    index: &ProfileIndex,
    slicers: Option<&[SlicerType]>,
) -> HashMap<SlicerType, Vec<(String, String, String)>> {
    let slicers = slicers.map(|s| s.to_vec()).unwrap_or_else(|| SlicerType::ALL.to_vec());
    let mut out = HashMap::new();
    for slicer in slicers {
        let mut entries: Vec<(String, String, String)> = Vec::new();
        for profile in index.find_by_type(slicer, ProfileType::Filament, None, None) {
            if !profile.name.contains("Generic") || profile.name.contains(" @") {
                continue;
            }
            let Some(id) = profile.filament_id.clone().filter(|id| !id.contains(' ')) else {
                continue;
            };
            let Some(ftype) = profile.get_latest("filament_type").and_then(|v| first_str(Some(v))) else {
                continue;
            };
            entries.push((profile.name.to_lowercase(), ftype.to_uppercase(), id));
        }
        entries.sort_by_key(|(name, _, _)| std::cmp::Reverse(name.len()));
        out.insert(slicer, entries);
    }
    out
}

pub fn resolve_generic_id(
    generics: &[(String, String, String)],
    filament_type: &str,
    filament_name: &str,
) -> Option<String> {
    let filament_type = filament_type.to_uppercase();
    let filament_name_lower = filament_name.to_lowercase();
    let mut base_fallback: Option<String> = None;

    for (name, ftype, id) in generics {
        if ftype != &filament_type {
            continue;
        }
        let prefix = format!("generic {}", filament_type.to_lowercase());
        let suffix = name.strip_prefix(&prefix).map(|s| s.trim()).unwrap_or("");
        if suffix.is_empty() {
            if base_fallback.is_none() {
                base_fallback = Some(id.clone());
            }
            continue;
        }
        if filament_name_lower.contains(suffix) {
            return Some(id.clone());
        }
    }
    base_fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParsedProfile, ProfileType};
    use serde_json::json;

    fn build_store(dir: &std::path::Path) -> ProfileStore {
        ProfileStore::new(dir)
    }

    #[test]
    fn find_by_name_and_compatible() {
        let dir = tempfile::tempdir().unwrap();
        let store = build_store(dir.path());

        let mut p = ParsedProfile::new(SlicerType::BambuStudio, ProfileType::Filament, "Bambu PLA".into(), "BBL".into());
        p.settings.insert("compatible_printers".into(), json!(["X1 Carbon"]));
        store.ingest_profiles(SlicerType::BambuStudio, "1.0.0", vec![p]).unwrap();

        let index = ProfileIndex::build(&store, None).unwrap();
        let found = index.find_by_name(SlicerType::BambuStudio, "BBL", "Bambu PLA");
        assert_eq!(found.len(), 1);

        let compatible = index.find_compatible(&found, "X1 Carbon", &ConfigMap::new(), SlicerType::BambuStudio);
        assert!(compatible.is_some());
        let incompatible = index.find_compatible(&found, "A1", &ConfigMap::new(), SlicerType::BambuStudio);
        assert!(incompatible.is_none());
    }

    #[test]
    fn resolve_generic_id_prefers_longest_specific_match() {
        let generics = vec![
            ("generic pla".to_string(), "PLA".to_string(), "GFL00".to_string()),
            ("generic pla silk".to_string(), "PLA".to_string(), "GFL01".to_string()),
        ];
        assert_eq!(
            resolve_generic_id(&generics, "PLA", "Generic PLA Silk White"),
            Some("GFL01".to_string())
        );
        assert_eq!(resolve_generic_id(&generics, "PLA", "Generic PLA Red"), Some("GFL00".to_string()));
    }
}
