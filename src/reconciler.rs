//! External FILAMENT DB reconciler (§4.K). Grounded in
//! `original_source/ofd/{repo,index,mapper,vendor_map}.py`.

use crate::error::ReconcileError;
use crate::index::{build_generic_profile_index, resolve_generic_id, ProfileIndex};
use crate::model::{SlicerType, StoredProfile};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const BRAND_PREFIX_OVERRIDES: &[(&str, &str)] = &[
    ("bambu_lab", "Bambu"),
    ("esun_3d", "eSUN"),
    ("add_north", "addnorth"),
    ("3d_fuel", "3D-Fuel"),
    ("filamentpm", "Filament PM"),
    ("voxel_pla", "VOXELPLA"),
    ("protopasta", "Proto-pasta"),
    ("tectonic_3d", "Tectonic-3D"),
);

/// Candidate profile-name prefixes for a brand, override first, deduplicated.
pub fn profile_prefixes(brand_id: &str, brand_name: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    if let Some((_, over)) = BRAND_PREFIX_OVERRIDES.iter().find(|(id, _)| *id == brand_id) {
        prefixes.push(over.to_string());
    }
    if !brand_name.is_empty() && !prefixes.contains(&brand_name.to_string()) {
        prefixes.push(brand_name.to_string());
    }
    prefixes
}

#[derive(Debug, Clone)]
pub struct OfdFilament {
    pub brand_id: String,
    pub brand_name: String,
    pub material: String,
    pub filament_id: String,
    pub filament_name: String,
    pub fs_path: String,
    pub slicer_settings: HashMap<String, Value>,
    pub slicer_ids: HashMap<String, String>,
    pub path: PathBuf,
}

/// Read-only walk of `{brand_id}/{material}/{filament_id}/filament.json`.
pub struct OfdRepo {
    pub filaments: Vec<OfdFilament>,
}

impl OfdRepo {
    pub fn load(data_dir: &Path) -> Result<Self, ReconcileError> {
        if !data_dir.is_dir() {
            return Err(ReconcileError::Io {
                path: data_dir.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "OFD data directory not found"),
            });
        }

        let mut filaments = Vec::new();
        let mut brand_dirs: Vec<PathBuf> =
            std::fs::read_dir(data_dir).map_err(|source| ReconcileError::Io { path: data_dir.to_path_buf(), source })?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
        brand_dirs.sort();

        for brand_dir in brand_dirs {
            let brand_json = brand_dir.join("brand.json");
            if !brand_json.exists() {
                continue;
            }
            let brand_id = brand_dir.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
            let brand_data: Value = read_json(&brand_json)?;
            let brand_name = brand_data.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();

            let mut material_dirs: Vec<PathBuf> = std::fs::read_dir(&brand_dir)
                .map_err(|source| ReconcileError::Io { path: brand_dir.clone(), source })?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            material_dirs.sort();

            for material_dir in material_dirs {
                let material = material_dir.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();

                let mut filament_dirs: Vec<PathBuf> = std::fs::read_dir(&material_dir)
                    .map_err(|source| ReconcileError::Io { path: material_dir.clone(), source })?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_dir())
                    .collect();
                filament_dirs.sort();

                for filament_dir in filament_dirs {
                    let filament_path = filament_dir.join("filament.json");
                    if !filament_path.exists() {
                        continue;
                    }
                    let data: Value = read_json(&filament_path)?;
                    let filament_id = filament_dir.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
                    let filament_name = data
                        .get("name")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| filament_id.clone());
                    let fs_path = format!("{brand_id}/{material}/{filament_id}");

                    let slicer_settings = data
                        .get("slicer_settings")
                        .and_then(|v| v.as_object())
                        .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                        .unwrap_or_default();
                    let slicer_ids = data
                        .get("slicer_ids")
                        .and_then(|v| v.as_object())
                        .map(|o| {
                            o.iter()
                                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                                .collect()
                        })
                        .unwrap_or_default();

                    filaments.push(OfdFilament {
                        brand_id: brand_id.clone(),
                        brand_name: brand_name.clone(),
                        material: material.clone(),
                        filament_id,
                        filament_name,
                        fs_path,
                        slicer_settings,
                        slicer_ids,
                        path: filament_path,
                    });
                }
            }
        }

        Ok(OfdRepo { filaments })
    }
}

fn read_json(path: &Path) -> Result<Value, ReconcileError> {
    let bytes = std::fs::read(path).map_err(|source| ReconcileError::Io { path: path.to_path_buf(), source })?;
    serde_json::from_slice(&bytes).map_err(|source| ReconcileError::Corrupt { path: path.to_path_buf(), source })
}

/// Multi-strategy index over OFD filaments, for resolving a slicer-profile
/// identity back to an OFD filesystem path.
pub struct OfdFilamentIndex {
    by_slicer_profile: HashMap<String, HashMap<String, usize>>,
    by_slicer_id: HashMap<String, HashMap<String, usize>>,
    by_brand_material_name: HashMap<(String, String, String), usize>,
    pub filaments: Vec<OfdFilament>,
}

impl OfdFilamentIndex {
    pub fn build(repo: OfdRepo) -> Self {
        let mut by_slicer_profile: HashMap<String, HashMap<String, usize>> = HashMap::new();
        let mut by_slicer_id: HashMap<String, HashMap<String, usize>> = HashMap::new();
        let mut by_brand_material_name = HashMap::new();

        for (i, fil) in repo.filaments.iter().enumerate() {
            by_brand_material_name.insert(
                (fil.brand_name.to_lowercase(), fil.material.to_uppercase(), fil.filament_name.to_lowercase()),
                i,
            );

            for (slicer, settings) in &fil.slicer_settings {
                if let Some(name) = settings.get("profile_name").and_then(|v| v.as_str()) {
                    by_slicer_profile.entry(slicer.clone()).or_default().insert(name.to_lowercase(), i);
                }
                if let Some(id) = settings.get("id").and_then(|v| v.as_str()) {
                    by_slicer_id.entry(slicer.clone()).or_default().entry(id.to_string()).or_insert(i);
                }
            }
            for (slicer, sid) in &fil.slicer_ids {
                if !sid.is_empty() {
                    by_slicer_id.entry(slicer.clone()).or_default().insert(sid.clone(), i);
                }
            }
        }

        OfdFilamentIndex { by_slicer_profile, by_slicer_id, by_brand_material_name, filaments: repo.filaments }
    }

    pub fn resolve_path(
        &self,
        filament_type: &str,
        profile_name: &str,
        slicer: &str,
        filament_id: Option<&str>,
    ) -> Option<&str> {
        let base_name = profile_name.split(" @").next().unwrap_or(profile_name);
        let filament_id = filament_id.filter(|id| !id.contains(" @") && !id.contains(' '));

        if let Some(idx) = self.by_slicer_profile.get(slicer).and_then(|m| m.get(&base_name.to_lowercase())) {
            return Some(&self.filaments[*idx].fs_path);
        }

        if let Some(id) = filament_id {
            if let Some(idx) = self.by_slicer_id.get(slicer).and_then(|m| m.get(id)) {
                let fil = &self.filaments[*idx];
                let bn_lower = base_name.to_lowercase();
                let brand_lower = fil.brand_name.to_lowercase();
                if bn_lower.contains(&brand_lower) || bn_lower.contains(&fil.brand_id.replace('_', " ")) {
                    return Some(&fil.fs_path);
                }
            }
        }

        let parts: Vec<&str> = base_name.split_whitespace().collect();
        if parts.len() >= 2 {
            let material_upper = filament_type.to_uppercase();
            for i in 1..parts.len() {
                let candidate_brand = parts[..i].join(" ").to_lowercase();
                let remaining = &parts[i..];
                if !remaining.is_empty() && remaining[0].to_uppercase() == material_upper {
                    if remaining.len() > 1 {
                        let candidate_name = remaining[1..].join(" ").to_lowercase();
                        let key = (candidate_brand.clone(), material_upper.clone(), candidate_name);
                        if let Some(idx) = self.by_brand_material_name.get(&key) {
                            return Some(&self.filaments[*idx].fs_path);
                        }
                    } else {
                        let key = (candidate_brand.clone(), material_upper.clone(), material_upper.to_lowercase());
                        if let Some(idx) = self.by_brand_material_name.get(&key) {
                            return Some(&self.filaments[*idx].fs_path);
                        }
                    }
                }
            }
        }

        None
    }

    pub fn build_filament_map(&self) -> HashMap<String, HashMap<String, String>> {
        let mut result = HashMap::new();
        for (slicer, profiles) in &self.by_slicer_profile {
            let mut slicer_map = HashMap::new();
            for idx in profiles.values() {
                let fil = &self.filaments[*idx];
                if let Some(name) = fil.slicer_settings.get(slicer).and_then(|s| s.get("profile_name")).and_then(|v| v.as_str()) {
                    slicer_map.insert(name.to_string(), fil.fs_path.clone());
                }
            }
            result.insert(slicer.clone(), slicer_map);
        }
        result
    }
}

fn is_proper_id(value: &str) -> bool {
    !value.is_empty() && !value.contains(" @") && !value.contains(' ')
}

fn best_slicer_id(profiles: &[&StoredProfile]) -> Option<String> {
    for p in profiles {
        if let Some(id) = &p.filament_id {
            if is_proper_id(id) {
                return Some(id.clone());
            }
        }
    }
    for p in profiles {
        if let Some(id) = &p.setting_id {
            if is_proper_id(id) {
                return Some(id.clone());
            }
        }
    }
    None
}

fn compose_candidates(prefix: &str, material: &str, filament_name: &str) -> Vec<String> {
    let material_upper = material.to_uppercase();
    let mut candidates = Vec::new();

    if !filament_name.is_empty() {
        candidates.push(format!("{prefix} {material_upper} {filament_name}"));
        candidates.push(format!("{prefix} {material_upper}-{filament_name}"));
        if filament_name.to_lowercase().starts_with("for ") {
            candidates.push(format!("{prefix} Support {filament_name}"));
        }
        let name_upper = filament_name.to_uppercase();
        if name_upper.starts_with(&material_upper) {
            let suffix = name_upper[material_upper.len()..].trim_start_matches(['-', '+', ' ']);
            if !suffix.is_empty() {
                let original_suffix = &filament_name[filament_name.len() - suffix.len()..];
                candidates.push(format!("{prefix} {material_upper} {original_suffix}"));
            }
        }
        candidates.push(format!("{prefix} {filament_name}"));
    }
    if filament_name.is_empty() || filament_name.to_uppercase() == material_upper {
        candidates.push(format!("{prefix} {material_upper}"));
    }

    candidates
}

#[derive(Debug, Clone)]
pub struct MappingResult {
    pub filament_path: PathBuf,
    pub slicer: String,
    pub profile_name: String,
    pub slicer_id: Option<String>,
    pub generic_id: Option<String>,
    pub vendor: String,
}

#[derive(Debug, Clone)]
pub struct MappingConflict {
    pub filament_path: PathBuf,
    pub slicer: String,
    pub field: &'static str,
    pub existing: String,
    pub derived: String,
}

#[derive(Debug, Clone, Default)]
pub struct MappingReport {
    pub updated: Vec<MappingResult>,
    pub already_correct: Vec<MappingResult>,
    pub conflicts: Vec<MappingConflict>,
    pub skipped: Vec<(PathBuf, String)>,
}

fn match_filament(
    index: &ProfileIndex,
    brand_id: &str,
    brand_name: &str,
    material: &str,
    filament_name: &str,
    filament_path: &Path,
    slicer: SlicerType,
    generics: &HashMap<SlicerType, Vec<(String, String, String)>>,
) -> Option<MappingResult> {
    let prefixes = profile_prefixes(brand_id, brand_name);
    for prefix in &prefixes {
        for candidate in compose_candidates(prefix, material, filament_name) {
            let matches = index.find_by_base_name_any_vendor(slicer, &candidate);
            if let Some((vendor, profiles)) = matches.into_iter().next() {
                let profile_base_name = profiles[0].name.split(" @").next().unwrap_or(&profiles[0].name).to_string();
                let slicer_id = best_slicer_id(&profiles);
                let gid = generics
                    .get(&slicer)
                    .and_then(|g| resolve_generic_id(g, &material.to_uppercase(), &profile_base_name));
                return Some(MappingResult {
                    filament_path: filament_path.to_path_buf(),
                    slicer: slicer.value().to_string(),
                    profile_name: profile_base_name,
                    slicer_id,
                    generic_id: gid,
                    vendor,
                });
            }
        }
    }
    None
}

/// Run the forward-match + reverse-compare reconciliation over every
/// `filament.json` under `data_dir`, against `index`. Conflicts abort the
/// whole run (no writes); `dry_run` additionally suppresses writes even
/// when there are no conflicts.
pub fn reconcile(
    index: &ProfileIndex,
    data_dir: &Path,
    slicers: Option<&[SlicerType]>,
    dry_run: bool,
) -> Result<MappingReport, ReconcileError> {
    let slicers = slicers.map(|s| s.to_vec()).unwrap_or_else(|| SlicerType::ALL.to_vec());
    let generics = build_generic_profile_index(index, Some(&slicers));
    let mut report = MappingReport::default();

    let mut brand_dirs: Vec<PathBuf> = std::fs::read_dir(data_dir)
        .map_err(|source| ReconcileError::Io { path: data_dir.to_path_buf(), source })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    brand_dirs.sort();

    for brand_dir in brand_dirs {
        let brand_json = brand_dir.join("brand.json");
        if !brand_json.exists() {
            continue;
        }
        let brand_id = brand_dir.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        let brand_data: Value = read_json(&brand_json)?;
        let brand_name = brand_data.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();

        let mut material_dirs: Vec<PathBuf> = std::fs::read_dir(&brand_dir)
            .map_err(|source| ReconcileError::Io { path: brand_dir.clone(), source })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        material_dirs.sort();

        for material_dir in material_dirs {
            let material = material_dir.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();

            let mut filament_dirs: Vec<PathBuf> = std::fs::read_dir(&material_dir)
                .map_err(|source| ReconcileError::Io { path: material_dir.clone(), source })?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            filament_dirs.sort();

            for filament_dir in filament_dirs {
                let filament_path = filament_dir.join("filament.json");
                if !filament_path.exists() {
                    continue;
                }
                let filament_data: Value = read_json(&filament_path)?;
                let filament_name = filament_data.get("name").and_then(|v| v.as_str()).unwrap_or_default();

                for slicer in &slicers {
                    let Some(mut result) = match_filament(
                        index, &brand_id, &brand_name, &material, filament_name, &filament_path, *slicer, &generics,
                    ) else {
                        report.skipped.push((filament_path.clone(), format!("no match for {brand_name} {material}/{filament_name} [{}]", slicer.value())));
                        continue;
                    };

                    let existing_slicer = filament_data
                        .get("slicer_settings")
                        .and_then(|v| v.get(slicer.value()))
                        .cloned()
                        .unwrap_or(Value::Null);
                    let existing_name = existing_slicer.get("profile_name").and_then(|v| v.as_str());
                    let existing_id = existing_slicer.get("id").and_then(|v| v.as_str());

                    let mut has_conflict = false;

                    if let Some(existing_name) = existing_name {
                        if existing_name != result.profile_name {
                            report.conflicts.push(MappingConflict {
                                filament_path: filament_path.clone(),
                                slicer: slicer.value().to_string(),
                                field: "profile_name",
                                existing: existing_name.to_string(),
                                derived: result.profile_name.clone(),
                            });
                            has_conflict = true;
                        }
                    }

                    if let (Some(derived_id), Some(existing_id)) = (result.slicer_id.clone(), existing_id) {
                        if existing_id != derived_id {
                            let existing_in_store = !index.find_by_slicer_id(*slicer, existing_id).is_empty();
                            if !existing_in_store {
                                result.slicer_id = Some(existing_id.to_string());
                            } else {
                                report.conflicts.push(MappingConflict {
                                    filament_path: filament_path.clone(),
                                    slicer: slicer.value().to_string(),
                                    field: "slicer_id",
                                    existing: existing_id.to_string(),
                                    derived: derived_id,
                                });
                                has_conflict = true;
                            }
                        }
                    }

                    if has_conflict {
                        continue;
                    }

                    let existing_generic_id = existing_slicer.get("generic_id").and_then(|v| v.as_str());
                    let name_matches = existing_name == Some(result.profile_name.as_str());
                    let id_matches = result.slicer_id.is_none() || existing_id == result.slicer_id.as_deref();
                    let gid_matches = result.generic_id.is_none() || existing_generic_id == result.generic_id.as_deref();

                    if name_matches && id_matches && gid_matches {
                        report.already_correct.push(result);
                    } else {
                        report.updated.push(result);
                    }
                }
            }
        }
    }

    if !report.conflicts.is_empty() || dry_run {
        return Ok(report);
    }

    write_updates(&report.updated, &report.already_correct)?;
    Ok(report)
}

fn write_updates(updated: &[MappingResult], already_correct: &[MappingResult]) -> Result<(), ReconcileError> {
    let mut by_path: HashMap<PathBuf, Vec<&MappingResult>> = HashMap::new();
    for r in updated.iter().chain(already_correct.iter()) {
        by_path.entry(r.filament_path.clone()).or_default().push(r);
    }

    for (path, mappings) in by_path {
        let mut data: Value = read_json(&path)?;
        let obj = data.as_object_mut().expect("filament.json is always a JSON object");

        if let Some(legacy) = obj.remove("slicer_ids") {
            if let Some(legacy) = legacy.as_object() {
                let settings = obj.entry("slicer_settings").or_insert_with(|| Value::Object(serde_json::Map::new()));
                let settings = settings.as_object_mut().expect("slicer_settings is always a JSON object");
                for (slicer_key, sid) in legacy {
                    let entry = settings.entry(slicer_key.clone()).or_insert_with(|| Value::Object(serde_json::Map::new()));
                    let entry = entry.as_object_mut().expect("slicer_settings entry is always a JSON object");
                    entry.entry("id".to_string()).or_insert_with(|| sid.clone());
                }
            }
        }

        let settings = obj.entry("slicer_settings").or_insert_with(|| Value::Object(serde_json::Map::new()));
        let settings = settings.as_object_mut().expect("slicer_settings is always a JSON object");
        for m in mappings {
            let entry = settings.entry(m.slicer.clone()).or_insert_with(|| Value::Object(serde_json::Map::new()));
            let entry = entry.as_object_mut().expect("slicer_settings entry is always a JSON object");
            entry.insert("profile_name".to_string(), Value::String(m.profile_name.clone()));
            if let Some(id) = &m.slicer_id {
                entry.insert("id".to_string(), Value::String(id.clone()));
            }
            if let Some(gid) = &m.generic_id {
                entry.insert("generic_id".to_string(), Value::String(gid.clone()));
            }
        }

        let mut bytes = serde_json::to_vec_pretty(&data).expect("Value always serializes");
        bytes.push(b'\n');
        std::fs::write(&path, bytes).map_err(|source| ReconcileError::Io { path, source })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brand_prefix_override_comes_first() {
        assert_eq!(profile_prefixes("bambu_lab", "Bambu Lab"), vec!["Bambu".to_string(), "Bambu Lab".to_string()]);
        assert_eq!(profile_prefixes("sunlu", "SUNLU"), vec!["SUNLU".to_string()]);
    }

    #[test]
    fn compose_candidates_covers_primary_and_hyphenated_forms() {
        let candidates = compose_candidates("Bambu", "PLA", "Matte");
        assert!(candidates.contains(&"Bambu PLA Matte".to_string()));
        assert!(candidates.contains(&"Bambu PLA-Matte".to_string()));
    }

    #[test]
    fn is_proper_id_rejects_profile_names() {
        assert!(is_proper_id("GFB00"));
        assert!(!is_proper_id("Generic PLA @BBL X1C"));
    }
}
