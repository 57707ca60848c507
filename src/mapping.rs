//! Catalogue mapping pipeline: printer models → filament profiles → print
//! profiles → export (§4.J). Grounded in `original_source/mapping.py`.

use crate::brands;
use crate::condition::{self, ConfigMap};
use crate::error::MappingError;
use crate::index::{build_generic_profile_index, is_profile_model_specific, resolve_generic_id, ProfileIndex};
use crate::matching::{self, CatalogueModel};
use crate::model::{ProfileType, SlicerType, StoredProfile};
use crate::reconciler::OfdFilamentIndex;
use crate::resources::ResourceStore;
use crate::store::ProfileStore;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Slicers that participate in catalogue mapping.
pub const MAPPING_SLICERS: &[SlicerType] = &[
    SlicerType::PrusaSlicer,
    SlicerType::OrcaSlicer,
    SlicerType::BambuStudio,
    SlicerType::ElegooSlicer,
    SlicerType::SuperSlicer,
    SlicerType::Cura,
];

fn stable_version(profile: &StoredProfile) -> String {
    if !profile.last_seen.starts_with("nightly") {
        return profile.last_seen.clone();
    }
    let mut best: Option<&str> = None;
    for history in profile.settings.values() {
        for ver in history.keys() {
            if !ver.starts_with("nightly") && best.is_none_or(|b| ver.as_str() > b) {
                best = Some(ver.as_str());
            }
        }
    }
    best.map(|s| s.to_string()).unwrap_or_else(|| profile.last_seen.clone())
}

fn evaluate_stable(profile: &StoredProfile) -> IndexMap<String, Value> {
    profile.evaluate(&stable_version(profile))
}

fn to_config_map(data: &IndexMap<String, Value>) -> ConfigMap {
    data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn get_str<'a>(data: &'a IndexMap<String, Value>, key: &str) -> Option<&'a str> {
    data.get(key).and_then(|v| v.as_str())
}

fn get_name_or<'a>(data: &'a IndexMap<String, Value>, fallback: &'a str) -> &'a str {
    get_str(data, "name").unwrap_or(fallback)
}

fn split_variants(data: &IndexMap<String, Value>) -> Vec<String> {
    let nozzle_joined = match data.get("nozzle_diameter") {
        Some(Value::Array(a)) => a.iter().map(value_to_string).collect::<Vec<_>>().join(";"),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    };
    let raw = data.get("variants").cloned().unwrap_or(Value::String(nozzle_joined));
    match raw {
        Value::String(s) => s.split(';').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect(),
        Value::Array(a) => a.iter().map(value_to_string).collect(),
        _ => Vec::new(),
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn split_compat(data: &IndexMap<String, Value>) -> Vec<String> {
    match data.get("compatible_printers") {
        Some(Value::Array(a)) => a.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect(),
        Some(Value::String(s)) => s.split(';').map(|p| p.trim().trim_matches('"').to_string()).filter(|p| !p.is_empty()).collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub struct VariantEntry {
    pub name: String,
    pub data: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelMap {
    /// model_id → slicer value → [vendor/name] profile keys
    pub model_to_profiles: HashMap<u64, HashMap<String, Vec<String>>>,
    /// slicer value → lookup key (model+variant) → variant entry
    pub variant_map: HashMap<String, HashMap<String, VariantEntry>>,
    pub failed_brands: HashSet<String>,
    pub failed_models: HashSet<String>,
}

pub fn sp_api_url_from_env() -> Result<String, MappingError> {
    std::env::var("SP_API_URL").map_err(|_| MappingError::MissingApiUrl)
}

pub async fn fetch_sp_model_data(api_url: &str) -> Result<Value, MappingError> {
    let resp = reqwest::Client::new().get(api_url).send().await?.error_for_status()?;
    Ok(resp.json().await?)
}

/// Normalize the raw SP API response: lowercased brand list, lowercased
/// model brand/name plus merged `slicerProfileNames` synonyms.
fn prepare_sp_data(raw: &Value) -> (Vec<String>, Vec<CatalogueModel>) {
    let sp_brands = raw
        .get("brands")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str()).map(|s| s.to_lowercase()).collect())
        .unwrap_or_default();

    let sp_models = raw
        .get("models")
        .and_then(|v| v.as_array())
        .map(|models| {
            models
                .iter()
                .filter_map(|m| {
                    let id = m.get("id")?.as_u64()?;
                    let brand = m.get("brand")?.as_str()?.to_lowercase();
                    let name = m.get("name")?.as_str()?.to_lowercase();
                    let slicer_profile_names = m
                        .get("slicerProfileNames")
                        .and_then(|v| v.as_array())
                        .map(|a| a.iter().filter_map(|v| v.as_str()).map(|s| s.to_lowercase()).collect())
                        .unwrap_or_default();
                    Some(CatalogueModel { id, brand, name, slicer_profile_names })
                })
                .collect()
        })
        .unwrap_or_default();

    (sp_brands, sp_models)
}

pub fn map_printer_models(index: &ProfileIndex, sp_data: &Value, slicers: Option<&[SlicerType]>) -> ModelMap {
    let (sp_brands, sp_models) = prepare_sp_data(sp_data);
    let sp_brand_set: HashSet<&str> = sp_brands.iter().map(|s| s.as_str()).collect();
    let mut result = ModelMap::default();
    let slicers = slicers.unwrap_or(MAPPING_SLICERS);

    for &slicer in slicers {
        let machine_models = index.find_by_type(slicer, ProfileType::MachineModel, None, None);
        if machine_models.is_empty() {
            continue;
        }

        for profile in &machine_models {
            let name = profile.get_latest("name").and_then(|v| v.as_str()).unwrap_or(&profile.name);
            let vendor = &profile.vendor;

            let ids = matching::match_printer_model(&sp_models, slicer, vendor, name);

            if !ids.is_empty() {
                let profile_key = format!("{vendor}/{}", profile.name);
                for model_id in ids {
                    result
                        .model_to_profiles
                        .entry(model_id)
                        .or_default()
                        .entry(slicer.value().to_string())
                        .or_default()
                        .push(profile_key.clone());
                }
            } else {
                let normalized = brands::normalize_brand(slicer, vendor);
                if !sp_brand_set.contains(normalized.as_str()) {
                    result.failed_brands.insert(vendor.clone());
                } else {
                    result.failed_models.insert(format!("{vendor}/{name}"));
                }
            }
        }

        build_variant_map(index, slicer, &mut result);
    }

    result
}

fn build_variant_map(index: &ProfileIndex, slicer: SlicerType, result: &mut ModelMap) {
    let slicer_val = slicer.value().to_string();
    let entry = result.variant_map.entry(slicer_val.clone()).or_default();

    for profile in index.find_by_type(slicer, ProfileType::Machine, None, None) {
        let data = evaluate_stable(profile);

        let Some(printer_model) = get_str(&data, "printer_model") else { continue };

        let variant = match data.get("printer_variant") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(a)) => a.first().map(value_to_string),
            None | Some(Value::Null) => match data.get("nozzle_diameter") {
                Some(Value::Array(a)) => a.first().map(value_to_string),
                Some(Value::String(s)) => Some(if s.contains(';') { s.split(';').next().unwrap().trim().to_string() } else { s.clone() }),
                _ => None,
            },
            _ => None,
        };
        let Some(variant) = variant else { continue };

        let ptype = get_str(&data, "type").unwrap_or("machine");
        if ptype != "machine" {
            continue;
        }

        let lookup_key = format!("{printer_model}{variant}");
        let profile_name = get_name_or(&data, &profile.name).to_string();

        entry.insert(lookup_key, VariantEntry { name: profile_name.clone(), data: data.clone() });

        if let Some(model_id) = get_str(&data, "model_id") {
            if model_id != printer_model {
                let alt_key = format!("{model_id}{variant}");
                entry.entry(alt_key).or_insert(VariantEntry { name: profile_name, data });
            }
        }
    }
}

fn lookup_variant<'a>(
    variant_lookup: &'a HashMap<String, VariantEntry>,
    model_name: &str,
    model_id: Option<&str>,
    variant: &str,
) -> Option<&'a VariantEntry> {
    let direct_key = format!("{model_name}{variant}");
    if let Some(v) = variant_lookup.get(&direct_key) {
        return Some(v);
    }
    if let Some(model_id) = model_id {
        let alt_key = format!("{model_id}{variant}");
        if let Some(v) = variant_lookup.get(&alt_key) {
            return Some(v);
        }
    }
    let nozzle_name = format!("{model_name} {variant} nozzle");
    variant_lookup.values().find(|item| item.name == nozzle_name)
}

#[derive(Debug, Clone, Serialize)]
pub struct FilamentEntry {
    pub name: String,
    pub compatible_printers: IndexMap<String, Vec<String>>,
    pub data: IndexMap<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filament_db_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generic_id: Option<String>,
}

pub fn map_filament_profiles(
    index: &ProfileIndex,
    model_map: &ModelMap,
    ofd_index: Option<&OfdFilamentIndex>,
) -> HashMap<u64, HashMap<String, Vec<FilamentEntry>>> {
    let mut output: HashMap<u64, HashMap<String, Vec<FilamentEntry>>> = HashMap::new();

    let active_slicers: HashSet<SlicerType> = model_map
        .model_to_profiles
        .values()
        .flat_map(|m| m.keys())
        .filter_map(|s| SlicerType::parse(s))
        .collect();
    let active: Vec<SlicerType> = active_slicers.into_iter().collect();
    let generic_profiles = build_generic_profile_index(index, Some(&active));

    for (&model_id, slicer_profiles) in &model_map.model_to_profiles {
        for (slicer_val, profile_keys) in slicer_profiles {
            let Some(slicer) = SlicerType::parse(slicer_val) else { continue };
            let mut compatible_filaments: IndexMap<String, Vec<FilamentEntry>> = IndexMap::new();

            for profile_key in profile_keys {
                let Some((vendor, name)) = profile_key.split_once('/') else { continue };
                let mm_profiles = index.find_by_type(slicer, ProfileType::MachineModel, Some(vendor), Some(name));
                let Some(mm) = mm_profiles.first() else { continue };
                let mm_data = evaluate_stable(mm);
                let model_name = get_name_or(&mm_data, name).to_string();
                let model_id_str = get_str(&mm_data, "model_id").map(|s| s.to_string());

                let variants = split_variants(&mm_data);
                let variant_lookup = model_map.variant_map.get(slicer_val).cloned().unwrap_or_default();

                for variant in &variants {
                    let Some(lookup) = lookup_variant(&variant_lookup, &model_name, model_id_str.as_deref(), variant) else { continue };
                    let printer_name = get_name_or(&lookup.data, &lookup.name).to_string();

                    for fp in index.find_by_type(slicer, ProfileType::Filament, Some(vendor), None) {
                        let fp_data = evaluate_stable(fp);
                        let filament_name = get_name_or(&fp_data, &fp.name).to_string();
                        let filament_type = match fp_data.get("filament_type") {
                            Some(Value::Array(a)) => a.first().map(value_to_string).unwrap_or_default(),
                            Some(v) => value_to_string(v),
                            None => String::new(),
                        };

                        let compat = split_compat(&fp_data);
                        let is_compatible = if compat.contains(&printer_name) {
                            true
                        } else if let Some(cond) = get_str(&fp_data, "compatible_printers_condition") {
                            !cond.is_empty() && condition::evaluate(cond, slicer, &to_config_map(&lookup.data), None).unwrap_or(false)
                        } else {
                            false
                        };
                        if !is_compatible {
                            continue;
                        }

                        let filament_db_id = ofd_index
                            .and_then(|ofd| ofd.resolve_path(&filament_type, &filament_name, slicer_val, fp.filament_id.as_deref()))
                            .map(|s| s.to_string());

                        let entries = compatible_filaments.entry(filament_name.clone()).or_default();
                        let existing = entries.iter_mut().find(|e| e.data == fp_data);

                        match existing {
                            Some(entry) => {
                                let cp = entry.compatible_printers.entry(model_name.clone()).or_default();
                                if !cp.contains(variant) {
                                    cp.push(variant.clone());
                                }
                                if let Some(id) = &filament_db_id {
                                    if !entry.filament_db_ids.contains(id) {
                                        entry.filament_db_ids.push(id.clone());
                                    }
                                }
                            }
                            None => {
                                let mut compatible_printers = IndexMap::new();
                                compatible_printers.insert(model_name.clone(), vec![variant.clone()]);
                                let gid = generic_profiles
                                    .get(&slicer)
                                    .and_then(|g| resolve_generic_id(g, &filament_type, &filament_name));
                                entries.push(FilamentEntry {
                                    name: filament_name.clone(),
                                    compatible_printers,
                                    data: fp_data,
                                    filament_db_ids: filament_db_id.into_iter().collect(),
                                    generic_id: gid,
                                });
                            }
                        }
                    }
                }
            }

            if !compatible_filaments.is_empty() {
                let flat: Vec<FilamentEntry> = compatible_filaments.into_values().flatten().collect();
                output.entry(model_id).or_default().insert(slicer_val.clone(), flat);
            }
        }
    }

    output
}

#[derive(Debug, Clone, Serialize)]
pub struct PrintEntry {
    pub name: String,
    pub compatible_printers: IndexMap<String, Vec<String>>,
    pub data: IndexMap<String, Value>,
}

pub fn map_print_profiles(index: &ProfileIndex, model_map: &ModelMap) -> HashMap<u64, HashMap<String, Vec<PrintEntry>>> {
    let mut output: HashMap<u64, HashMap<String, Vec<PrintEntry>>> = HashMap::new();

    for (&model_id, slicer_profiles) in &model_map.model_to_profiles {
        for (slicer_val, profile_keys) in slicer_profiles {
            let Some(slicer) = SlicerType::parse(slicer_val) else { continue };
            let mut compatible_prints: IndexMap<String, PrintEntry> = IndexMap::new();

            for profile_key in profile_keys {
                let Some((vendor, name)) = profile_key.split_once('/') else { continue };
                let mm_profiles = index.find_by_type(slicer, ProfileType::MachineModel, Some(vendor), Some(name));
                let Some(mm) = mm_profiles.first() else { continue };
                let mm_data = evaluate_stable(mm);
                let model_name = get_name_or(&mm_data, name).to_string();
                let model_id_str = get_str(&mm_data, "model_id").map(|s| s.to_string());

                let variants = split_variants(&mm_data);
                let variant_lookup = model_map.variant_map.get(slicer_val).cloned().unwrap_or_default();
                let print_profiles = index.find_by_type(slicer, ProfileType::Print, Some(vendor), None);

                for variant in &variants {
                    let Some(lookup) = lookup_variant(&variant_lookup, &model_name, model_id_str.as_deref(), variant) else { continue };
                    let mut printer_name = get_name_or(&lookup.data, &lookup.name).to_string();
                    if slicer == SlicerType::PrusaSlicer {
                        if let Some(ps_id) = get_str(&lookup.data, "printer_settings_id") {
                            printer_name = ps_id.to_string();
                        }
                    }

                    for pp in &print_profiles {
                        let pp_data = evaluate_stable(pp);
                        let print_name = get_str(&pp_data, "name")
                            .or_else(|| get_str(&pp_data, "print_settings_id"))
                            .unwrap_or(&pp.name)
                            .to_string();

                        let compat = split_compat(&pp_data);
                        let is_compatible = if compat.contains(&printer_name) {
                            true
                        } else if let Some(cond) = get_str(&pp_data, "compatible_printers_condition") {
                            !cond.is_empty() && condition::evaluate(cond, slicer, &to_config_map(&lookup.data), None).unwrap_or(false)
                        } else {
                            false
                        };
                        if !is_compatible {
                            continue;
                        }

                        let out = compatible_prints.entry(print_name.clone()).or_insert_with(|| PrintEntry {
                            name: print_name.clone(),
                            compatible_printers: IndexMap::new(),
                            data: pp_data,
                        });
                        let cp = out.compatible_printers.entry(model_name.clone()).or_default();
                        if !cp.contains(variant) {
                            cp.push(variant.clone());
                        }
                    }
                }
            }

            if !compatible_prints.is_empty() {
                output.entry(model_id).or_default().insert(slicer_val.clone(), compatible_prints.into_values().collect());
            }
        }
    }

    output
}

fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<(), MappingError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut bytes = serde_json::to_vec_pretty(data)?;
    bytes.push(b'\n');
    std::fs::write(path, bytes)?;
    Ok(())
}

fn copy_assets(mm_data: &mut IndexMap<String, Value>, store: &ProfileStore, slicer: SlicerType) {
    let resource_dir = store.root.join(slicer.value()).join("_resources");
    if !resource_dir.exists() {
        return;
    }
    let Ok(rs) = ResourceStore::open(resource_dir) else { return };
    let Some(name) = get_str(mm_data, "name").map(|s| s.to_string()) else { return };

    for suffix in ["_cover.png", "_thumbnail.png"] {
        let ref_name = format!("{name}{suffix}");
        if let Some((hash, _)) = rs.manifest().iter().find(|(_, meta)| meta.filename == ref_name) {
            let key = suffix.replace('.', "_").trim_start_matches('_').to_string();
            mm_data.insert(key, Value::String(format!("sha256:{hash}")));
        }
    }
}

pub fn export_output(
    model_map: &ModelMap,
    filament_map: &HashMap<u64, HashMap<String, Vec<FilamentEntry>>>,
    print_map: &HashMap<u64, HashMap<String, Vec<PrintEntry>>>,
    store: &ProfileStore,
    index: &ProfileIndex,
    output_dir: &Path,
    ofd_index: Option<&OfdFilamentIndex>,
) -> Result<(), MappingError> {
    let models_dir = output_dir.join("models");
    let brands_dir = output_dir.join("brands");

    if output_dir.exists() {
        std::fs::remove_dir_all(output_dir)?;
    }

    for (&model_id, slicer_profiles) in &model_map.model_to_profiles {
        for (slicer_val, profile_keys) in slicer_profiles {
            let Some(slicer) = SlicerType::parse(slicer_val) else { continue };
            let slicer_path = models_dir.join(model_id.to_string()).join(slicer_val);
            std::fs::create_dir_all(&slicer_path)?;

            let mut machine_profiles_data = Vec::new();

            for profile_key in profile_keys {
                let Some((vendor, name)) = profile_key.split_once('/') else { continue };
                let mm_profiles = index.find_by_type(slicer, ProfileType::MachineModel, Some(vendor), Some(name));
                let Some(mm) = mm_profiles.first() else { continue };
                let mut mm_data = evaluate_stable(mm);
                copy_assets(&mut mm_data, store, slicer);

                let model_name_key = get_name_or(&mm_data, name).to_string();
                let model_id_str = get_str(&mm_data, "model_id").map(|s| s.to_string());
                let variants = split_variants(&mm_data);
                let variant_lookup = model_map.variant_map.get(slicer_val).cloned().unwrap_or_default();

                let mut variant_out: IndexMap<String, VariantOut> = IndexMap::new();
                for variant in &variants {
                    if let Some(v) = lookup_variant(&variant_lookup, &model_name_key, model_id_str.as_deref(), variant) {
                        variant_out.insert(variant.clone(), VariantOut { name: v.name.clone(), data: v.data.clone() });
                    }
                }

                machine_profiles_data.push(MachineProfileOut {
                    vendor: vendor.to_string(),
                    machine_model: mm_data,
                    variants: variant_out,
                });
            }

            write_json(&slicer_path.join("machine_profiles.json"), &machine_profiles_data)?;

            if let Some(fil_data) = filament_map.get(&model_id).and_then(|m| m.get(slicer_val)) {
                write_json(&slicer_path.join("filament_profiles.json"), fil_data)?;
            }
            if let Some(prt_data) = print_map.get(&model_id).and_then(|m| m.get(slicer_val)) {
                write_json(&slicer_path.join("print_profiles.json"), prt_data)?;
            }
        }
    }

    export_generic_filaments(store, index, model_map, &brands_dir, ofd_index)?;

    let mut sorted_map: Vec<_> = model_map.model_to_profiles.iter().collect();
    sorted_map.sort_by_key(|(id, _)| **id);
    let sorted_map: IndexMap<String, &HashMap<String, Vec<String>>> =
        sorted_map.into_iter().map(|(id, v)| (id.to_string(), v)).collect();
    write_json(&output_dir.join("profile_map_out.json"), &sorted_map)?;

    if let Some(ofd) = ofd_index {
        let filament_map_data = ofd.build_filament_map();
        write_json(&output_dir.join("ofd_filament_map.json"), &filament_map_data)?;
        tracing::info!(slicers = filament_map_data.len(), "wrote ofd_filament_map.json");
    }

    write_resource_manifest(store, output_dir)?;

    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct VariantOut {
    name: String,
    data: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
struct MachineProfileOut {
    vendor: String,
    machine_model: IndexMap<String, Value>,
    variants: IndexMap<String, VariantOut>,
}

#[derive(Debug, Clone, Serialize)]
struct GenericFilamentOut {
    name: String,
    data: IndexMap<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    filament_db_ids: Vec<String>,
}

fn export_generic_filaments(
    store: &ProfileStore,
    index: &ProfileIndex,
    model_map: &ModelMap,
    brands_dir: &Path,
    ofd_index: Option<&OfdFilamentIndex>,
) -> Result<(), MappingError> {
    let _ = store;
    let mut vendors_per_slicer: HashMap<String, HashSet<String>> = HashMap::new();
    for slicer_profiles in model_map.model_to_profiles.values() {
        for (slicer_val, profile_keys) in slicer_profiles {
            for pk in profile_keys {
                if let Some((vendor, _)) = pk.split_once('/') {
                    vendors_per_slicer.entry(slicer_val.clone()).or_default().insert(vendor.to_string());
                }
            }
        }
    }

    for (slicer_val, vendors) in vendors_per_slicer {
        let Some(slicer) = SlicerType::parse(&slicer_val) else { continue };
        for vendor in vendors {
            let filament_profiles = index.find_by_type(slicer, ProfileType::Filament, Some(&vendor), None);
            if filament_profiles.is_empty() {
                continue;
            }

            let mut generic_data = Vec::new();
            for fp in &filament_profiles {
                let fp_data = evaluate_stable(fp);
                if is_profile_model_specific(slicer, fp, None) {
                    continue;
                }
                let Some(name) = get_str(&fp_data, "name").or_else(|| get_str(&fp_data, "filament_settings_id")) else { continue };
                let name = name.to_string();
                let filament_type = match fp_data.get("filament_type") {
                    Some(Value::Array(a)) => a.first().map(value_to_string).unwrap_or_default(),
                    Some(v) => value_to_string(v),
                    None => String::new(),
                };
                let filament_db_id = ofd_index
                    .and_then(|ofd| ofd.resolve_path(&filament_type, &name, &slicer_val, fp.filament_id.as_deref()))
                    .map(|s| s.to_string());

                generic_data.push(GenericFilamentOut {
                    name,
                    data: fp_data,
                    filament_db_ids: filament_db_id.into_iter().collect(),
                });
            }

            if !generic_data.is_empty() {
                let out_path = brands_dir.join(&slicer_val).join(&vendor);
                write_json(&out_path.join("generic_filament_profiles.json"), &generic_data)?;
            }
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct ResourceManifestEntry {
    path: String,
    filename: String,
    size: u64,
    #[serde(rename = "type")]
    kind: String,
}

fn write_resource_manifest(store: &ProfileStore, output_dir: &Path) -> Result<(), MappingError> {
    let mut manifest: IndexMap<String, ResourceManifestEntry> = IndexMap::new();

    for &slicer in MAPPING_SLICERS {
        let resource_dir = store.root.join(slicer.value()).join("_resources");
        if !resource_dir.exists() {
            continue;
        }
        let Ok(rs) = ResourceStore::open(resource_dir) else { continue };
        for (hash, meta) in rs.manifest() {
            let ref_key = format!("sha256:{hash}");
            if manifest.contains_key(&ref_key) {
                continue;
            }
            let suffix = if meta.kind.is_empty() { String::new() } else { format!(".{}", meta.kind) };
            let rel_path = format!("profiles/{}/_resources/{hash}{suffix}", slicer.value());
            manifest.insert(
                ref_key,
                ResourceManifestEntry { path: rel_path, filename: meta.filename.clone(), size: meta.size, kind: meta.kind.clone() },
            );
        }
    }

    tracing::info!(entries = manifest.len(), "wrote resources.json");
    write_json(&output_dir.join("resources.json"), &manifest)
}

/// Fetch SimplyPrint model data, match printer models, resolve filament and
/// print profile compatibility, and export everything to `output_dir`.
pub async fn run_mapping_pipeline(
    store: &ProfileStore,
    output_dir: &Path,
    slicers: Option<&[SlicerType]>,
    ofd_path: Option<&Path>,
    api_url: &str,
) -> Result<ModelMap, MappingError> {
    let index = ProfileIndex::build(store, slicers.or(Some(MAPPING_SLICERS)))?;
    let target_slicers = slicers.unwrap_or(MAPPING_SLICERS);

    let ofd_index = match ofd_path {
        Some(path) => {
            tracing::info!(?path, "loading OFD data");
            let repo = crate::reconciler::OfdRepo::load(path).map_err(|e| match e {
                crate::error::ReconcileError::Io { path, source } => MappingError::Io(std::io::Error::new(source.kind(), path.display().to_string())),
                crate::error::ReconcileError::Corrupt { source, .. } => MappingError::Json(source),
            })?;
            Some(OfdFilamentIndex::build(repo))
        }
        None => None,
    };

    tracing::info!("fetching SimplyPrint model data");
    let sp_data = fetch_sp_model_data(api_url).await?;

    tracing::info!("mapping printer models");
    let model_map = map_printer_models(&index, &sp_data, Some(target_slicers));
    tracing::info!(
        models = model_map.model_to_profiles.len(),
        failed_brands = model_map.failed_brands.len(),
        failed_models = model_map.failed_models.len(),
        "mapped SimplyPrint models"
    );

    tracing::info!("mapping filament profiles");
    let filament_map = map_filament_profiles(&index, &model_map, ofd_index.as_ref());

    tracing::info!("mapping print profiles");
    let print_map = map_print_profiles(&index, &model_map);

    tracing::info!(?output_dir, "exporting");
    export_output(&model_map, &filament_map, &print_map, store, &index, output_dir, ofd_index.as_ref())?;

    Ok(model_map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_version_falls_back_to_last_seen_when_no_stable_key_exists() {
        let profile = StoredProfile::new(SlicerType::BambuStudio, ProfileType::Filament, "x".into(), "BBL".into(), "nightly-2024-01-01");
        assert_eq!(stable_version(&profile), "nightly-2024-01-01");
    }

    #[test]
    fn prepare_sp_data_lowercases_brand_and_model_fields() {
        let raw = serde_json::json!({
            "brands": ["Bambu Lab"],
            "models": [{"id": 1, "brand": "Bambu Lab", "name": "X1 Carbon", "slicerProfileNames": ["X1C"]}],
        });
        let (brands, models) = prepare_sp_data(&raw);
        assert_eq!(brands, vec!["bambu lab".to_string()]);
        assert_eq!(models[0].brand, "bambu lab");
        assert_eq!(models[0].slicer_profile_names, vec!["x1c".to_string()]);
    }
}
