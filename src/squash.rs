//! INI-bundle splitter and slic3r-JSON inheritance squasher (§4.E). Grounded
//! in `original_source/squash.py`.

use crate::error::SquashError;
use crate::ini::{self, IniDocument};
use crate::model::ProfileType;
use crate::version::version_key;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

const SECTION_PREFIXES: &[(&str, ProfileType)] = &[
    ("filament", ProfileType::Filament),
    ("printer_model", ProfileType::MachineModel),
    ("printer", ProfileType::Machine),
    ("print", ProfileType::Print),
];

fn settings_id_key(profile_type: ProfileType) -> &'static str {
    match profile_type {
        ProfileType::Filament => "filament_settings_id",
        ProfileType::Machine => "printer_settings_id",
        ProfileType::MachineModel => "name",
        ProfileType::Print => "print_settings_id",
    }
}

fn section_type(name: &str) -> Option<(ProfileType, String)> {
    for (prefix, pt) in SECTION_PREFIXES {
        if let Some(rest) = name.strip_prefix(&format!("{prefix}:")) {
            return Some((*pt, rest.to_string()));
        }
    }
    None
}

fn sanitize_filename(name: &str) -> String {
    name.replace('/', " ")
}

/// Flatten one named section's `inherits` chain within a document, memoized.
fn resolve_ini_section<'a>(
    doc: &'a IniDocument,
    profile_type: ProfileType,
    name: &str,
    cache: &mut HashMap<String, IndexMap<String, String>>,
    stack: &mut Vec<String>,
) -> Result<IndexMap<String, String>, SquashError> {
    let cache_key = format!("{}:{}", profile_type.value(), name);
    if let Some(cached) = cache.get(&cache_key) {
        return Ok(cached.clone());
    }
    if stack.contains(&cache_key) {
        return Err(SquashError::CyclicInherits { profile: name.to_string() });
    }
    stack.push(cache_key.clone());

    let prefix = match profile_type {
        ProfileType::Filament => "filament",
        ProfileType::MachineModel => "printer_model",
        ProfileType::Machine => "printer",
        ProfileType::Print => "print",
    };
    let section_name = format!("{prefix}:{name}");
    let section = doc
        .sections
        .iter()
        .find(|s| s.name == section_name)
        .ok_or_else(|| SquashError::UnresolvedInherits { profile: name.to_string(), target: section_name.clone() })?;

    let mut flattened = IndexMap::new();
    if let Some(inherits) = section.entries.get("inherits") {
        for parent in inherits.split(';').map(|p| p.trim()).filter(|p| !p.is_empty()) {
            let parent_flat = resolve_ini_section(doc, profile_type, parent, cache, stack)?;
            for (k, v) in parent_flat {
                flattened.insert(k, v);
            }
        }
    }
    for (k, v) in &section.entries {
        if k == "inherits" {
            continue;
        }
        flattened.insert(k.clone(), v.clone());
    }

    stack.pop();
    cache.insert(cache_key, flattened.clone());
    Ok(flattened)
}

/// Split one PrusaSlicer/SuperSlicer INI bundle into per-profile JSON files
/// under `output_dir/{vendor}/{type}/{name}.json`. `section_types`, when
/// given, restricts output to those profile types (every type is still
/// loaded for inheritance resolution within that type group).
pub fn split_prusaslicer_bundle(
    bundle_path: &Path,
    vendor: &str,
    output_dir: &Path,
    section_types: Option<&[ProfileType]>,
) -> Result<usize, SquashError> {
    let doc = ini::load(bundle_path)?;
    let mut cache = HashMap::new();
    let mut written = 0;

    for section in &doc.sections {
        let Some((profile_type, name)) = section_type(&section.name) else { continue };
        if name.starts_with('*') {
            continue;
        }
        if let Some(filter) = section_types {
            if !filter.contains(&profile_type) {
                continue;
            }
        }

        let mut stack = Vec::new();
        let mut flattened = resolve_ini_section(&doc, profile_type, &name, &mut cache, &mut stack)?;
        let id_key = settings_id_key(profile_type);
        if id_key != "name" {
            flattened.insert(id_key.to_string(), name.clone());
        }
        flattened.insert("name".to_string(), name.clone());

        let settings: IndexMap<String, Value> =
            flattened.into_iter().map(|(k, v)| (k, Value::String(v))).collect();

        let dest_dir = output_dir.join(vendor).join(profile_type.value());
        std::fs::create_dir_all(&dest_dir).map_err(SquashError::Io)?;
        let dest = dest_dir.join(format!("{}.json", sanitize_filename(&name)));
        let bytes = serde_json::to_vec_pretty(&settings).expect("IndexMap<String,Value> always serializes");
        std::fs::write(&dest, bytes).map_err(SquashError::Io)?;
        written += 1;
    }

    Ok(written)
}

fn load_json_profiles(dir: &Path) -> HashMap<String, IndexMap<String, Value>> {
    let mut out = HashMap::new();
    let Ok(entries) = std::fs::read_dir(dir) else { return out };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(bytes) = std::fs::read(&path) else { continue };
        let Ok(profile) = serde_json::from_slice::<IndexMap<String, Value>>(&bytes) else { continue };
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
        out.insert(stem, profile);
    }
    out
}

fn apply_includes(profiles: &mut HashMap<String, IndexMap<String, Value>>) {
    let keys: Vec<String> = profiles.keys().cloned().collect();
    for key in keys {
        let include_names: Vec<String> = profiles
            .get(&key)
            .and_then(|p| p.get("include"))
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect())
            .unwrap_or_default();
        if include_names.is_empty() {
            continue;
        }

        let mut additions: Vec<(String, Value)> = Vec::new();
        for included_name in &include_names {
            let Some(included) = profiles.get(included_name) else { continue };
            for (k, v) in included {
                if k == "name" || k == "instantiation" {
                    continue;
                }
                let already_has = profiles.get(&key).map(|p| p.contains_key(k)).unwrap_or(false);
                if !already_has {
                    additions.push((k.clone(), v.clone()));
                }
            }
        }

        if let Some(p) = profiles.get_mut(&key) {
            for (k, v) in additions {
                p.entry(k).or_insert(v);
            }
            p.shift_remove("include");
        }
    }
}

fn resolve_slic3r_inherits<'a>(
    name: &str,
    profiles: &'a HashMap<String, IndexMap<String, Value>>,
    cache: &mut HashMap<String, IndexMap<String, Value>>,
    stack: &mut Vec<String>,
) -> Option<IndexMap<String, Value>> {
    if let Some(cached) = cache.get(name) {
        return Some(cached.clone());
    }
    if stack.contains(&name.to_string()) {
        return None;
    }
    let raw = profiles.get(name)?;
    stack.push(name.to_string());

    let mut flattened = IndexMap::new();
    if let Some(parent_name) = raw.get("inherits").and_then(|v| v.as_str()) {
        if let Some(parent_flat) = resolve_slic3r_inherits(parent_name, profiles, cache, stack) {
            for (k, v) in parent_flat {
                flattened.insert(k, v);
            }
        }
    }
    for (k, v) in raw {
        if k == "inherits" {
            continue;
        }
        flattened.insert(k.clone(), v.clone());
    }

    stack.pop();
    cache.insert(name.to_string(), flattened.clone());
    Some(flattened)
}

/// Squash one vendor's slic3r-JSON profiles (BambuStudio/OrcaSlicer/
/// ElegooSlicer flavor), optionally merging a shared filament-library
/// directory as an inheritance base, rewriting the vendor directory in
/// place with only instantiable profiles.
pub fn squash_slic3r_profiles(
    vendor_dir: &Path,
    library_dir: Option<&Path>,
    profile_type_filter: Option<&[ProfileType]>,
) -> Result<usize, SquashError> {
    let mut profiles = HashMap::new();
    if let Some(lib) = library_dir {
        profiles.extend(load_json_profiles(lib));
    }
    // Vendor profiles override library profiles of the same name.
    for (name, profile) in load_json_profiles(vendor_dir) {
        profiles.insert(name, profile);
    }

    apply_includes(&mut profiles);

    let mut cache = HashMap::new();
    let names: Vec<String> = profiles.keys().cloned().collect();
    let mut flattened_all = HashMap::new();
    for name in &names {
        let mut stack = Vec::new();
        if let Some(flat) = resolve_slic3r_inherits(name, &profiles, &mut cache, &mut stack) {
            flattened_all.insert(name.clone(), flat);
        }
    }

    std::fs::remove_dir_all(vendor_dir).map_err(SquashError::Io)?;
    std::fs::create_dir_all(vendor_dir).map_err(SquashError::Io)?;

    let mut written = 0;
    for (name, flat) in &flattened_all {
        let raw_type = flat.get("type").and_then(|v| v.as_str());
        let instantiation = flat.get("instantiation").and_then(|v| v.as_str());
        let instantiable = raw_type == Some("machine_model") || instantiation == Some("true");
        if !instantiable {
            continue;
        }

        let profile_type = match raw_type.and_then(ProfileType::parse) {
            Some(pt) => pt,
            None => ProfileType::Filament,
        };
        if let Some(filter) = profile_type_filter {
            if !filter.contains(&profile_type) {
                continue;
            }
        }

        let type_dir = vendor_dir.join(profile_type.value());
        std::fs::create_dir_all(&type_dir).map_err(SquashError::Io)?;
        let dest = type_dir.join(format!("{}.json", sanitize_filename(name)));
        let bytes = serde_json::to_vec_pretty(flat).expect("IndexMap<String,Value> always serializes");
        std::fs::write(&dest, bytes).map_err(SquashError::Io)?;
        written += 1;
    }

    Ok(written)
}

static VERSIONED_FILE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^([\d]+(?:\.[\d]+)+)\.ini$").unwrap());

/// Find the highest-version `{version}.ini` file directly inside `vendor_dir`.
pub fn select_latest_ini_bundle(vendor_dir: &Path) -> Option<(String, PathBuf)> {
    let entries = std::fs::read_dir(vendor_dir).ok()?;
    let mut best: Option<(String, PathBuf)> = None;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(filename) = path.file_name().and_then(|f| f.to_str()) else { continue };
        let Some(caps) = VERSIONED_FILE_RE.captures(filename) else { continue };
        let version = caps[1].to_string();
        let replace = match &best {
            None => true,
            Some((bver, _)) => version_key(&version) > version_key(bver),
        };
        if replace {
            best = Some((version, path));
        }
    }
    best
}

/// Move root-level `{VendorName}.ini` files into `{VendorName}/` subdirectories,
/// normalizing flat-layout repos (slic3r-profiles/SuperSlicer) to look like the
/// versioned PrusaSlicer layout where every INI lives inside a vendor dir.
fn relocate_flat_inis(directory: &Path) -> Result<(), SquashError> {
    let Ok(entries) = std::fs::read_dir(directory) else { return Ok(()) };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("ini") {
            continue;
        }
        let Some(vendor_name) = path.file_stem().and_then(|s| s.to_str()) else { continue };
        let vendor_dir = directory.join(vendor_name);
        std::fs::create_dir_all(&vendor_dir).map_err(SquashError::Io)?;
        let dest = vendor_dir.join(path.file_name().expect("read_dir entries always have a file name"));
        std::fs::rename(&path, &dest).map_err(SquashError::Io)?;
    }
    Ok(())
}

static CONFIG_VERSION_LINE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?m)^\s*config_version\s*=\s*(.+)").unwrap());
static NUMERIC_VERSION_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"([\d]+(?:\.[\d]+)+)").unwrap());

/// Read `config_version` directly out of an INI file's text, tolerant of
/// section-less or otherwise malformed bundles (flat-layout vendor INIs).
fn read_config_version_text(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let captured = CONFIG_VERSION_LINE_RE.captures(&text)?.get(1)?.as_str().to_string();
    NUMERIC_VERSION_RE.captures(&captured).map(|c| c[1].to_string())
}

/// Find and unpack all INI bundles under a PrusaSlicer-family profiles root.
/// Handles both the versioned (PrusaSlicer, `{version}.ini` per vendor dir)
/// and flat (slic3r-profiles/SuperSlicer, root-level `{VendorName}.ini`)
/// layouts. Returns every created JSON path plus the highest version string
/// detected across all vendors (from filenames, or from `config_version` for
/// flat-layout vendors).
pub fn unpack_prusaslicer_bundles(
    prusaslicer_dir: &Path,
    section_types: Option<&[ProfileType]>,
) -> Result<(Vec<PathBuf>, Option<String>), SquashError> {
    if !prusaslicer_dir.exists() {
        return Ok((Vec::new(), None));
    }

    relocate_flat_inis(prusaslicer_dir)?;

    let mut all_created = Vec::new();
    let mut detected_version: Option<String> = None;
    let mut detected_version_key: Vec<i64> = Vec::new();

    for entry in std::fs::read_dir(prusaslicer_dir).map_err(SquashError::Io)? {
        let vendor_dir = entry.map_err(SquashError::Io)?.path();
        if !vendor_dir.is_dir() {
            continue;
        }

        let latest_ini = match select_latest_ini_bundle(&vendor_dir) {
            Some((version, path)) => {
                let vk = version_key(&version);
                if vk > detected_version_key {
                    detected_version_key = vk;
                    detected_version = Some(version);
                }
                path
            }
            None => {
                let Ok(dir_entries) = std::fs::read_dir(&vendor_dir) else { continue };
                let vendor_ini = dir_entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .find(|p| p.extension().and_then(|e| e.to_str()) == Some("ini"));
                let Some(vendor_ini) = vendor_ini else { continue };
                if let Some(cv) = read_config_version_text(&vendor_ini) {
                    let vk = version_key(&cv);
                    if vk > detected_version_key {
                        detected_version_key = vk;
                        detected_version = Some(cv);
                    }
                }
                vendor_ini
            }
        };

        for entry in std::fs::read_dir(&vendor_dir).map_err(SquashError::Io)? {
            let config_file = entry.map_err(SquashError::Io)?.path();
            if config_file.extension().and_then(|e| e.to_str()) == Some("ini") && config_file != latest_ini {
                std::fs::remove_file(&config_file).map_err(SquashError::Io)?;
            }
        }

        // Write directly into the vendor dir (it already names the vendor);
        // an empty vendor segment keeps `split_prusaslicer_bundle`'s
        // `output_dir/{vendor}/{type}/{name}.json` layout from double-nesting.
        split_prusaslicer_bundle(&latest_ini, "", &vendor_dir, section_types)?;
        all_created.push(latest_ini.clone());

        if latest_ini.exists() {
            std::fs::remove_file(&latest_ini).map_err(SquashError::Io)?;
        }
    }

    Ok((all_created, detected_version))
}

/// Squash profiles for every vendor in a slic3r-JSON-based slicer directory
/// (BambuStudio/OrcaSlicer/ElegooSlicer). Handles OrcaSlicer's shared
/// filament-library pattern: the library directory itself is never squashed
/// or exported, only used as an inheritance base for every other vendor.
pub fn squash_all_slic3r_vendors(
    slicer_dir: &Path,
    profile_type_filter: Option<&[ProfileType]>,
    filament_library_name: Option<&str>,
) -> Result<usize, SquashError> {
    if !slicer_dir.exists() {
        return Ok(0);
    }

    let library_dir = filament_library_name.map(|name| slicer_dir.join(name));

    let mut entries: Vec<PathBuf> = std::fs::read_dir(slicer_dir)
        .map_err(SquashError::Io)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();

    let mut written = 0;
    for vendor_dir in entries {
        if !vendor_dir.is_dir() {
            continue;
        }
        if let Some(name) = filament_library_name {
            if vendor_dir.file_name().and_then(|n| n.to_str()) == Some(name) {
                continue;
            }
        }
        written += squash_slic3r_profiles(&vendor_dir, library_dir.as_deref(), profile_type_filter)?;
    }

    Ok(written)
}

/// One version group: every `(vendor, ini_path)` pair observed at that
/// version, across all vendor directories under `slicer_root`.
pub struct VersionGroup {
    pub version: String,
    pub bundles: Vec<(String, PathBuf)>,
}

/// Enumerate every historical INI version under a slicer root, oldest-first,
/// filtered to `>= min_version` when given.
pub fn iter_ini_bundle_versions(slicer_root: &Path, min_version: Option<&str>) -> Vec<VersionGroup> {
    let _ = relocate_flat_inis(slicer_root);
    let mut by_version: HashMap<String, Vec<(String, PathBuf)>> = HashMap::new();

    let Ok(vendor_entries) = std::fs::read_dir(slicer_root) else { return Vec::new() };
    for vendor_entry in vendor_entries.filter_map(|e| e.ok()) {
        let vendor_dir = vendor_entry.path();
        if !vendor_dir.is_dir() {
            continue;
        }
        let vendor_name = vendor_dir.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();

        let Ok(file_entries) = std::fs::read_dir(&vendor_dir) else { continue };
        for file_entry in file_entries.filter_map(|e| e.ok()) {
            let path = file_entry.path();
            let Some(filename) = path.file_name().and_then(|f| f.to_str()) else { continue };
            if let Some(caps) = VERSIONED_FILE_RE.captures(filename) {
                by_version.entry(caps[1].to_string()).or_default().push((vendor_name.clone(), path));
            } else if filename.ends_with(".ini") {
                if let Ok(text) = std::fs::read_to_string(&path) {
                    if let Ok(doc) = ini::parse(&path, &text) {
                        if let Some(version) = ini::read_config_version(&doc) {
                            by_version.entry(version).or_default().push((vendor_name.clone(), path));
                        }
                    }
                }
            }
        }
    }

    let min_key = min_version.map(version_key);
    let mut groups: Vec<VersionGroup> = by_version
        .into_iter()
        .filter(|(v, _)| min_key.as_ref().map(|m| &version_key(v) >= m).unwrap_or(true))
        .map(|(version, bundles)| VersionGroup { version, bundles })
        .collect();
    groups.sort_by(|a, b| version_key(&a.version).cmp(&version_key(&b.version)));
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUNDLE: &str = r#"
[printer_model:MK4]
name = MK4
variants = 0.4

[filament:*common*]
filament_type = PLA

[filament:Prusament PLA]
inherits = *common*
filament_colour = #FF0000
"#;

    #[test]
    fn splits_bundle_and_resolves_inherits_and_skips_templates() {
        let dir = tempfile::tempdir().unwrap();
        let bundle_path = dir.path().join("2.4.0.ini");
        std::fs::write(&bundle_path, BUNDLE).unwrap();

        let out_dir = dir.path().join("out");
        let written = split_prusaslicer_bundle(&bundle_path, "PrusaResearch", &out_dir, None).unwrap();
        assert_eq!(written, 2);

        let filament_path = out_dir.join("PrusaResearch/filament/Prusament PLA.json");
        let data: IndexMap<String, Value> = serde_json::from_slice(&std::fs::read(filament_path).unwrap()).unwrap();
        assert_eq!(data.get("filament_type").unwrap(), "PLA");
        assert_eq!(data.get("filament_colour").unwrap(), "#FF0000");
        assert_eq!(data.get("filament_settings_id").unwrap(), "Prusament PLA");
        assert!(!data.contains_key("inherits"));

        assert!(!out_dir.join("PrusaResearch/filament/*common*.json").exists());
    }

    #[test]
    fn select_latest_picks_highest_version_key() {
        let dir = tempfile::tempdir().unwrap();
        for v in ["1.2.0.ini", "1.10.0.ini", "1.9.0.ini"] {
            std::fs::write(dir.path().join(v), "[printer:x]\n").unwrap();
        }
        let (version, _) = select_latest_ini_bundle(dir.path()).unwrap();
        assert_eq!(version, "1.10.0");
    }

    #[test]
    fn squash_slic3r_keeps_only_instantiable_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let vendor_dir = dir.path().join("BBL");
        std::fs::create_dir_all(&vendor_dir).unwrap();
        std::fs::write(
            vendor_dir.join("base.json"),
            r#"{"type":"filament","instantiation":"false","filament_type":"PLA"}"#,
        )
        .unwrap();
        std::fs::write(
            vendor_dir.join("pla.json"),
            r#"{"type":"filament","instantiation":"true","inherits":"base","name":"Bambu PLA"}"#,
        )
        .unwrap();

        let written = squash_slic3r_profiles(&vendor_dir, None, None).unwrap();
        assert_eq!(written, 1);

        let out = vendor_dir.join("filament/Bambu PLA.json");
        let data: IndexMap<String, Value> = serde_json::from_slice(&std::fs::read(out).unwrap()).unwrap();
        assert_eq!(data.get("filament_type").unwrap(), "PLA");
    }

    #[test]
    fn unpack_handles_versioned_layout_and_deletes_stale_inis() {
        let dir = tempfile::tempdir().unwrap();
        let vendor_dir = dir.path().join("PrusaResearch");
        std::fs::create_dir_all(&vendor_dir).unwrap();
        std::fs::write(vendor_dir.join("2.3.0.ini"), "[printer_model:MK3]\nname = MK3\n").unwrap();
        std::fs::write(vendor_dir.join("2.4.0.ini"), BUNDLE).unwrap();

        let (created, version) = unpack_prusaslicer_bundles(dir.path(), None).unwrap();
        assert_eq!(version.as_deref(), Some("2.4.0"));
        assert_eq!(created.len(), 1);
        assert!(!vendor_dir.join("2.3.0.ini").exists());
        assert!(!vendor_dir.join("2.4.0.ini").exists());
        assert!(vendor_dir.join("filament/Prusament PLA.json").exists());
    }

    #[test]
    fn unpack_relocates_flat_layout_and_reads_config_version() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Creality.ini"),
            "[vendor]\nconfig_version = 1.2.3\n\n[printer_model:Ender3]\nname = Ender3\n",
        )
        .unwrap();

        let (_, version) = unpack_prusaslicer_bundles(dir.path(), None).unwrap();
        assert_eq!(version.as_deref(), Some("1.2.3"));
        assert!(dir.path().join("Creality/printer_model/Ender3.json").exists());
    }

    #[test]
    fn squash_all_vendors_skips_the_shared_library_directory() {
        let dir = tempfile::tempdir().unwrap();
        let library_dir = dir.path().join("OrcaFilamentLibrary");
        std::fs::create_dir_all(&library_dir).unwrap();
        std::fs::write(
            library_dir.join("base.json"),
            r#"{"type":"filament","instantiation":"false","filament_type":"PLA"}"#,
        )
        .unwrap();

        let vendor_dir = dir.path().join("BBL");
        std::fs::create_dir_all(&vendor_dir).unwrap();
        std::fs::write(
            vendor_dir.join("pla.json"),
            r#"{"type":"filament","instantiation":"true","inherits":"base","name":"Bambu PLA"}"#,
        )
        .unwrap();

        let written = squash_all_slic3r_vendors(dir.path(), None, Some("OrcaFilamentLibrary")).unwrap();
        assert_eq!(written, 1);
        assert!(library_dir.join("base.json").exists());
        assert!(vendor_dir.join("filament/Bambu PLA.json").exists());
    }
}
