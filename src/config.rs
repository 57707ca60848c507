//! Source configuration table and compatibility-condition defaults contract
//! (§4.L). Grounded in `original_source/download.py`'s `DEFAULT_CONFIGS`.

use crate::condition::ConfigMap;
use crate::model::{ProfileType, SlicerType};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

/// Per-slicer archive-fetch coordinates. Inert data — consulted by the
/// fetcher (§4.M), never read directly by the core.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub slicer: SlicerType,
    pub github_repo: &'static str,
    pub branch: Option<&'static str>,
    pub profile_path_in_repo: Option<&'static str>,
    pub tag_pattern: Option<&'static str>,
    pub nightly_branch: Option<&'static str>,
    pub min_version: &'static str,
    pub ini_bundle: bool,
    pub filament_library_name: Option<&'static str>,
    pub profile_type_dirs: HashMap<ProfileType, &'static str>,
    pub additional_repos: Vec<&'static str>,
}

impl SourceConfig {
    fn new(slicer: SlicerType, github_repo: &'static str, min_version: &'static str) -> Self {
        SourceConfig {
            slicer,
            github_repo,
            branch: None,
            profile_path_in_repo: None,
            tag_pattern: None,
            nightly_branch: None,
            min_version,
            ini_bundle: false,
            filament_library_name: None,
            profile_type_dirs: HashMap::new(),
            additional_repos: Vec::new(),
        }
    }
}

fn json_profile_dirs() -> HashMap<ProfileType, &'static str> {
    HashMap::from([
        (ProfileType::Filament, "filament"),
        (ProfileType::Machine, "machine"),
        (ProfileType::MachineModel, "machine"),
        (ProfileType::Print, "process"),
    ])
}

pub static DEFAULT_CONFIGS: LazyLock<HashMap<SlicerType, SourceConfig>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    let mut bambu = SourceConfig::new(SlicerType::BambuStudio, "bambulab/BambuStudio", "02.04.00.70");
    bambu.profile_path_in_repo = Some("resources/profiles");
    bambu.tag_pattern = Some(r"^v\d+");
    bambu.nightly_branch = Some("master");
    bambu.profile_type_dirs = json_profile_dirs();
    map.insert(SlicerType::BambuStudio, bambu);

    let mut orca = SourceConfig::new(SlicerType::OrcaSlicer, "SoftFever/OrcaSlicer", "2.2.0");
    orca.profile_path_in_repo = Some("resources/profiles");
    orca.tag_pattern = Some(r"^v\d+");
    orca.filament_library_name = Some("OrcaFilamentLibrary");
    orca.profile_type_dirs = json_profile_dirs();
    map.insert(SlicerType::OrcaSlicer, orca);

    let mut prusa = SourceConfig::new(SlicerType::PrusaSlicer, "prusa3d/PrusaSlicer-settings-prusa-fff", "2.4.0");
    prusa.branch = Some("main");
    prusa.ini_bundle = true;
    prusa.additional_repos = vec!["prusa3d/PrusaSlicer-settings-non-prusa-fff"];
    map.insert(SlicerType::PrusaSlicer, prusa);

    let mut cura = SourceConfig::new(SlicerType::Cura, "Ultimaker/fdm_materials", "0.0.0");
    cura.branch = Some("master");
    cura.additional_repos = vec!["Ultimaker/cura"];
    map.insert(SlicerType::Cura, cura);

    let mut elegoo = SourceConfig::new(SlicerType::ElegooSlicer, "ELEGOO-3D/ElegooSlicer", "1.1.5");
    elegoo.profile_path_in_repo = Some("resources/profiles");
    elegoo.tag_pattern = Some(r"^v\d+");
    elegoo.profile_type_dirs = json_profile_dirs();
    map.insert(SlicerType::ElegooSlicer, elegoo);

    let mut super_slicer = SourceConfig::new(SlicerType::SuperSlicer, "slic3r/slic3r-profiles", "0.1.0");
    super_slicer.branch = Some("main");
    super_slicer.ini_bundle = true;
    map.insert(SlicerType::SuperSlicer, super_slicer);

    map
});

pub fn get_source_config(slicer: SlicerType) -> &'static SourceConfig {
    DEFAULT_CONFIGS.get(&slicer).expect("every SlicerType has a default source config")
}

/// Layered beneath a specific printer's configuration when evaluating §4.G
/// conditions; a caller wiring in a live catalogue feed supplies its own
/// `DefaultsProvider`, keeping the evaluator and mapping pipeline
/// transport-agnostic.
pub type ConditionDefaults = ConfigMap;

pub trait DefaultsProvider {
    fn defaults_for(&self, slicer: SlicerType) -> ConditionDefaults;
}

/// No-op provider used when no live defaults feed is wired in.
pub struct EmptyDefaultsProvider;

impl DefaultsProvider for EmptyDefaultsProvider {
    fn defaults_for(&self, _slicer: SlicerType) -> ConditionDefaults {
        ConditionDefaults::new()
    }
}

/// Reads previously-saved `{root}/{slicer}/defaults.json` files. Falls back
/// to empty defaults for any slicer whose file is missing or unreadable —
/// a missing defaults feed degrades condition evaluation, it doesn't fail it.
pub struct FileDefaultsProvider {
    root: std::path::PathBuf,
}

impl FileDefaultsProvider {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        FileDefaultsProvider { root: root.into() }
    }
}

impl DefaultsProvider for FileDefaultsProvider {
    fn defaults_for(&self, slicer: SlicerType) -> ConditionDefaults {
        load_defaults_from_file(&self.root.join(slicer.value()).join("defaults.json"))
    }
}

const DEFAULTS_SLICERS: &[SlicerType] = &[SlicerType::OrcaSlicer, SlicerType::BambuStudio, SlicerType::PrusaSlicer];

fn slicer_artifact_name(slicer: SlicerType) -> Option<&'static str> {
    match slicer {
        SlicerType::OrcaSlicer => Some("OrcaSlicer"),
        SlicerType::BambuStudio => Some("BambuStudio"),
        SlicerType::PrusaSlicer => Some("PrusaSlicer"),
        _ => None,
    }
}

/// Download one artifact from SimplyPrint's `slicer-builds` repo, at the
/// `slicer-config-artifacts` ref. Any failure (network, missing key,
/// malformed JSON) collapses to an empty object, matching the upstream
/// tool's broad except-and-continue: a defaults feed is an enrichment, not
/// a hard dependency.
async fn get_slicer_config_artifact(artifact_path: &str) -> Value {
    async fn try_fetch(artifact_path: &str) -> Result<Value, reqwest::Error> {
        let client = reqwest::Client::new();
        let listing: Value = client
            .get(format!(
                "https://api.github.com/repos/SimplyPrint/slicer-builds/contents/{artifact_path}?ref=slicer-config-artifacts"
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let Some(download_url) = listing.get("download_url").and_then(|v| v.as_str()) else {
            return Ok(Value::Null);
        };
        client.get(download_url).send().await?.error_for_status()?.json().await
    }

    match try_fetch(artifact_path).await {
        Ok(value) if value.is_object() => value,
        _ => Value::Object(Default::default()),
    }
}

/// Unpack a `machine.json`-shaped option tree (category → optgroup → line)
/// and resolve each referenced option name against `print_config_def.json`'s
/// `default_value` fields. Pure so it can be tested without the network.
fn extract_default_options(printer_data: &Value, config_def_data: &Value) -> HashMap<String, Value> {
    let Some(printer_data) = printer_data.as_object() else { return HashMap::new() };

    let mut options: HashMap<String, Option<Value>> = HashMap::new();
    for page_data in printer_data.values() {
        let Some(page_data) = page_data.as_object() else { continue };
        for optgroup_data in page_data.values() {
            let Some(lines) = optgroup_data.as_array() else { continue };
            for line in lines {
                let names: Vec<String> = if let Some(s) = line.as_str() {
                    vec![s.to_string()]
                } else if let Some(obj) = line.as_object() {
                    obj.get("options")
                        .and_then(|v| v.as_array())
                        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect())
                        .unwrap_or_default()
                } else {
                    continue;
                };
                for name in names {
                    let name = name.strip_suffix("#0").unwrap_or(&name).to_string();
                    options.entry(name).or_insert(None);
                }
            }
        }
    }

    for (option_key, value) in options.iter_mut() {
        if let Some(default) = config_def_data.get(option_key).and_then(|v| v.get("default_value")) {
            *value = Some(default.clone());
        }
    }

    options.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))).collect()
}

/// Download `machine.json` + `print_config_def.json` for a slicer and
/// resolve each referenced option to its default value.
pub async fn fetch_slicer_defaults(slicer: SlicerType) -> HashMap<String, Value> {
    let Some(artifact_name) = slicer_artifact_name(slicer) else { return HashMap::new() };

    let printer_data = get_slicer_config_artifact(&format!("{artifact_name}/machine.json")).await;
    let config_def_data = get_slicer_config_artifact(&format!("{artifact_name}/print_config_def.json")).await;

    extract_default_options(&printer_data, &config_def_data)
}

/// Fetch defaults for every slicer SimplyPrint publishes artifacts for,
/// optionally persisting each as `{output_dir}/{slicer}/defaults.json`.
pub async fn fetch_all_slicer_defaults(
    output_dir: Option<&Path>,
) -> HashMap<SlicerType, HashMap<String, Value>> {
    let mut results = HashMap::new();

    for &slicer in DEFAULTS_SLICERS {
        let defaults = fetch_slicer_defaults(slicer).await;
        if defaults.is_empty() {
            continue;
        }

        if let Some(output_dir) = output_dir {
            let slicer_dir = output_dir.join(slicer.value());
            if std::fs::create_dir_all(&slicer_dir).is_ok() {
                if let Ok(bytes) = serde_json::to_vec_pretty(&defaults) {
                    let _ = std::fs::write(slicer_dir.join("defaults.json"), bytes);
                }
            }
        }

        results.insert(slicer, defaults);
    }

    results
}

/// Load a previously-saved `defaults.json`; empty map if absent or unreadable.
pub fn load_defaults_from_file(path: &Path) -> HashMap<String, Value> {
    let Ok(bytes) = std::fs::read(path) else { return HashMap::new() };
    serde_json::from_slice(&bytes).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_slicer_has_a_config() {
        for slicer in SlicerType::ALL {
            let cfg = get_source_config(slicer);
            assert_eq!(cfg.slicer, slicer);
        }
    }

    #[test]
    fn prusaslicer_is_ini_bundle_with_additional_repo() {
        let cfg = get_source_config(SlicerType::PrusaSlicer);
        assert!(cfg.ini_bundle);
        assert_eq!(cfg.additional_repos, vec!["prusa3d/PrusaSlicer-settings-non-prusa-fff"]);
    }

    #[test]
    fn empty_defaults_provider_yields_empty_map() {
        let provider = EmptyDefaultsProvider;
        assert!(provider.defaults_for(SlicerType::Cura).is_empty());
    }

    #[test]
    fn extract_default_options_resolves_string_and_dict_lines_and_strips_hash_suffix() {
        let printer_data = serde_json::json!({
            "page": {
                "group": ["nozzle_diameter#0", {"options": ["bed_temperature"]}, 42]
            }
        });
        let config_def_data = serde_json::json!({
            "nozzle_diameter": {"default_value": 0.4},
            "bed_temperature": {"default_value": 60}
        });

        let resolved = extract_default_options(&printer_data, &config_def_data);
        assert_eq!(resolved.get("nozzle_diameter").unwrap(), &serde_json::json!(0.4));
        assert_eq!(resolved.get("bed_temperature").unwrap(), &serde_json::json!(60));
    }

    #[test]
    fn extract_default_options_drops_options_with_no_resolved_default() {
        let printer_data = serde_json::json!({"page": {"group": ["unresolved_option"]}});
        let resolved = extract_default_options(&printer_data, &serde_json::json!({}));
        assert!(resolved.is_empty());
    }

    #[test]
    fn load_defaults_from_file_is_empty_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = load_defaults_from_file(&dir.path().join("nope.json"));
        assert!(defaults.is_empty());
    }

    #[test]
    fn file_defaults_provider_reads_saved_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let slicer_dir = dir.path().join(SlicerType::OrcaSlicer.value());
        std::fs::create_dir_all(&slicer_dir).unwrap();
        std::fs::write(slicer_dir.join("defaults.json"), r#"{"nozzle_diameter": 0.4}"#).unwrap();

        let provider = FileDefaultsProvider::new(dir.path());
        let defaults = provider.defaults_for(SlicerType::OrcaSlicer);
        assert_eq!(defaults.get("nozzle_diameter").unwrap(), &serde_json::json!(0.4));
        assert!(provider.defaults_for(SlicerType::Cura).is_empty());
    }
}
