//! Parser for Cura `fdm_material` XML profiles and `*.def.json` machine
//! definitions. Grounded in `original_source/parsers/cura.py`.

use super::base::Parser;
use crate::error::ParseError;
use crate::model::{ParsedProfile, ProfileType, SlicerType};
use indexmap::IndexMap;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct CuraParser;

fn local_name(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).rsplit(':').next().unwrap_or_default().to_string()
}

fn in_parent(stack: &[String], parent: &str) -> bool {
    stack.len() >= 2 && stack[stack.len() - 2] == parent
}

#[derive(Default)]
struct FdmMaterial {
    brand: String,
    material: String,
    color: String,
    label: String,
    guid: String,
    color_code: String,
    description: String,
    diameter: String,
    density: String,
    weight: String,
    settings: IndexMap<String, String>,
}

fn parse_fdm_material_xml(text: &str) -> FdmMaterial {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut out = FdmMaterial::default();
    let mut current_setting_key: Option<String> = None;
    let mut in_machine = false;
    let mut current_machine_id: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());
                if name == "setting" {
                    current_setting_key = e
                        .attributes()
                        .filter_map(|a| a.ok())
                        .find(|a| local_name(a.key.as_ref()) == "key")
                        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()));
                }
                if name == "machine" {
                    in_machine = true;
                    current_machine_id = None;
                }
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(e.name().as_ref());
                if name == "setting" {
                    current_setting_key = None;
                }
            }
            Ok(Event::Text(e)) => {
                let text_val = e.unescape().unwrap_or_default().to_string();
                if text_val.is_empty() {
                    continue;
                }
                match stack.last().map(|s| s.as_str()) {
                    Some("brand") if in_parent(&stack, "name") => out.brand = text_val,
                    Some("material") if in_parent(&stack, "name") => out.material = text_val,
                    Some("color") if in_parent(&stack, "name") => out.color = text_val,
                    Some("label") if in_parent(&stack, "name") => out.label = text_val,
                    Some("GUID") => out.guid = text_val,
                    Some("color_code") => out.color_code = text_val,
                    Some("description") => out.description = text_val,
                    Some("diameter") => out.diameter = text_val,
                    Some("density") => out.density = text_val,
                    Some("weight") => out.weight = text_val,
                    Some("machine_identifier") => current_machine_id = Some(text_val),
                    Some("setting") => {
                        if let Some(key) = current_setting_key.clone() {
                            let full_key = match (in_machine, &current_machine_id) {
                                (true, Some(mid)) => format!("machine:{mid}:{key}"),
                                _ => key,
                            };
                            out.settings.insert(full_key, text_val);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref());
                if name == "machine" {
                    in_machine = false;
                    current_machine_id = None;
                }
                stack.pop();
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    out
}

fn parse_fdm_material(path: &Path) -> Result<ParsedProfile, ParseError> {
    let text = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed = parse_fdm_material_xml(&text);

    let profile_name = if !parsed.label.is_empty() {
        parsed.label.clone()
    } else {
        format!("{} {} {}", parsed.brand, parsed.material, parsed.color).trim().to_string()
    };
    let vendor = if parsed.brand.is_empty() { "Generic".to_string() } else { parsed.brand.clone() };

    let mut settings: IndexMap<String, Value> = IndexMap::new();
    settings.insert("brand".into(), Value::String(parsed.brand));
    settings.insert("material".into(), Value::String(parsed.material.clone()));
    settings.insert("color".into(), Value::String(parsed.color));
    settings.insert("label".into(), Value::String(parsed.label));
    settings.insert("GUID".into(), Value::String(parsed.guid.clone()));
    settings.insert("color_code".into(), Value::String(parsed.color_code));
    settings.insert("description".into(), Value::String(parsed.description));
    settings.insert("diameter".into(), Value::String(parsed.diameter));
    settings.insert("density".into(), Value::String(parsed.density));
    settings.insert("weight".into(), Value::String(parsed.weight));
    for (k, v) in parsed.settings {
        settings.insert(k, Value::String(v));
    }

    let mut profile = ParsedProfile::new(SlicerType::Cura, ProfileType::Filament, profile_name, vendor);
    profile.filament_id = Some(parsed.guid);
    profile.filament_type = Some(parsed.material);
    profile.source_path = Some(path.to_path_buf());
    profile.settings = settings;
    Ok(profile)
}

fn parse_machine_definition(path: &Path) -> Result<ParsedProfile, ParseError> {
    let text = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let data: Value = serde_json::from_str(&text).map_err(|source| ParseError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let name = data.get("name").and_then(|v| v.as_str()).unwrap_or(stem).to_string();
    let vendor = data
        .get("metadata")
        .and_then(|m| m.get("manufacturer"))
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown")
        .to_string();

    let mut settings: IndexMap<String, Value> = IndexMap::new();
    settings.insert("name".into(), Value::String(name.clone()));
    settings.insert("version".into(), data.get("version").cloned().unwrap_or(Value::Null));
    settings.insert("inherits".into(), data.get("inherits").cloned().unwrap_or(Value::Null));
    if let Some(Value::Object(metadata)) = data.get("metadata") {
        for (k, v) in metadata {
            settings.insert(k.clone(), v.clone());
        }
    }
    if let Some(Value::Object(overrides)) = data.get("overrides") {
        for (key, override_data) in overrides {
            let value = match override_data {
                Value::Object(fields) => fields
                    .get("default_value")
                    .or_else(|| fields.get("value"))
                    .cloned(),
                other => Some(other.clone()),
            };
            if let Some(value) = value {
                settings.insert(key.clone(), value);
            }
        }
    }

    let mut profile = ParsedProfile::new(SlicerType::Cura, ProfileType::MachineModel, name, vendor);
    profile.source_path = Some(path.to_path_buf());
    profile.settings = settings;
    Ok(profile)
}

impl Parser for CuraParser {
    fn slicer_type(&self) -> SlicerType {
        SlicerType::Cura
    }

    fn parse_file(&self, path: &Path) -> Result<ParsedProfile, ParseError> {
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json")
            || path.to_string_lossy().ends_with(".def.json");
        if is_json {
            parse_machine_definition(path)
        } else {
            parse_fdm_material(path)
        }
    }

    fn glob_profiles(&self, vendor_dir: &Path) -> Vec<PathBuf> {
        let mut out = super::base::sorted_glob(vendor_dir, &["fdm_material"]);
        out.extend(super::base::sorted_glob(vendor_dir, &["json"]));
        out
    }

    /// Cura profiles may be flat `*.fdm_material` files, flat/nested
    /// `*.def.json` machine definitions (whose vendor is resolved by walking
    /// the `inherits` chain when the file's own metadata omits it), or
    /// vendor subdirectories of either.
    fn parse_directory(
        &self,
        directory: &Path,
        profile_type_filter: Option<&[ProfileType]>,
    ) -> Vec<ParsedProfile> {
        let mut out = Vec::new();
        let mut seen: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();

        let flat_materials = super::base::sorted_glob(directory, &["fdm_material"]);
        for path in &flat_materials {
            if path.parent() != Some(directory) {
                continue;
            }
            if !seen.insert(path.clone()) {
                continue;
            }
            if let Ok(profile) = self.parse_file(path) {
                if matches(profile_type_filter, profile.profile_type) {
                    out.push(profile);
                }
            }
        }

        let mut def_json_profiles: Vec<ParsedProfile> = Vec::new();
        for path in walkdir::WalkDir::new(directory)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.to_string_lossy().ends_with(".def.json"))
        {
            if !seen.insert(path.clone()) {
                continue;
            }
            if let Ok(profile) = parse_machine_definition(&path) {
                def_json_profiles.push(profile);
            }
        }
        def_json_profiles.sort_by(|a, b| a.source_path.cmp(&b.source_path));

        let mut stem_lookup: HashMap<String, usize> = HashMap::new();
        for (idx, p) in def_json_profiles.iter().enumerate() {
            if let Some(path) = &p.source_path {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                let stem = name.strip_suffix(".def.json").unwrap_or(name);
                stem_lookup.insert(stem.to_string(), idx);
            }
        }

        let inherits_of: Vec<Option<String>> = def_json_profiles
            .iter()
            .map(|p| p.settings.get("inherits").and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect();
        let mut resolved_vendor: Vec<String> = def_json_profiles.iter().map(|p| p.vendor.clone()).collect();
        for idx in 0..def_json_profiles.len() {
            if resolved_vendor[idx] != "Unknown" {
                continue;
            }
            let mut visited = std::collections::HashSet::new();
            let mut current = inherits_of[idx].clone();
            while let Some(parent_stem) = current {
                if !visited.insert(parent_stem.clone()) {
                    break;
                }
                let Some(&parent_idx) = stem_lookup.get(&parent_stem) else { break };
                if resolved_vendor[parent_idx] != "Unknown" {
                    resolved_vendor[idx] = resolved_vendor[parent_idx].clone();
                    break;
                }
                current = inherits_of[parent_idx].clone();
            }
        }

        for (idx, mut profile) in def_json_profiles.into_iter().enumerate() {
            profile.vendor = resolved_vendor[idx].clone();
            if profile.settings.get("visible").and_then(|v| v.as_bool()) == Some(false) {
                continue;
            }
            if matches(profile_type_filter, profile.profile_type) {
                out.push(profile);
            }
        }

        let mut vendor_dirs: Vec<PathBuf> = std::fs::read_dir(directory)
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        vendor_dirs.sort();
        for vendor_dir in vendor_dirs {
            for path in self.glob_profiles(&vendor_dir) {
                if !seen.insert(path.clone()) {
                    continue;
                }
                if let Ok(profile) = self.parse_file(&path) {
                    if matches(profile_type_filter, profile.profile_type) {
                        out.push(profile);
                    }
                }
            }
        }

        out
    }
}

fn matches(filter: Option<&[ProfileType]>, profile_type: ProfileType) -> bool {
    filter.map(|f| f.contains(&profile_type)).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fdm_material_metadata_and_settings() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<fdmmaterial xmlns="http://www.ultimaker.com/material">
  <metadata>
    <name>
      <brand>Generic</brand>
      <material>PLA</material>
      <color>White</color>
    </name>
    <GUID>abc-123</GUID>
  </metadata>
  <properties>
    <diameter>1.75</diameter>
  </properties>
  <settings>
    <setting key="print temperature">200</setting>
  </settings>
</fdmmaterial>"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generic_pla.xml.fdm_material");
        std::fs::write(&path, xml).unwrap();

        let profile = parse_fdm_material(&path).unwrap();
        assert_eq!(profile.vendor, "Generic");
        assert_eq!(profile.filament_type.as_deref(), Some("PLA"));
        assert_eq!(
            profile.settings.get("print temperature"),
            Some(&Value::String("200".to_string()))
        );
    }

    #[test]
    fn machine_definition_flattens_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ultimaker_s5.def.json");
        std::fs::write(
            &path,
            r#"{"name":"Ultimaker S5","metadata":{"manufacturer":"Ultimaker B.V."},"overrides":{"machine_width":{"default_value":330}}}"#,
        )
        .unwrap();

        let profile = parse_machine_definition(&path).unwrap();
        assert_eq!(profile.vendor, "Ultimaker B.V.");
        assert_eq!(profile.settings.get("machine_width"), Some(&Value::from(330)));
    }
}
