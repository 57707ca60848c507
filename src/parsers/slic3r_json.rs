//! Shared parser for BambuStudio/OrcaSlicer/ElegooSlicer JSON profiles.
//! Grounded in `original_source/parsers/slic3r_json.py`.

use super::base::{sorted_glob, Parser};
use crate::error::ParseError;
use crate::model::{ParsedProfile, ProfileType, SlicerType};
use indexmap::IndexMap;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Directory names that mark the boundary between a vendor and its profiles.
const TYPE_DIR_NAMES: &[&str] = &["filament", "machine", "process"];

pub struct Slic3rJsonParser {
    pub slicer: SlicerType,
}

fn first_value(value: Option<&Value>) -> Option<Value> {
    match value {
        Some(Value::Array(items)) => items.first().cloned(),
        Some(v) => Some(v.clone()),
        None => None,
    }
}

fn value_as_string(value: Option<Value>) -> Option<String> {
    value.and_then(|v| match v {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

impl Parser for Slic3rJsonParser {
    fn slicer_type(&self) -> SlicerType {
        self.slicer
    }

    fn parse_file(&self, path: &Path) -> Result<ParsedProfile, ParseError> {
        let text = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: IndexMap<String, Value> =
            serde_json::from_str(&text).map_err(|source| ParseError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let raw_type = settings.get("type").and_then(|v| v.as_str()).unwrap_or("filament");
        let profile_type = ProfileType::parse(raw_type).ok_or_else(|| ParseError::UnrecognizedShape {
            path: path.to_path_buf(),
        })?;

        let name = settings
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| fallback_id(&settings, profile_type))
            .unwrap_or_else(|| stem.to_string());

        let mut vendor = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        for ancestor in path.ancestors().skip(1) {
            if let Some(dir_name) = ancestor.file_name().and_then(|n| n.to_str()) {
                if TYPE_DIR_NAMES.contains(&dir_name) {
                    vendor = ancestor
                        .parent()
                        .and_then(|p| p.file_name())
                        .and_then(|n| n.to_str())
                        .unwrap_or(&vendor)
                        .to_string();
                    break;
                }
            }
        }

        let mut profile = ParsedProfile::new(self.slicer, profile_type, name, vendor);
        profile.filament_id = value_as_string(first_value(settings.get("filament_id")));
        profile.setting_id = value_as_string(first_value(settings.get("setting_id")));
        profile.filament_type = value_as_string(first_value(settings.get("filament_type")));
        profile.source_path = Some(path.to_path_buf());
        profile.settings = settings;
        Ok(profile)
    }

    fn glob_profiles(&self, vendor_dir: &Path) -> Vec<PathBuf> {
        sorted_glob(vendor_dir, &["json"])
    }
}

fn fallback_id(settings: &IndexMap<String, Value>, profile_type: ProfileType) -> Option<String> {
    let key = match profile_type {
        ProfileType::Filament => "filament_settings_id",
        ProfileType::Machine => "printer_settings_id",
        ProfileType::Print => "print_settings_id",
        ProfileType::MachineModel => return None,
    };
    settings.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_process_as_print_and_extracts_id_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let vendor_dir = dir.path().join("BBL").join("process");
        std::fs::create_dir_all(&vendor_dir).unwrap();
        let file = vendor_dir.join("0.20mm Standard.json");
        std::fs::write(
            &file,
            r#"{"type":"process","print_settings_id":"0.20mm Standard","layer_height":"0.2"}"#,
        )
        .unwrap();

        let parser = Slic3rJsonParser { slicer: SlicerType::BambuStudio };
        let profile = parser.parse_file(&file).unwrap();
        assert_eq!(profile.profile_type, ProfileType::Print);
        assert_eq!(profile.name, "0.20mm Standard");
        assert_eq!(profile.vendor, "BBL");
    }
}
