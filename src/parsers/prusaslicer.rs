//! Parser for PrusaSlicer/SuperSlicer profiles, already split from INI
//! bundles by `squash`. Values are strings, not arrays. Grounded in
//! `original_source/parsers/prusaslicer.py`.

use super::base::{sorted_glob, Parser};
use crate::error::ParseError;
use crate::model::{ParsedProfile, ProfileType, SlicerType};
use indexmap::IndexMap;
use serde_json::Value;
use std::path::{Path, PathBuf};

pub struct PrusaSlicerParser {
    pub slicer: SlicerType,
}

impl Parser for PrusaSlicerParser {
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

        let vendor = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let profile_type = detect_profile_type(&settings);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let name = extract_name(&settings, profile_type, stem);

        let mut profile = ParsedProfile::new(self.slicer, profile_type, name, vendor);
        if profile_type == ProfileType::Filament {
            profile.filament_type = str_field(&settings, "filament_type");
        }
        profile.filament_settings_id = str_field(&settings, "filament_settings_id");
        profile.source_path = Some(path.to_path_buf());
        profile.settings = settings;
        Ok(profile)
    }

    fn glob_profiles(&self, vendor_dir: &Path) -> Vec<PathBuf> {
        sorted_glob(vendor_dir, &["json"])
    }
}

fn str_field(settings: &IndexMap<String, Value>, key: &str) -> Option<String> {
    settings.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn detect_profile_type(settings: &IndexMap<String, Value>) -> ProfileType {
    if settings.contains_key("variants") {
        return ProfileType::MachineModel;
    }
    if settings.contains_key("printer_settings_id") && !settings.contains_key("filament_settings_id") {
        return ProfileType::Machine;
    }
    if settings.contains_key("print_settings_id") && !settings.contains_key("filament_settings_id") {
        return ProfileType::Print;
    }
    ProfileType::Filament
}

fn extract_name(settings: &IndexMap<String, Value>, profile_type: ProfileType, stem: &str) -> String {
    let key = match profile_type {
        ProfileType::Filament => "filament_settings_id",
        ProfileType::Machine => "printer_settings_id",
        ProfileType::MachineModel => "name",
        ProfileType::Print => "print_settings_id",
    };
    str_field(settings, key)
        .or_else(|| str_field(settings, "name"))
        .unwrap_or_else(|| stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_machine_model_from_variants() {
        let dir = tempfile::tempdir().unwrap();
        let vendor_dir = dir.path().join("PrusaResearch");
        std::fs::create_dir_all(&vendor_dir).unwrap();
        let file = vendor_dir.join("MK4.json");
        std::fs::write(&file, r#"{"name":"MK4","variants":["0.4"]}"#).unwrap();

        let parser = PrusaSlicerParser { slicer: SlicerType::PrusaSlicer };
        let profile = parser.parse_file(&file).unwrap();
        assert_eq!(profile.profile_type, ProfileType::MachineModel);
        assert_eq!(profile.name, "MK4");
    }

    #[test]
    fn filament_takes_precedence_over_machine_fields() {
        let dir = tempfile::tempdir().unwrap();
        let vendor_dir = dir.path().join("Prusament");
        std::fs::create_dir_all(&vendor_dir).unwrap();
        let file = vendor_dir.join("pla.json");
        std::fs::write(
            &file,
            r#"{"filament_settings_id":"Prusament PLA","printer_settings_id":"MK4","filament_type":"PLA"}"#,
        )
        .unwrap();

        let parser = PrusaSlicerParser { slicer: SlicerType::PrusaSlicer };
        let profile = parser.parse_file(&file).unwrap();
        assert_eq!(profile.profile_type, ProfileType::Filament);
        assert_eq!(profile.filament_type.as_deref(), Some("PLA"));
    }
}
