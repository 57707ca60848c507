//! Core data model: slicer/profile-type enumerations, the transient
//! [`ParsedProfile`] produced by parsers, and the persistent [`StoredProfile`]
//! kept by the versioned store. Grounded in `original_source/models.py`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Setting keys whose values are resource references rather than plain data.
pub const RESOURCE_SETTING_KEYS: &[&str] = &["bed_model", "bed_texture", "thumbnail", "hotend_model"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlicerType {
    BambuStudio,
    OrcaSlicer,
    PrusaSlicer,
    Cura,
    ElegooSlicer,
    SuperSlicer,
}

impl SlicerType {
    pub const ALL: [SlicerType; 6] = [
        SlicerType::BambuStudio,
        SlicerType::OrcaSlicer,
        SlicerType::PrusaSlicer,
        SlicerType::Cura,
        SlicerType::ElegooSlicer,
        SlicerType::SuperSlicer,
    ];

    pub fn value(self) -> &'static str {
        match self {
            SlicerType::BambuStudio => "bambustudio",
            SlicerType::OrcaSlicer => "orcaslicer",
            SlicerType::PrusaSlicer => "prusaslicer",
            SlicerType::Cura => "cura",
            SlicerType::ElegooSlicer => "elegooslicer",
            SlicerType::SuperSlicer => "superslicer",
        }
    }

    pub fn parse(s: &str) -> Option<SlicerType> {
        SlicerType::ALL.into_iter().find(|v| v.value() == s)
    }

    /// Whether this slicer keeps semicolon-separated native IDs / list-valued
    /// settings as strings rather than unwrapping single-element lists.
    pub fn is_prusaslicer_family(self) -> bool {
        matches!(self, SlicerType::PrusaSlicer | SlicerType::SuperSlicer)
    }

    /// Whether this slicer emits plain slic3r-flavor JSON profiles (as
    /// opposed to INI bundles or Cura's XML/def.json pair).
    pub fn is_slic3r_json_family(self) -> bool {
        matches!(
            self,
            SlicerType::BambuStudio | SlicerType::OrcaSlicer | SlicerType::ElegooSlicer
        )
    }

    pub fn is_ini_bundle_family(self) -> bool {
        matches!(self, SlicerType::PrusaSlicer | SlicerType::SuperSlicer)
    }
}

impl std::fmt::Display for SlicerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    Filament,
    Machine,
    MachineModel,
    Print,
}

impl ProfileType {
    pub fn value(self) -> &'static str {
        match self {
            ProfileType::Filament => "filament",
            ProfileType::Machine => "machine",
            ProfileType::MachineModel => "machine_model",
            ProfileType::Print => "print",
        }
    }

    pub fn parse(s: &str) -> Option<ProfileType> {
        match s {
            "filament" => Some(ProfileType::Filament),
            "machine" => Some(ProfileType::Machine),
            "machine_model" => Some(ProfileType::MachineModel),
            // `process` is the slic3r-JSON spelling of Print; canonicalize here.
            "print" | "process" => Some(ProfileType::Print),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProfileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}

/// Transient record produced by a parser and consumed once by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedProfile {
    pub slicer: SlicerType,
    pub profile_type: ProfileType,
    pub name: String,
    pub vendor: String,
    #[serde(default)]
    pub settings: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filament_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setting_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filament_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filament_settings_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl ParsedProfile {
    pub fn new(slicer: SlicerType, profile_type: ProfileType, name: String, vendor: String) -> Self {
        ParsedProfile {
            slicer,
            profile_type,
            name,
            vendor,
            settings: IndexMap::new(),
            filament_id: None,
            setting_id: None,
            filament_type: None,
            filament_settings_id: None,
            renamed_from: None,
            source_path: None,
        }
    }
}

/// A single setting's version history: version string -> value, insertion
/// order preserved (oldest observed first).
pub type SettingHistory = IndexMap<String, Value>;

/// Persistent record kept by the store. Identity is `(slicer, profile_type,
/// vendor, name)`, unique on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredProfile {
    pub slicer: SlicerType,
    pub profile_type: ProfileType,
    pub name: String,
    pub vendor: String,
    pub first_seen: String,
    pub last_seen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filament_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setting_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
    #[serde(default)]
    pub settings: IndexMap<String, SettingHistory>,
}

impl StoredProfile {
    pub fn new(
        slicer: SlicerType,
        profile_type: ProfileType,
        name: String,
        vendor: String,
        version: &str,
    ) -> Self {
        StoredProfile {
            slicer,
            profile_type,
            name,
            vendor,
            first_seen: version.to_string(),
            last_seen: version.to_string(),
            filament_id: None,
            setting_id: None,
            renamed_from: None,
            settings: IndexMap::new(),
        }
    }

    /// `get_latest(key)` — most recent value, if any.
    pub fn get_latest(&self, key: &str) -> Option<&Value> {
        self.settings.get(key).and_then(|h| h.values().last())
    }

    /// `get_at_version(key, V)` — the value whose version is the greatest
    /// recorded version <= V, under the version ordering. A linear scan over
    /// the (small, insertion-ordered) history, matching the original's
    /// explicit "don't assume sorted order" semantics.
    pub fn get_at_version(&self, key: &str, v: &str) -> Option<&Value> {
        let history = self.settings.get(key)?;
        let target = crate::version::version_key(v);
        let mut best: Option<(&String, &Value)> = None;
        for (ver, value) in history {
            if crate::version::version_key(ver) <= target {
                let replace = match &best {
                    None => true,
                    Some((bver, _)) => crate::version::version_key(bver) <= crate::version::version_key(ver),
                };
                if replace {
                    best = Some((ver, value));
                }
            }
        }
        best.map(|(_, v)| v)
    }

    /// `evaluate(V)` — flat snapshot of every key whose first recorded
    /// version <= V.
    pub fn evaluate(&self, v: &str) -> IndexMap<String, Value> {
        let mut out = IndexMap::new();
        for key in self.settings.keys() {
            if let Some(value) = self.get_at_version(key, v) {
                out.insert(key.clone(), value.clone());
            }
        }
        out
    }

    /// `changed_settings(V1, V2)` — keys whose value at V1 differs
    /// (canonically) from the value at V2, with both values.
    pub fn changed_settings(&self, v1: &str, v2: &str) -> IndexMap<String, (Option<Value>, Option<Value>)> {
        let mut out = IndexMap::new();
        for key in self.settings.keys() {
            let a = self.get_at_version(key, v1).cloned();
            let b = self.get_at_version(key, v2).cloned();
            let differ = match (&a, &b) {
                (Some(x), Some(y)) => canonical_json(x) != canonical_json(y),
                (None, None) => false,
                _ => true,
            };
            if differ {
                out.insert(key.clone(), (a, b));
            }
        }
        out
    }
}

/// Canonical-JSON normalization for equality comparisons: object keys sorted
/// recursively, no incidental whitespace; list order is preserved (and thus
/// significant).
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for k in keys {
                    out.insert(k.clone(), sorted(&map[k]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sorted(value)).unwrap_or_default()
}

/// Report returned by every top-level ingestion operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionReport {
    pub slicer: Option<SlicerType>,
    pub version: String,
    pub profiles_processed: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: IndexMap<String, Vec<String>>,
    pub unchanged: usize,
}
