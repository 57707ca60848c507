use crate::error::ParseError;
use crate::model::{ParsedProfile, ProfileType, SlicerType};
use std::path::{Path, PathBuf};

/// Shared parser contract (§4.D). Per-file failures are swallowed during
/// directory scans — a single malformed profile must never abort ingestion
/// of an entire vendor tree.
pub trait Parser {
    fn slicer_type(&self) -> SlicerType;

    fn parse_file(&self, path: &Path) -> Result<ParsedProfile, ParseError>;

    fn glob_profiles(&self, vendor_dir: &Path) -> Vec<PathBuf>;

    fn parse_directory(
        &self,
        directory: &Path,
        profile_type_filter: Option<&[ProfileType]>,
    ) -> Vec<ParsedProfile> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(directory) else {
            return out;
        };
        let mut vendor_dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        vendor_dirs.sort();

        for vendor_dir in vendor_dirs {
            for path in self.glob_profiles(&vendor_dir) {
                let Ok(profile) = self.parse_file(&path) else { continue };
                if let Some(filter) = profile_type_filter {
                    if !filter.contains(&profile.profile_type) {
                        continue;
                    }
                }
                out.push(profile);
            }
        }
        out
    }
}

/// Recursively collect files under `dir` whose extension matches one of
/// `extensions` (case-insensitive), sorted for determinism.
pub fn sorted_glob(dir: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| extensions.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    paths
}
