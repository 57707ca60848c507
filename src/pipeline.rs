//! Top-level ingestion orchestrator: download → extract → squash → parse →
//! store (§4.M). Grounded in `original_source/pipeline.py`.

use crate::config::{self, get_source_config, SourceConfig};
use crate::download::{self, VersionInfo};
use crate::error::PipelineError;
use crate::model::{IngestionReport, ProfileType, SlicerType};
use crate::parsers::{self, Parser};
use crate::progress::{NullProgressReporter, ProgressReporter};
use crate::resources::{self, ResourceStore};
use crate::squash;
use crate::store::ProfileStore;
use crate::version::{is_mutable, is_prerelease, normalize_version, sort_versions, version_key};
use std::path::{Path, PathBuf};

/// Orchestrator that chains download → extract → squash → parse → store for
/// one or many versions of a slicer's profile repository.
pub struct ProfilePipeline<'a> {
    store: &'a ProfileStore,
    overlay_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    reporter: &'a dyn ProgressReporter,
}

static NULL_REPORTER: NullProgressReporter = NullProgressReporter;

impl<'a> ProfilePipeline<'a> {
    pub fn new(store: &'a ProfileStore) -> Self {
        ProfilePipeline { store, overlay_dir: None, work_dir: None, reporter: &NULL_REPORTER }
    }

    pub fn with_overlay_dir(mut self, overlay_dir: impl Into<PathBuf>) -> Self {
        self.overlay_dir = Some(overlay_dir.into());
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn with_reporter(mut self, reporter: &'a dyn ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Full pipeline for a single version: download → extract → squash →
    /// parse → store. `version` may be a literal tag/branch, or the
    /// keywords `"latest"`/`"nightly"`.
    pub async fn ingest(
        &self,
        slicer: SlicerType,
        version: &str,
        profile_types: Option<&[ProfileType]>,
        fetch_defaults: bool,
    ) -> Result<IngestionReport, PipelineError> {
        let config = get_source_config(slicer);

        let is_nightly = version == "nightly";
        let resolved_version = if version == "latest" {
            self.reporter.update_status(&format!("Resolving latest version for {}...", slicer.value()));
            self.resolve_latest_version(slicer).await?
        } else if is_nightly {
            self.resolve_nightly_version(slicer)
        } else {
            version.to_string()
        };

        if !is_mutable(&resolved_version) {
            let normalized = normalize_version(&resolved_version);
            let existing = self.store.get_versions(slicer);
            if existing.contains(&normalized) {
                self.reporter
                    .update_status(&format!("Skipping {} {normalized} (already ingested)", slicer.value()));
                return Ok(IngestionReport {
                    slicer: Some(slicer),
                    version: normalized,
                    ..Default::default()
                });
            }
        }

        let (work, created_temp) = match &self.work_dir {
            Some(work) => {
                std::fs::create_dir_all(work).map_err(crate::error::DownloadError::Io)?;
                (work.clone(), false)
            }
            None => (make_temp_dir(&format!("ofd-slicer-{}-", slicer.value()))?, true),
        };

        let result = self
            .run_pipeline(slicer, config, &resolved_version, &work, profile_types, fetch_defaults, is_nightly)
            .await;

        if created_temp && work.exists() {
            let _ = std::fs::remove_dir_all(&work);
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &self,
        slicer: SlicerType,
        cfg: &SourceConfig,
        version: &str,
        work: &Path,
        profile_types: Option<&[ProfileType]>,
        fetch_defaults: bool,
        is_nightly: bool,
    ) -> Result<IngestionReport, PipelineError> {
        self.reporter.update_status(&format!("Downloading {} {version}...", slicer.value()));
        let result =
            download::download_and_extract(cfg, version, work, profile_types, self.reporter).await?;
        let extracted = result.extracted_dir;

        // Resources must be collected before squashing: squash_slic3r_profiles
        // rmtrees each vendor dir, destroying any STL/SVG/PNG files alongside.
        let mut resource_store = ResourceStore::open(self.store.root.join(slicer.value()).join("_resources"))
            .map_err(crate::error::PipelineError::Store)?;
        let resource_map =
            resources::collect_resources(&mut resource_store, &extracted).map_err(crate::error::PipelineError::Store)?;

        let mut detected_version: Option<String> = None;
        if cfg.ini_bundle {
            self.reporter.update_status(&format!("Squashing INI bundles for {}...", slicer.value()));
            let (_, version) = squash::unpack_prusaslicer_bundles(&extracted, profile_types)?;
            detected_version = version;
        } else if !cfg.profile_type_dirs.is_empty() {
            self.reporter.update_status(&format!("Resolving inheritance for {}...", slicer.value()));
            let single_type = match profile_types {
                Some([single]) => Some(std::slice::from_ref(single)),
                _ => None,
            };
            squash::squash_all_slic3r_vendors(&extracted, single_type, cfg.filament_library_name)?;
            if let Some(library_name) = cfg.filament_library_name {
                let lib_dir = extracted.join(library_name);
                if lib_dir.exists() {
                    std::fs::remove_dir_all(&lib_dir).map_err(crate::error::SquashError::Io)?;
                }
            }
        }

        if let Some(overlay_dir) = &self.overlay_dir {
            download::apply_overlays(&extracted, overlay_dir, slicer)?;
        }

        self.reporter.update_status(&format!("Parsing {} profiles...", slicer.value()));
        let parser = parsers::for_slicer(slicer);
        let mut parsed = parser.parse_directory(&extracted, profile_types);

        if !resource_map.is_empty() {
            for profile in &mut parsed {
                resources::rewrite_resource_refs(profile, &resource_map);
            }
        }

        let mut normalized_version = normalize_version(version);
        if normalized_version == "main" || normalized_version == "master" {
            normalized_version = detected_version.unwrap_or_else(today_iso);
        }
        if is_nightly {
            normalized_version = format!("nightly-{normalized_version}");
        }

        self.reporter.update_status(&format!(
            "Storing {} {} profiles (version {normalized_version})...",
            parsed.len(),
            slicer.value()
        ));
        let report = self
            .store
            .ingest_profiles(slicer, &normalized_version, parsed)
            .map_err(crate::error::PipelineError::Store)?;

        let referenced = resources::collect_referenced_hashes(&self.store.root, slicer.value());
        resource_store.gc(&referenced).map_err(crate::error::PipelineError::Store)?;

        if fetch_defaults {
            let defaults = config::fetch_slicer_defaults(slicer).await;
            if !defaults.is_empty() {
                let defaults_dir = self.store.root.join(slicer.value());
                std::fs::create_dir_all(&defaults_dir).map_err(crate::error::DownloadError::Io)?;
                let bytes = serde_json::to_vec_pretty(&defaults).map_err(|source| {
                    crate::error::PipelineError::Store(crate::error::StoreError::Corrupt {
                        path: defaults_dir.join("defaults.json"),
                        source,
                    })
                })?;
                std::fs::write(defaults_dir.join("defaults.json"), bytes).map_err(crate::error::DownloadError::Io)?;
            }
        }

        Ok(report)
    }

    /// Download an INI-bundle repo's branch once and ingest every historical
    /// vendor-version combination found inside it, oldest-first.
    pub async fn ingest_all_ini_versions(
        &self,
        slicer: SlicerType,
        profile_types: Option<&[ProfileType]>,
    ) -> Result<Vec<IngestionReport>, PipelineError> {
        let config = get_source_config(slicer);

        let (work, created_temp) = match &self.work_dir {
            Some(work) => {
                std::fs::create_dir_all(work).map_err(crate::error::DownloadError::Io)?;
                (work.clone(), false)
            }
            None => (make_temp_dir(&format!("ofd-slicer-{}-", slicer.value()))?, true),
        };

        let result = self.ingest_all_ini_versions_inner(slicer, config, profile_types, &work).await;

        if created_temp && work.exists() {
            let _ = std::fs::remove_dir_all(&work);
        }

        result
    }

    async fn ingest_all_ini_versions_inner(
        &self,
        slicer: SlicerType,
        config: &SourceConfig,
        profile_types: Option<&[ProfileType]>,
        work: &Path,
    ) -> Result<Vec<IngestionReport>, PipelineError> {
        let branch = config.branch.unwrap_or("main");
        self.reporter.update_status(&format!("Downloading {} {branch}...", slicer.value()));
        let result = download::download_and_extract(config, branch, work, profile_types, self.reporter).await?;
        let extracted = result.extracted_dir;

        self.reporter.update_status(&format!("Enumerating INI bundle versions for {}...", slicer.value()));
        let version_groups = squash::iter_ini_bundle_versions(&extracted, Some(config.min_version));

        if version_groups.is_empty() {
            self.reporter.update_status(&format!("No INI versions found for {}", slicer.value()));
            return Ok(Vec::new());
        }
        self.reporter
            .update_status(&format!("Found {} versions for {}", version_groups.len(), slicer.value()));

        let mut resource_store = ResourceStore::open(self.store.root.join(slicer.value()).join("_resources"))
            .map_err(crate::error::PipelineError::Store)?;
        let resource_map =
            resources::collect_resources(&mut resource_store, &extracted).map_err(crate::error::PipelineError::Store)?;

        let parser = parsers::for_slicer(slicer);
        let mut reports = Vec::new();
        let total = version_groups.len();

        for (i, group) in version_groups.into_iter().enumerate() {
            self.reporter.step(&format!("{} {}", slicer.value(), group.version), i + 1, total);

            let split_dir = work.join(format!("_split_{}", group.version));
            let outcome = self
                .ingest_one_ini_version(slicer, &split_dir, &group.bundles, &group.version, profile_types, &resource_map, &*parser)
                .await;
            let _ = std::fs::remove_dir_all(&split_dir);

            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => {
                    self.reporter
                        .update_status(&format!("Failed to ingest {} {}: {e}", slicer.value(), group.version));
                    continue;
                }
            }
        }

        let referenced = resources::collect_referenced_hashes(&self.store.root, slicer.value());
        resource_store.gc(&referenced).map_err(crate::error::PipelineError::Store)?;

        Ok(reports)
    }

    #[allow(clippy::too_many_arguments)]
    async fn ingest_one_ini_version(
        &self,
        slicer: SlicerType,
        split_dir: &Path,
        vendor_inis: &[(String, PathBuf)],
        version: &str,
        profile_types: Option<&[ProfileType]>,
        resource_map: &std::collections::HashMap<String, String>,
        parser: &dyn Parser,
    ) -> Result<IngestionReport, PipelineError> {
        std::fs::create_dir_all(split_dir).map_err(crate::error::SquashError::Io)?;

        for (vendor_name, ini_path) in vendor_inis {
            let vendor_out = split_dir.join(vendor_name);
            std::fs::create_dir_all(&vendor_out).map_err(crate::error::SquashError::Io)?;
            squash::split_prusaslicer_bundle(ini_path, "", &vendor_out, None)?;
        }

        if let Some(overlay_dir) = &self.overlay_dir {
            download::apply_overlays(split_dir, overlay_dir, slicer)?;
        }

        let mut parsed = parser.parse_directory(split_dir, profile_types);
        if !resource_map.is_empty() {
            for profile in &mut parsed {
                resources::rewrite_resource_refs(profile, resource_map);
            }
        }

        self.reporter
            .update_status(&format!("Storing {} {} profiles (version {version})...", parsed.len(), slicer.value()));
        self.store.ingest_profiles(slicer, version, parsed).map_err(crate::error::PipelineError::Store)
    }

    /// Enumerate and ingest every version for a slicer: dispatches to the
    /// INI-bundle path, a single branch-HEAD ingest, or GitHub tag
    /// enumeration depending on the slicer's source shape.
    pub async fn ingest_all_versions(
        &self,
        slicer: SlicerType,
        profile_types: Option<&[ProfileType]>,
    ) -> Result<Vec<IngestionReport>, PipelineError> {
        let config = get_source_config(slicer);

        if config.ini_bundle {
            return self.ingest_all_ini_versions(slicer, profile_types).await;
        }

        if config.branch.is_some() && config.tag_pattern.is_none() {
            let report = self.ingest(slicer, "latest", profile_types, false).await?;
            return Ok(vec![report]);
        }

        let tags = download::enumerate_github_tags(config.github_repo, config.tag_pattern, slicer).await?;

        let stable_tags: Vec<&VersionInfo> = tags.iter().filter(|t| !is_prerelease(&t.raw)).collect();
        let tag_map: std::collections::HashMap<String, &VersionInfo> =
            stable_tags.iter().map(|t| (t.normalized.clone(), *t)).collect();
        let mut sorted_versions: Vec<String> = tag_map.keys().cloned().collect();
        sort_versions(&mut sorted_versions);

        let min_key = version_key(config.min_version);
        sorted_versions.retain(|v| version_key(v) >= min_key);

        let existing: std::collections::HashSet<String> = self.store.get_versions(slicer).into_iter().collect();
        let new_versions: Vec<String> = sorted_versions.iter().filter(|v| !existing.contains(*v)).cloned().collect();
        if new_versions.len() < sorted_versions.len() {
            let skipped = sorted_versions.len() - new_versions.len();
            self.reporter
                .update_status(&format!("Skipping {skipped} already-ingested versions for {}", slicer.value()));
        }

        let mut reports = Vec::new();
        let total = new_versions.len();
        for (i, norm_ver) in new_versions.iter().enumerate() {
            let tag = tag_map[norm_ver];
            self.reporter.step(&format!("{} {}", slicer.value(), tag.raw), i + 1, total);
            match self.ingest(slicer, &tag.raw, profile_types, false).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    self.reporter.update_status(&format!("Failed to ingest {} {}: {e}", slicer.value(), tag.raw));
                    continue;
                }
            }
        }

        Ok(reports)
    }

    async fn resolve_latest_version(&self, slicer: SlicerType) -> Result<String, PipelineError> {
        let config = get_source_config(slicer);

        if let Some(branch) = config.branch {
            if config.tag_pattern.is_none() {
                return Ok(branch.to_string());
            }
        }

        let tags = download::enumerate_github_tags(config.github_repo, config.tag_pattern, slicer).await?;
        if tags.is_empty() {
            if let Some(branch) = config.branch {
                return Ok(branch.to_string());
            }
            return Err(crate::error::PipelineError::Download(crate::error::DownloadError::NotFound {
                url: format!("no tags found for {} in {}", slicer.value(), config.github_repo),
            }));
        }

        let mut stable_tags: Vec<&VersionInfo> = tags.iter().filter(|t| !is_prerelease(&t.raw)).collect();
        if stable_tags.is_empty() {
            stable_tags = tags.iter().collect();
        }
        let tag_map: std::collections::HashMap<String, &VersionInfo> =
            stable_tags.iter().map(|t| (t.normalized.clone(), *t)).collect();
        let mut sorted_versions: Vec<String> = tag_map.keys().cloned().collect();
        sort_versions(&mut sorted_versions);
        let highest = sorted_versions.last().expect("stable_tags is non-empty");
        Ok(tag_map[highest].raw.clone())
    }

    fn resolve_nightly_version(&self, slicer: SlicerType) -> String {
        let config = get_source_config(slicer);
        config.branch.or(config.nightly_branch).unwrap_or_default().to_string()
    }
}

fn today_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

fn make_temp_dir(prefix: &str) -> Result<PathBuf, PipelineError> {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    let dir = std::env::temp_dir().join(format!("{prefix}{nanos:x}"));
    std::fs::create_dir_all(&dir).map_err(crate::error::DownloadError::Io)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_nightly_prefers_branch_over_nightly_branch() {
        let store = ProfileStore::new(std::env::temp_dir().join("pipeline-test-unused"));
        let pipeline = ProfilePipeline::new(&store);
        assert_eq!(pipeline.resolve_nightly_version(SlicerType::BambuStudio), "master");
        assert_eq!(pipeline.resolve_nightly_version(SlicerType::PrusaSlicer), "main");
    }

    #[test]
    fn today_iso_is_stamped_in_iso_format() {
        let stamp = today_iso();
        assert_eq!(stamp.len(), 10);
        assert_eq!(stamp.matches('-').count(), 2);
    }
}
