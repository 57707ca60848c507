//! Archive fetcher and overlay application (§4.M). Grounded in
//! `original_source/download.py`.

use crate::config::SourceConfig;
use crate::error::DownloadError;
use crate::model::{ProfileType, SlicerType};
use crate::progress::ProgressReporter;
use crate::version::normalize_version;
use regex::Regex;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub raw: String,
    pub normalized: String,
    pub slicer: SlicerType,
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub slicer: SlicerType,
    pub version: VersionInfo,
    pub extracted_dir: PathBuf,
    pub profile_types_found: Vec<ProfileType>,
}

fn looks_like_branch(version: &str) -> bool {
    matches!(version, "main" | "master" | "develop" | "dev")
}

fn build_zip_url(repo: &str, version: Option<&str>, branch: Option<&str>) -> String {
    if let Some(branch) = branch {
        format!("https://github.com/{repo}/archive/refs/heads/{branch}.zip")
    } else {
        format!("https://github.com/{repo}/archive/refs/tags/{}.zip", version.unwrap_or_default())
    }
}

fn zip_root_prefix(repo: &str, version: Option<&str>, branch: Option<&str>) -> String {
    let repo_name = repo.rsplit('/').next().unwrap_or(repo);
    match branch {
        Some(branch) => format!("{repo_name}-{branch}"),
        None => format!("{repo_name}-{}", version.map(normalize_version).unwrap_or_default()),
    }
}

pub async fn download_and_extract(
    config: &SourceConfig,
    version: &str,
    output_dir: &Path,
    profile_types: Option<&[ProfileType]>,
    reporter: &dyn ProgressReporter,
) -> Result<DownloadResult, DownloadError> {
    let slicer_output = output_dir.join(config.slicer.value());
    if slicer_output.exists() {
        std::fs::remove_dir_all(&slicer_output).map_err(DownloadError::Io)?;
    }
    std::fs::create_dir_all(&slicer_output).map_err(DownloadError::Io)?;

    let version_info = VersionInfo {
        raw: version.to_string(),
        normalized: normalize_version(version),
        slicer: config.slicer,
    };

    let use_branch = config.branch.is_some() || looks_like_branch(version);
    let tag_version = if use_branch { None } else { Some(version) };
    let branch = config.branch.or(if use_branch { Some(version) } else { None });

    let mut types_found: HashSet<ProfileType> = HashSet::new();

    extract_repo(
        config.github_repo,
        tag_version,
        branch,
        config,
        &slicer_output,
        profile_types,
        &mut types_found,
        reporter,
    )
    .await?;

    for extra_repo in &config.additional_repos {
        extract_repo(
            extra_repo,
            tag_version,
            Some(branch.unwrap_or("main")),
            config,
            &slicer_output,
            profile_types,
            &mut types_found,
            reporter,
        )
        .await?;
    }

    Ok(DownloadResult {
        slicer: config.slicer,
        version: version_info,
        extracted_dir: slicer_output,
        profile_types_found: types_found.into_iter().collect(),
    })
}

async fn download_zip(url: &str, dest_path: &Path, reporter: &dyn ProgressReporter) -> Result<(), DownloadError> {
    const MAX_RETRIES: u32 = 3;
    let client = reqwest::Client::new();
    let mut last_error = None;

    for attempt in 1..=MAX_RETRIES {
        match client.get(url).send().await {
            Ok(resp) => {
                if resp.status().as_u16() == 404 {
                    return Err(DownloadError::NotFound { url: url.to_string() });
                }
                if !resp.status().is_success() {
                    last_error = Some(resp.error_for_status().unwrap_err());
                } else {
                    let total = resp.content_length().unwrap_or(0);
                    let filename = url.rsplit('/').next().unwrap_or(url);
                    let mut bar = reporter.create_download_bar(total, &format!("Downloading {filename}"));

                    let mut file = std::fs::File::create(dest_path).map_err(DownloadError::Io)?;
                    let mut stream = resp.bytes_stream();
                    use futures::StreamExt;
                    while let Some(chunk) = stream.next().await {
                        let chunk = chunk.map_err(|source| DownloadError::Http { url: url.to_string(), source })?;
                        file.write_all(&chunk).map_err(DownloadError::Io)?;
                        bar.update(chunk.len() as u64);
                    }
                    bar.close();
                    return Ok(());
                }
            }
            Err(source) => last_error = Some(source),
        }

        if attempt < MAX_RETRIES {
            tracing::warn!(attempt, max_retries = MAX_RETRIES, "download attempt failed, retrying");
        }
    }

    Err(DownloadError::Http { url: url.to_string(), source: last_error.expect("loop always sets last_error before exhausting retries") })
}

#[allow(clippy::too_many_arguments)]
async fn extract_repo(
    repo: &str,
    version: Option<&str>,
    branch: Option<&str>,
    config: &SourceConfig,
    slicer_output: &Path,
    profile_types: Option<&[ProfileType]>,
    types_found: &mut HashSet<ProfileType>,
    reporter: &dyn ProgressReporter,
) -> Result<(), DownloadError> {
    let url = build_zip_url(repo, version, branch);
    let zip_path = std::env::temp_dir().join(format!("slicer-profiles-{}.zip", uuid_like()));

    let result = extract_repo_inner(
        &url, repo, version, branch, config, slicer_output, profile_types, types_found, reporter, &zip_path,
    )
    .await;

    let _ = std::fs::remove_file(&zip_path);
    result
}

fn uuid_like() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    format!("{nanos:x}")
}

#[allow(clippy::too_many_arguments)]
async fn extract_repo_inner(
    url: &str,
    repo: &str,
    version: Option<&str>,
    branch: Option<&str>,
    config: &SourceConfig,
    slicer_output: &Path,
    profile_types: Option<&[ProfileType]>,
    types_found: &mut HashSet<ProfileType>,
    reporter: &dyn ProgressReporter,
    zip_path: &Path,
) -> Result<(), DownloadError> {
    download_zip(url, zip_path, reporter).await?;

    let mut zip_root = zip_root_prefix(repo, version, branch);
    let mut member = match config.profile_path_in_repo {
        Some(p) => format!("{zip_root}/{p}"),
        None => zip_root.clone(),
    };
    if config.slicer == SlicerType::Cura && !repo.contains("fdm_materials") {
        member = format!("{zip_root}/resources/definitions");
    }
    if !member.ends_with('/') {
        member.push('/');
    }

    let pattern = build_extract_pattern(config, repo, profile_types);

    let file = std::fs::File::open(zip_path).map_err(DownloadError::Io)?;
    let mut zip = zip::ZipArchive::new(file).map_err(DownloadError::Zip)?;

    if let Some(first_entry) = (0..zip.len())
        .filter_map(|i| zip.by_index(i).ok().map(|f| f.name().to_string()))
        .find(|name| name.contains('/'))
    {
        if let Some(actual_root) = first_entry.split('/').next() {
            if actual_root != zip_root {
                member = member.replacen(&zip_root, actual_root, 1);
                zip_root = actual_root.to_string();
            }
        }
    }

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(DownloadError::Zip)?;
        let name = entry.name().to_string();
        if !name.starts_with(&member) || name.ends_with('/') {
            continue;
        }
        if !pattern.is_match(&name) {
            continue;
        }

        let rel_path = Path::new(&name).strip_prefix(&member).unwrap_or(Path::new(&name));
        let dest = slicer_output.join(rel_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(DownloadError::Io)?;
        }
        let mut out = std::fs::File::create(&dest).map_err(DownloadError::Io)?;
        std::io::copy(&mut entry, &mut out).map_err(DownloadError::Io)?;

        for (pt, dir_name) in &config.profile_type_dirs {
            if rel_path.components().any(|c| c.as_os_str() == *dir_name) {
                types_found.insert(*pt);
            }
        }
    }

    Ok(())
}

fn build_extract_pattern(config: &SourceConfig, repo: &str, profile_types: Option<&[ProfileType]>) -> Regex {
    if config.ini_bundle {
        return Regex::new(r".*\.(ini|idx|stl|svg|png|json)$").unwrap();
    }
    if config.slicer == SlicerType::Cura {
        if repo.contains("fdm_materials") {
            return Regex::new(r".*\.fdm_material$").unwrap();
        }
        return Regex::new(r".*\.def\.json$").unwrap();
    }
    if !config.profile_type_dirs.is_empty() {
        let dirs: Vec<&str> = match profile_types {
            Some(types) => types.iter().filter_map(|pt| config.profile_type_dirs.get(pt).copied()).collect(),
            None => config.profile_type_dirs.values().copied().collect(),
        };
        let dir_pattern = dirs.iter().map(|d| regex::escape(d)).collect::<Vec<_>>().join("|");
        return Regex::new(&format!(r".*/(?:.*\.(?:stl|svg|png)|(?:{dir_pattern})/.*)")).unwrap();
    }
    Regex::new(r".*").unwrap()
}

/// Copy pre-squashed overlay profiles into the extracted tree, bypassing
/// inheritance resolution entirely. Overlay structure:
/// `{overlay_dir}/{slicer}/{vendor}/...`, any file type.
pub fn apply_overlays(extracted_dir: &Path, overlay_dir: &Path, slicer: SlicerType) -> Result<(), DownloadError> {
    let slicer_overlay = overlay_dir.join(slicer.value());
    if !slicer_overlay.exists() {
        return Ok(());
    }

    for vendor_entry in std::fs::read_dir(&slicer_overlay).map_err(DownloadError::Io)? {
        let vendor_dir = vendor_entry.map_err(DownloadError::Io)?.path();
        if !vendor_dir.is_dir() {
            continue;
        }
        let vendor_name = vendor_dir.file_name().expect("read_dir entries always have a file name");
        let dest_vendor = extracted_dir.join(vendor_name);
        std::fs::create_dir_all(&dest_vendor).map_err(DownloadError::Io)?;

        for entry in walkdir::WalkDir::new(&vendor_dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&vendor_dir).unwrap_or(entry.path());
            let dest = dest_vendor.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(DownloadError::Io)?;
            }
            std::fs::copy(entry.path(), &dest).map_err(DownloadError::Io)?;
        }
    }
    Ok(())
}

/// Paginated GitHub tags listing, optionally filtered by a regex against the
/// tag name. Reads `GITHUB_TOKEN` for a higher rate limit, same as the rest
/// of the ambient stack's GitHub calls.
pub async fn enumerate_github_tags(
    repo: &str,
    tag_pattern: Option<&str>,
    slicer: SlicerType,
) -> Result<Vec<VersionInfo>, DownloadError> {
    let pattern = tag_pattern.and_then(|p| Regex::new(p).ok());

    let client = reqwest::Client::new();
    let mut tags = Vec::new();
    let mut page = 1u32;

    loop {
        let url = format!("https://api.github.com/repos/{repo}/tags");
        let mut request = client
            .get(&url)
            .header("Accept", "application/vnd.github.v3+json")
            .query(&[("per_page", "100"), ("page", &page.to_string())]);
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            request = request.header("Authorization", format!("token {token}"));
        }

        let resp = request.send().await.map_err(|source| DownloadError::Http { url: url.clone(), source })?;
        let resp = resp.error_for_status().map_err(|source| DownloadError::Http { url: url.clone(), source })?;
        let data: Vec<serde_json::Value> =
            resp.json().await.map_err(|source| DownloadError::Http { url: url.clone(), source })?;
        if data.is_empty() {
            break;
        }

        for tag in &data {
            let Some(name) = tag.get("name").and_then(|v| v.as_str()) else { continue };
            if let Some(pattern) = &pattern {
                if !pattern.is_match(name) {
                    continue;
                }
            }
            tags.push(VersionInfo { raw: name.to_string(), normalized: normalize_version(name), slicer });
        }

        page += 1;
    }

    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_url_prefers_branch_over_tag() {
        assert_eq!(
            build_zip_url("bambulab/BambuStudio", Some("v1.9.0"), Some("master")),
            "https://github.com/bambulab/BambuStudio/archive/refs/heads/master.zip"
        );
        assert_eq!(
            build_zip_url("bambulab/BambuStudio", Some("v1.9.0"), None),
            "https://github.com/bambulab/BambuStudio/archive/refs/tags/v1.9.0.zip"
        );
    }

    #[test]
    fn root_prefix_strips_v_for_tags_not_branches() {
        assert_eq!(zip_root_prefix("bambulab/BambuStudio", Some("v1.9.0"), None), "BambuStudio-1.9.0");
        assert_eq!(zip_root_prefix("bambulab/BambuStudio", None, Some("master")), "BambuStudio-master");
    }

    #[test]
    fn overlays_are_skipped_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        apply_overlays(dir.path(), dir.path(), SlicerType::BambuStudio).unwrap();
    }
}
