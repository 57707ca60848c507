//! CLI entry point: subcommands over the ingestion, store, and mapping
//! library (§4.N). Grounded in `original_source/__main__.py`, with the
//! logging/tracing bootstrap and watcher loop kept from the teacher's
//! `main.rs`.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use derive_more::{Display, Error, From};
use directories::ProjectDirs;
use notify::{
    Event, EventKind, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use profile_forge::error::{MappingError, PipelineError, ReconcileError, StoreError};
use profile_forge::index::ProfileIndex;
use profile_forge::mapping;
use profile_forge::model::{ProfileType, SlicerType};
use profile_forge::pipeline::ProfilePipeline;
use profile_forge::progress::{NullProgressReporter, ProgressReporter, TerminalProgressReporter};
use profile_forge::reconciler::{self, MappingReport};
use profile_forge::store::ProfileStore;

#[derive(Debug, Display, Error, From)]
enum CliError {
    Pipeline(PipelineError),
    Store(StoreError),
    Mapping(MappingError),
    Reconcile(ReconcileError),
    Notify(notify::Error),
    Io(std::io::Error),
}

fn parse_slicer(s: &str) -> Result<SlicerType, String> {
    SlicerType::parse(s).ok_or_else(|| format!("unknown slicer '{s}' (expected one of: {})", slicer_choices()))
}

fn parse_profile_type(s: &str) -> Result<ProfileType, String> {
    ProfileType::parse(s).ok_or_else(|| format!("unknown profile type '{s}'"))
}

fn slicer_choices() -> String {
    SlicerType::ALL.iter().map(|s| s.value()).collect::<Vec<_>>().join(", ")
}

#[derive(Parser)]
#[command(
    name = "profile-forge",
    about = "Slicer profile ingestion, diffing, and mapping",
    after_help = "Environment variables:\n  GITHUB_TOKEN              GitHub API token (increases rate limit)\n  SP_API_URL                SimplyPrint printer model endpoint URL\n  SLICER_PROFILES_STORE     Default store directory (instead of \"profiles\")\n  SLICER_PROFILES_OVERLAY   Default overlay directory (instead of \"overlay\")"
)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,
    /// Suppress non-error output (logging only)
    #[arg(long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest profiles from a local slicer directory into the store
    IngestLocal {
        #[arg(value_parser = parse_slicer)]
        slicer: SlicerType,
        version: String,
        profiles_dir: PathBuf,
        #[arg(long, short = 's')]
        store: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Download, squash, parse, and store profiles from GitHub
    Ingest {
        #[arg(value_parser = parse_slicer)]
        slicer: SlicerType,
        #[arg(long, short = 'v', default_value = "latest")]
        version: String,
        #[arg(long = "type", value_parser = parse_profile_type)]
        profile_type: Vec<ProfileType>,
        #[arg(long, short = 's')]
        store: Option<PathBuf>,
        #[arg(long)]
        overlay: Option<PathBuf>,
        #[arg(long)]
        fetch_defaults: bool,
        #[arg(long)]
        all_versions: bool,
        #[arg(long)]
        clean: bool,
        #[arg(long)]
        json: bool,
    },
    /// Ingest profiles for all slicers sequentially from GitHub
    IngestAll {
        #[arg(long, short = 'v', default_value = "latest")]
        version: String,
        #[arg(long, short = 's')]
        store: Option<PathBuf>,
        #[arg(long)]
        overlay: Option<PathBuf>,
        #[arg(long)]
        clean: bool,
        #[arg(long)]
        fetch_defaults: bool,
        #[arg(long)]
        all_versions: bool,
        #[arg(long, value_parser = parse_slicer)]
        skip: Vec<SlicerType>,
        #[arg(long)]
        json: bool,
    },
    /// Show setting changes between two versions
    Diff {
        #[arg(value_parser = parse_slicer)]
        slicer: SlicerType,
        from_version: String,
        to_version: String,
        #[arg(long)]
        profile: Option<String>,
        #[arg(long)]
        vendor: Option<String>,
        #[arg(long = "type", default_value = "filament", value_parser = parse_profile_type)]
        profile_type: ProfileType,
        #[arg(long, short = 's')]
        store: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List ingested versions for a slicer
    Versions {
        #[arg(value_parser = parse_slicer)]
        slicer: SlicerType,
        #[arg(long, short = 's')]
        store: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List stored profiles for a slicer
    List {
        #[arg(value_parser = parse_slicer)]
        slicer: SlicerType,
        #[arg(long = "type", value_parser = parse_profile_type)]
        profile_type: Option<ProfileType>,
        #[arg(long, short = 's')]
        store: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Snapshot a profile's settings at a specific version
    Evaluate {
        #[arg(value_parser = parse_slicer)]
        slicer: SlicerType,
        version: String,
        vendor: String,
        profile: String,
        #[arg(long = "type", default_value = "filament", value_parser = parse_profile_type)]
        profile_type: ProfileType,
        #[arg(long, short = 's')]
        store: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Run the full mapping pipeline: match models, map filaments, map print profiles, export
    Map {
        #[arg(long, short = 's')]
        store: Option<PathBuf>,
        #[arg(long, short = 'o', default_value = "out")]
        output: PathBuf,
        #[arg(long, value_parser = parse_slicer)]
        skip: Vec<SlicerType>,
        #[arg(long)]
        ofd_path: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Run OFD forward mapping: derive slicer_settings/slicer_ids from the profile store
    OfdMap {
        #[arg(long, required = true)]
        ofd_path: PathBuf,
        #[arg(long, short = 's')]
        store: Option<PathBuf>,
        #[arg(long, value_parser = parse_slicer)]
        slicer: Vec<SlicerType>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        brand: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Watch a local slicer config directory and ingest changed files as they land
    Watch {
        #[arg(value_parser = parse_slicer)]
        slicer: SlicerType,
        version: String,
        watch_dir: Option<PathBuf>,
        #[arg(long, short = 's')]
        store: Option<PathBuf>,
    },
}

fn default_store() -> PathBuf {
    PathBuf::from(std::env::var("SLICER_PROFILES_STORE").unwrap_or_else(|_| "profiles".to_string()))
}

fn default_overlay() -> PathBuf {
    PathBuf::from(std::env::var("SLICER_PROFILES_OVERLAY").unwrap_or_else(|_| "overlay".to_string()))
}

fn store_path(store: Option<PathBuf>) -> PathBuf {
    store.unwrap_or_else(default_store)
}

fn make_reporter(json: bool) -> Box<dyn ProgressReporter> {
    if json {
        Box::new(NullProgressReporter)
    } else {
        Box::new(TerminalProgressReporter)
    }
}

/// `--all-versions` makes many GitHub API calls and is rate-limited much
/// lower without a token.
fn check_github_token(required: bool) {
    if std::env::var("GITHUB_TOKEN").is_err() {
        if required {
            warn!("GITHUB_TOKEN is not set; GitHub API rate limits will apply");
        } else {
            debug!("GITHUB_TOKEN is not set; GitHub API rate limits will apply");
        }
    }
}

fn print_report_json(report: &profile_forge::model::IngestionReport) {
    println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
}

fn print_report_human(report: &profile_forge::model::IngestionReport, heading: &str) {
    println!("\n{heading}:");
    println!("  Profiles processed: {}", report.profiles_processed);
    println!("  Added:     {}", report.added.len());
    println!("  Changed:   {}", report.changed.len());
    println!("  Unchanged: {}", report.unchanged);
    println!("  Removed:   {}", report.removed.len());

    if !report.added.is_empty() {
        println!("\nNew profiles:");
        for name in report.added.iter().take(20) {
            println!("  + {name}");
        }
        if report.added.len() > 20 {
            println!("  ... and {} more", report.added.len() - 20);
        }
    }

    if !report.changed.is_empty() {
        println!("\nChanged profiles:");
        for (name, keys) in report.changed.iter().take(20) {
            println!("  ~ {name} ({} settings)", keys.len());
        }
        if report.changed.len() > 20 {
            println!("  ... and {} more", report.changed.len() - 20);
        }
    }

    if !report.removed.is_empty() {
        println!("\nRemoved profiles:");
        for key in report.removed.iter().take(20) {
            println!("  - {key}");
        }
    }
}

async fn run_ingest_local(
    slicer: SlicerType,
    version: String,
    profiles_dir: PathBuf,
    store: Option<PathBuf>,
    json: bool,
) -> Result<i32, CliError> {
    if !profiles_dir.exists() {
        error!("Profiles directory '{}' does not exist", profiles_dir.display());
        return Ok(1);
    }

    let store = ProfileStore::new(store_path(store));
    println!("Ingesting {} {version} from {}...", slicer.value(), profiles_dir.display());
    let report = store.ingest(slicer, &version, &profiles_dir)?;

    if json {
        print_report_json(&report);
    } else {
        print_report_human(&report, "Ingestion complete");
    }
    Ok(0)
}

#[allow(clippy::too_many_arguments)]
async fn run_ingest(
    slicer: SlicerType,
    version: String,
    profile_type: Vec<ProfileType>,
    store: Option<PathBuf>,
    overlay: Option<PathBuf>,
    fetch_defaults: bool,
    all_versions: bool,
    clean: bool,
    json: bool,
) -> Result<i32, CliError> {
    let reporter = make_reporter(json);
    check_github_token(all_versions);

    let store_path = store_path(store);
    let store_handle = ProfileStore::new(&store_path);

    if clean {
        let slicer_dir = store_path.join(slicer.value());
        if slicer_dir.exists() {
            std::fs::remove_dir_all(&slicer_dir)?;
            reporter.update_status(&format!("Cleaned {}", slicer_dir.display()));
        }
    }

    let overlay_dir = overlay.unwrap_or_else(default_overlay);
    let profile_types = if profile_type.is_empty() { None } else { Some(profile_type.as_slice()) };

    let pipeline = ProfilePipeline::new(&store_handle)
        .with_overlay_dir(overlay_dir)
        .with_reporter(reporter.as_ref());

    if all_versions {
        reporter.update_status(&format!("Ingesting all versions for {}...", slicer.value()));
        let reports = pipeline.ingest_all_versions(slicer, profile_types).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&reports).unwrap_or_default());
        } else {
            println!("\nIngested {} versions:", reports.len());
            for r in &reports {
                println!(
                    "  {}: {} profiles ({} added, {} changed)",
                    r.version,
                    r.profiles_processed,
                    r.added.len(),
                    r.changed.len()
                );
            }
        }
    } else {
        let report = pipeline.ingest(slicer, &version, profile_types, fetch_defaults).await?;
        if json {
            print_report_json(&report);
        } else {
            print_report_human(&report, "Pipeline complete");
        }
    }

    Ok(0)
}

#[allow(clippy::too_many_arguments)]
async fn run_ingest_all(
    version: String,
    store: Option<PathBuf>,
    overlay: Option<PathBuf>,
    clean: bool,
    fetch_defaults: bool,
    all_versions: bool,
    skip: Vec<SlicerType>,
    json: bool,
) -> Result<i32, CliError> {
    let reporter = make_reporter(json);
    check_github_token(false);

    let store_path = store_path(store);
    let store_handle = ProfileStore::new(&store_path);
    let overlay_dir = overlay.unwrap_or_else(default_overlay);

    let slicers: Vec<SlicerType> = SlicerType::ALL.into_iter().filter(|s| !skip.contains(s)).collect();

    let pipeline = ProfilePipeline::new(&store_handle)
        .with_overlay_dir(overlay_dir)
        .with_reporter(reporter.as_ref());

    if all_versions {
        check_github_token(false);
    }

    let mut reports = Vec::new();
    let mut errors: Vec<(String, String)> = Vec::new();
    let total = slicers.len();

    for (i, slicer) in slicers.into_iter().enumerate() {
        reporter.step(&format!("Processing {}", slicer.value()), i + 1, total);

        if clean {
            let slicer_dir = store_path.join(slicer.value());
            if slicer_dir.exists() {
                std::fs::remove_dir_all(&slicer_dir)?;
                reporter.update_status(&format!("Cleaned {}", slicer_dir.display()));
            }
        }

        let outcome = if all_versions {
            pipeline.ingest_all_versions(slicer, None).await
        } else {
            pipeline.ingest(slicer, &version, None, fetch_defaults).await.map(|r| vec![r])
        };

        match outcome {
            Ok(sub_reports) => reports.extend(sub_reports),
            Err(e) => {
                errors.push((slicer.value().to_string(), e.to_string()));
                reporter.update_status(&format!("Error processing {}: {e}", slicer.value()));
            }
        }
    }

    if json {
        #[derive(serde::Serialize)]
        struct AllReport<'a> {
            reports: &'a [profile_forge::model::IngestionReport],
            errors: &'a [(String, String)],
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&AllReport { reports: &reports, errors: &errors }).unwrap_or_default()
        );
    } else {
        reporter.update_status("Pipeline complete!");
        let total_profiles: usize = reports.iter().map(|r| r.profiles_processed).sum();
        let total_added: usize = reports.iter().map(|r| r.added.len()).sum();
        let total_changed: usize = reports.iter().map(|r| r.changed.len()).sum();
        println!("\n  Total: {total_profiles} profiles ({total_added} added, {total_changed} changed)\n");
        for r in &reports {
            println!(
                "  {}: {} profiles ({} added, {} changed)",
                r.slicer.map(|s| s.value()).unwrap_or_default(),
                r.profiles_processed,
                r.added.len(),
                r.changed.len()
            );
        }
        if !errors.is_empty() {
            println!("\n  Errors ({}):", errors.len());
            for (slicer_name, err) in &errors {
                println!("    {slicer_name}: {err}");
            }
        }
    }

    if !errors.is_empty() && reports.is_empty() {
        return Ok(1);
    }
    if !errors.is_empty() {
        return Ok(2);
    }
    Ok(0)
}

fn run_diff(
    slicer: SlicerType,
    from_version: String,
    to_version: String,
    profile: Option<String>,
    vendor: Option<String>,
    profile_type: ProfileType,
    store: Option<PathBuf>,
    json: bool,
) -> Result<i32, CliError> {
    let store = ProfileStore::new(store_path(store));

    if let Some(profile_name) = profile {
        let Some(vendor) = vendor else {
            error!("--vendor is required when using --profile");
            return Ok(1);
        };

        let Some(stored) = store.get(slicer, profile_type, &vendor, &profile_name)? else {
            error!("Profile not found: {vendor}/{profile_name}");
            return Ok(1);
        };

        let changes = stored.changed_settings(&from_version, &to_version);
        if json {
            println!("{}", serde_json::to_string_pretty(&changes).unwrap_or_default());
        } else if changes.is_empty() {
            println!("No changes.");
        } else {
            println!("Changes in {vendor}/{profile_name} ({from_version} -> {to_version}):");
            for (key, (old, new)) in &changes {
                println!("  {key}: {old:?} -> {new:?}");
            }
        }
    } else {
        let profiles = store.list_profiles(slicer, Some(profile_type))?;
        let mut all_changes = indexmap::IndexMap::new();
        for p in &profiles {
            let changes = p.changed_settings(&from_version, &to_version);
            if !changes.is_empty() {
                all_changes.insert(format!("{}/{}", p.vendor, p.name), changes);
            }
        }

        if json {
            println!("{}", serde_json::to_string_pretty(&all_changes).unwrap_or_default());
        } else if all_changes.is_empty() {
            println!("No changes between versions.");
        } else {
            println!("Changes ({from_version} -> {to_version}):");
            for (profile_key, changes) in &all_changes {
                println!("\n  {profile_key}:");
                for (key, (old, new)) in changes {
                    println!("    {key}: {old:?} -> {new:?}");
                }
            }
        }
    }

    Ok(0)
}

fn run_versions(slicer: SlicerType, store: Option<PathBuf>, json: bool) -> Result<i32, CliError> {
    let store = ProfileStore::new(store_path(store));
    let versions = store.get_versions(slicer);

    if json {
        #[derive(serde::Serialize)]
        struct Out {
            slicer: &'static str,
            versions: Vec<String>,
        }
        println!("{}", serde_json::to_string_pretty(&Out { slicer: slicer.value(), versions }).unwrap_or_default());
    } else if versions.is_empty() {
        println!("No versions ingested for {}", slicer.value());
    } else {
        println!("Ingested versions for {}:", slicer.value());
        for v in versions {
            println!("  {v}");
        }
    }

    Ok(0)
}

fn run_list(slicer: SlicerType, profile_type: Option<ProfileType>, store: Option<PathBuf>, json: bool) -> Result<i32, CliError> {
    let store = ProfileStore::new(store_path(store));
    let profiles = store.list_profiles(slicer, profile_type)?;

    if json {
        #[derive(serde::Serialize)]
        struct Out<'a> {
            name: &'a str,
            vendor: &'a str,
            profile_type: &'static str,
            first_seen: &'a str,
            last_seen: &'a str,
            filament_id: &'a Option<String>,
            settings_count: usize,
        }
        let out: Vec<Out> = profiles
            .iter()
            .map(|p| Out {
                name: &p.name,
                vendor: &p.vendor,
                profile_type: p.profile_type.value(),
                first_seen: &p.first_seen,
                last_seen: &p.last_seen,
                filament_id: &p.filament_id,
                settings_count: p.settings.len(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
    } else if profiles.is_empty() {
        println!("No profiles found for {}", slicer.value());
    } else {
        println!("Profiles for {} ({} total):", slicer.value(), profiles.len());
        let mut sorted = profiles;
        sorted.sort_by(|a, b| (&a.vendor, &a.name).cmp(&(&b.vendor, &b.name)));
        for p in &sorted {
            println!("  {}/{} ({}, {} settings)", p.vendor, p.name, p.profile_type.value(), p.settings.len());
        }
    }

    Ok(0)
}

fn run_evaluate(
    slicer: SlicerType,
    version: String,
    vendor: String,
    profile: String,
    profile_type: ProfileType,
    store: Option<PathBuf>,
    json: bool,
) -> Result<i32, CliError> {
    let store = ProfileStore::new(store_path(store));
    let Some(stored) = store.get(slicer, profile_type, &vendor, &profile)? else {
        error!("Profile not found: {vendor}/{profile} ({})", profile_type.value());
        return Ok(1);
    };

    let snapshot = stored.evaluate(&version);

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot).unwrap_or_default());
    } else {
        println!("{vendor}/{} @ {version}", stored.name);
        println!("  Type:       {}", stored.profile_type.value());
        println!("  First seen: {}", stored.first_seen);
        println!("  Last seen:  {}", stored.last_seen);
        println!("  Settings:   {}", snapshot.len());
        println!();
        let mut keys: Vec<&String> = snapshot.keys().collect();
        keys.sort();
        for key in keys {
            let mut val_str = snapshot[key].to_string();
            if val_str.len() > 100 {
                val_str.truncate(97);
                val_str.push_str("...");
            }
            println!("  {key}: {val_str}");
        }
    }

    Ok(0)
}

async fn run_map(
    store: Option<PathBuf>,
    output: PathBuf,
    skip: Vec<SlicerType>,
    ofd_path: Option<PathBuf>,
    json: bool,
) -> Result<i32, CliError> {
    let reporter = make_reporter(json);
    let store_handle = ProfileStore::new(store_path(store));
    let slicers: Vec<SlicerType> = if skip.is_empty() {
        Vec::new()
    } else {
        SlicerType::ALL.into_iter().filter(|s| !skip.contains(s)).collect()
    };
    let slicer_filter = if slicers.is_empty() { None } else { Some(slicers.as_slice()) };

    reporter.update_status("Running mapping pipeline...");

    let ofd_path = ofd_path.or_else(|| std::env::var("OFD_REPO_PATH").ok().map(PathBuf::from));
    let api_url = mapping::sp_api_url_from_env()?;

    let model_map =
        mapping::run_mapping_pipeline(&store_handle, &output, slicer_filter, ofd_path.as_deref(), &api_url).await?;

    if json {
        #[derive(serde::Serialize)]
        struct Out<'a> {
            models_mapped: usize,
            failed_brands: Vec<&'a String>,
            failed_models: Vec<&'a String>,
            output_dir: String,
        }
        let mut failed_brands: Vec<&String> = model_map.failed_brands.iter().collect();
        failed_brands.sort();
        let mut failed_models: Vec<&String> = model_map.failed_models.iter().collect();
        failed_models.sort();
        println!(
            "{}",
            serde_json::to_string_pretty(&Out {
                models_mapped: model_map.model_to_profiles.len(),
                failed_brands,
                failed_models,
                output_dir: output.display().to_string(),
            })
            .unwrap_or_default()
        );
    } else {
        reporter.update_status("Mapping complete!");
        println!("\nMapping complete:");
        println!("  Models mapped:  {}", model_map.model_to_profiles.len());
        println!("  Failed brands:  {}", model_map.failed_brands.len());
        println!("  Failed models:  {}", model_map.failed_models.len());
        println!("  Output:         {}", output.display());

        if !model_map.failed_brands.is_empty() {
            let mut brands: Vec<&String> = model_map.failed_brands.iter().collect();
            brands.sort();
            println!("\n  Unmatched brands:");
            for b in brands {
                println!("    - {b}");
            }
        }

        if !model_map.failed_models.is_empty() {
            let mut models: Vec<&String> = model_map.failed_models.iter().collect();
            models.sort();
            println!("\n  Unmatched models:");
            for m in models.iter().take(30) {
                println!("    - {m}");
            }
            if models.len() > 30 {
                println!("    ... and {} more", models.len() - 30);
            }
        }
    }

    Ok(0)
}

fn filter_report_by_brand(report: MappingReport, ofd_path: &Path, brand: &str) -> MappingReport {
    let matches_brand = |path: &Path| -> bool {
        path.strip_prefix(ofd_path)
            .ok()
            .and_then(|rel| rel.components().next())
            .map(|c| c.as_os_str() == brand)
            .unwrap_or(false)
    };
    MappingReport {
        updated: report.updated.into_iter().filter(|r| matches_brand(&r.filament_path)).collect(),
        already_correct: report.already_correct.into_iter().filter(|r| matches_brand(&r.filament_path)).collect(),
        conflicts: report.conflicts.into_iter().filter(|c| matches_brand(&c.filament_path)).collect(),
        skipped: report.skipped.into_iter().filter(|(p, _)| matches_brand(p)).collect(),
    }
}

fn run_ofd_map(
    ofd_path: PathBuf,
    store: Option<PathBuf>,
    slicer: Vec<SlicerType>,
    dry_run: bool,
    brand: Option<String>,
    json: bool,
) -> Result<i32, CliError> {
    let store_path = store_path(store);
    if !ofd_path.exists() {
        error!("OFD data directory '{}' does not exist", ofd_path.display());
        return Ok(1);
    }
    if !store_path.exists() {
        error!("Store directory '{}' does not exist", store_path.display());
        return Ok(1);
    }

    let store_handle = ProfileStore::new(&store_path);
    let slicer_filter = if slicer.is_empty() { None } else { Some(slicer.as_slice()) };
    let index = ProfileIndex::build(&store_handle, slicer_filter)?;

    let report = reconciler::reconcile(&index, &ofd_path, slicer_filter, dry_run)?;
    let report = match &brand {
        Some(brand) => filter_report_by_brand(report, &ofd_path, brand),
        None => report,
    };

    if json {
        #[derive(serde::Serialize)]
        struct UpdatedOut<'a> {
            filament: String,
            slicer: &'a str,
            profile_name: &'a str,
            slicer_id: &'a Option<String>,
            generic_id: &'a Option<String>,
            vendor: &'a str,
        }
        #[derive(serde::Serialize)]
        struct CorrectOut<'a> {
            filament: String,
            slicer: &'a str,
            profile_name: &'a str,
        }
        #[derive(serde::Serialize)]
        struct ConflictOut<'a> {
            filament: String,
            slicer: &'a str,
            field: &'static str,
            existing: &'a str,
            derived: &'a str,
        }
        #[derive(serde::Serialize)]
        struct SkippedOut {
            path: String,
            reason: String,
        }
        #[derive(serde::Serialize)]
        struct Out<'a> {
            updated: Vec<UpdatedOut<'a>>,
            already_correct: Vec<CorrectOut<'a>>,
            conflicts: Vec<ConflictOut<'a>>,
            skipped: Vec<SkippedOut>,
        }
        let out = Out {
            updated: report
                .updated
                .iter()
                .map(|r| UpdatedOut {
                    filament: r.filament_path.display().to_string(),
                    slicer: &r.slicer,
                    profile_name: &r.profile_name,
                    slicer_id: &r.slicer_id,
                    generic_id: &r.generic_id,
                    vendor: &r.vendor,
                })
                .collect(),
            already_correct: report
                .already_correct
                .iter()
                .map(|r| CorrectOut { filament: r.filament_path.display().to_string(), slicer: &r.slicer, profile_name: &r.profile_name })
                .collect(),
            conflicts: report
                .conflicts
                .iter()
                .map(|c| ConflictOut {
                    filament: c.filament_path.display().to_string(),
                    slicer: &c.slicer,
                    field: c.field,
                    existing: &c.existing,
                    derived: &c.derived,
                })
                .collect(),
            skipped: report
                .skipped
                .iter()
                .map(|(p, reason)| SkippedOut { path: p.display().to_string(), reason: reason.clone() })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
        return Ok(0);
    }

    if !report.conflicts.is_empty() {
        eprintln!("CONFLICTS FOUND — no changes written:\n");
        for c in &report.conflicts {
            eprintln!(
                "  {} [{}] {}: existing={:?} vs derived={:?}",
                c.filament_path.display(),
                c.slicer,
                c.field,
                c.existing,
                c.derived
            );
        }
        eprintln!("\n{} conflict(s). Fix these in filament.json before re-running.", report.conflicts.len());
        return Ok(1);
    }

    let action = if dry_run { "Would update" } else { "Updated" };

    if !report.updated.is_empty() {
        println!("\n{action} {} mapping(s):", report.updated.len());
        for r in &report.updated {
            let id_str = r.slicer_id.as_ref().map(|id| format!(" (id={id})")).unwrap_or_default();
            let gid_str = r.generic_id.as_ref().map(|id| format!(" (generic_id={id})")).unwrap_or_default();
            println!("  {} [{}] -> {}{id_str}{gid_str}", r.filament_path.display(), r.slicer, r.profile_name);
        }
    }

    if !report.already_correct.is_empty() {
        println!("\nAlready correct: {}", report.already_correct.len());
    }

    if !report.skipped.is_empty() {
        println!("\nSkipped: {}", report.skipped.len());
        for (path, reason) in report.skipped.iter().take(10) {
            println!("  {}: {reason}", path.display());
        }
        if report.skipped.len() > 10 {
            println!("  ... and {} more", report.skipped.len() - 10);
        }
    }

    println!("\nTotal matched: {}", report.updated.len() + report.already_correct.len());
    Ok(0)
}

async fn run_watch(slicer: SlicerType, version: String, watch_dir: Option<PathBuf>, store: Option<PathBuf>) -> Result<i32, CliError> {
    let watch_dir = match watch_dir {
        Some(dir) => dir,
        None => {
            let proj_dirs = ProjectDirs::from("", "", slicer_project_dir_name(slicer))
                .ok_or_else(|| CliError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no config directory found")))?;
            proj_dirs.config_dir().to_path_buf()
        }
    };

    let store_handle = ProfileStore::new(store_path(store));
    info!("Watching {} for {} profile changes", watch_dir.display(), slicer.value());

    watch_and_ingest(&store_handle, slicer, &version, &watch_dir)?;
    Ok(0)
}

fn slicer_project_dir_name(slicer: SlicerType) -> &'static str {
    match slicer {
        SlicerType::OrcaSlicer => "OrcaSlicer",
        SlicerType::BambuStudio => "BambuStudio",
        SlicerType::PrusaSlicer => "PrusaSlicer",
        SlicerType::SuperSlicer => "SuperSlicer",
        SlicerType::Cura => "cura",
        SlicerType::ElegooSlicer => "ElegooSlicer",
    }
}

fn watch_and_ingest(store: &ProfileStore, slicer: SlicerType, version: &str, watch_dir: &Path) -> Result<(), CliError> {
    let (tx, rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(tx)?;
    watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;

    for res in rx {
        match res {
            Ok(event) => {
                debug!(?event);
                match event.kind {
                    EventKind::Create(CreateKind::File | CreateKind::Any)
                    | EventKind::Modify(ModifyKind::Any | ModifyKind::Data(_) | ModifyKind::Other) => {
                        match store.ingest(slicer, version, watch_dir) {
                            Ok(report) => info!(
                                added = report.added.len(),
                                changed = report.changed.len(),
                                "re-ingested {} after change",
                                slicer.value()
                            ),
                            Err(e) => warn!("ingest failed after watch event: {e}"),
                        }
                    }
                    _ => {}
                }
            }
            Err(e) => warn!("watch error: {e:?}"),
        }
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let result = match cli.command {
        Command::IngestLocal { slicer, version, profiles_dir, store, json } => {
            run_ingest_local(slicer, version, profiles_dir, store, json).await
        }
        Command::Ingest {
            slicer,
            version,
            profile_type,
            store,
            overlay,
            fetch_defaults,
            all_versions,
            clean,
            json,
        } => run_ingest(slicer, version, profile_type, store, overlay, fetch_defaults, all_versions, clean, json).await,
        Command::IngestAll { version, store, overlay, clean, fetch_defaults, all_versions, skip, json } => {
            run_ingest_all(version, store, overlay, clean, fetch_defaults, all_versions, skip, json).await
        }
        Command::Diff { slicer, from_version, to_version, profile, vendor, profile_type, store, json } => {
            run_diff(slicer, from_version, to_version, profile, vendor, profile_type, store, json)
        }
        Command::Versions { slicer, store, json } => run_versions(slicer, store, json),
        Command::List { slicer, profile_type, store, json } => run_list(slicer, profile_type, store, json),
        Command::Evaluate { slicer, version, vendor, profile, profile_type, store, json } => {
            run_evaluate(slicer, version, vendor, profile, profile_type, store, json)
        }
        Command::Map { store, output, skip, ofd_path, json } => run_map(store, output, skip, ofd_path, json).await,
        Command::OfdMap { ofd_path, store, slicer, dry_run, brand, json } => {
            run_ofd_map(ofd_path, store, slicer, dry_run, brand, json)
        }
        Command::Watch { slicer, version, watch_dir, store } => run_watch(slicer, version, watch_dir, store).await,
    };

    match result {
        Ok(code) => std::process::ExitCode::from(code as u8),
        Err(e) => {
            error!("{e}");
            std::process::ExitCode::FAILURE
        }
    }
}
