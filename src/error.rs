//! Error taxonomy. One enum per fallible subsystem, composed with `derive_more`
//! the way the teacher's `main.rs` builds its top-level `Error` enum, folding
//! into a single `PipelineError` for anything that crosses module boundaries.

use derive_more::{Display, Error, From};
use std::path::PathBuf;

#[derive(Debug, Display, Error, From)]
pub enum ParseError {
    #[display("io error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[display("malformed json in {path:?}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[display("malformed xml in {path:?}: {source}")]
    Xml {
        path: PathBuf,
        source: quick_xml::DeError,
    },
    #[display("unrecognized profile shape in {path:?}")]
    UnrecognizedShape { path: PathBuf },
}

#[derive(Debug, Display, Error, From)]
pub enum SquashError {
    #[display("unresolved inherits target {target:?} for profile {profile:?}")]
    UnresolvedInherits { profile: String, target: String },
    #[display("cyclic inherits detected at profile {profile:?}")]
    CyclicInherits { profile: String },
    #[display("ini tokenizer failed for {path:?} even after whitespace recovery: {reason}")]
    IniTokenize { path: PathBuf, reason: String },
    #[display("io error: {_0}")]
    Io(std::io::Error),
}

#[derive(Debug, Display, Error, From)]
pub enum StoreError {
    #[display("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[display("malformed stored profile json at {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Display, Error, From)]
pub enum ConditionError {
    #[display("unbalanced parentheses in condition: {expr}")]
    UnbalancedParens { expr: String },
}

#[derive(Debug, Display, Error, From)]
pub enum DownloadError {
    #[display("http error fetching {url}: {source}")]
    Http {
        url: String,
        source: reqwest::Error,
    },
    #[display("archive fetch for {url} returned 404")]
    NotFound { url: String },
    #[display("zip read error: {_0}")]
    Zip(zip::result::ZipError),
    #[display("io error: {_0}")]
    Io(std::io::Error),
}

#[derive(Debug, Display, Error, From)]
pub enum ReconcileError {
    #[display("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[display("malformed filament db entry at {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Display, Error, From)]
pub enum MappingError {
    #[display("SP_API_URL is not set; point it at the SimplyPrint printer model endpoint")]
    MissingApiUrl,
    #[display("http error fetching SimplyPrint model data: {_0}")]
    Http(reqwest::Error),
    #[display("store error: {_0}")]
    Store(StoreError),
    #[display("io error: {_0}")]
    Io(std::io::Error),
    #[display("malformed json: {_0}")]
    Json(serde_json::Error),
}

/// Top-level error, matching the three-plus-one failure classes of §6/§7:
/// download, parse (only ever propagated from a fatal store-boundary call,
/// not from the per-file swallow), store, and squash.
#[derive(Debug, Display, Error, From)]
pub enum PipelineError {
    Download(DownloadError),
    Parse(ParseError),
    Store(StoreError),
    Squash(SquashError),
    Condition(ConditionError),
    Reconcile(ReconcileError),
    Mapping(MappingError),
}
