use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BtcError {
    #[error("invalid resource pointer: {0}")]
    InvalidPointer(String),

    #[error("invalid base key: {0}")]
    InvalidBaseKey(String),

    #[error("invalid instance key: {0}")]
    InvalidInstanceKey(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("resource not found in catalog: {0}")]
    ResourceNotFound(String),

    #[error("resource {0} has no release; a release tag is required for caching")]
    UnreleasedResource(String),

    #[error("malformed catalog record: {0}")]
    MalformedRecord(String),

    #[error("archive is missing manifest.json")]
    #[diagnostic(help("collection archives must contain a top-level manifest.json"))]
    MissingManifest,

    #[error("unrecognized collection format tag: {0}")]
    UnrecognizedFormat(String),

    #[error("unsupported collection format version {found} (supported: {supported})")]
    UnsupportedFormatVersion { found: String, supported: String },

    #[error("malformed collection manifest: {0}")]
    MalformedManifest(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("content cache is not reachable from this environment: {0}")]
    #[diagnostic(help("retry the export without content, or from an environment with cache access"))]
    CacheUnavailable(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("content fetcher is not running")]
    FetcherUnavailable,

    #[error("download session failed: {0}")]
    FetchSession(String),

    #[error("ingredient generation failed: {0}")]
    Generation(String),
}

/// Coarse classification used to decide whether a failure aborts an
/// operation or degrades it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Input,
    Format,
    ResolutionGap,
    Enrichment,
    EnvironmentRestriction,
    Fetch,
    Network,
    Storage,
}

impl BtcError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BtcError::InvalidPointer(_)
            | BtcError::InvalidBaseKey(_)
            | BtcError::InvalidInstanceKey(_)
            | BtcError::ConfigRead(_)
            | BtcError::ConfigParse(_) => ErrorClass::Input,
            BtcError::MissingManifest
            | BtcError::UnrecognizedFormat(_)
            | BtcError::UnsupportedFormatVersion { .. }
            | BtcError::MalformedManifest(_)
            | BtcError::Archive(_) => ErrorClass::Format,
            BtcError::ResourceNotFound(_)
            | BtcError::UnreleasedResource(_)
            | BtcError::MalformedRecord(_) => ErrorClass::ResolutionGap,
            BtcError::Generation(_) => ErrorClass::Enrichment,
            BtcError::CacheUnavailable(_) => ErrorClass::EnvironmentRestriction,
            BtcError::FetcherUnavailable | BtcError::FetchSession(_) => ErrorClass::Fetch,
            BtcError::CatalogHttp(_) | BtcError::CatalogStatus { .. } => ErrorClass::Network,
            BtcError::Store(_) | BtcError::Filesystem(_) | BtcError::Serialization(_) => {
                ErrorClass::Storage
            }
        }
    }

    /// Whether the failure aborts the whole operation rather than degrading it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Format | ErrorClass::EnvironmentRestriction
        )
    }
}
