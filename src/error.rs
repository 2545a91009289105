//! Error types for the build inspector.

use thiserror::Error;

/// Main error type for the build inspector.
#[derive(Error, Debug)]
pub enum InspectorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provisioning failed: {0}")]
    Provision(String),

    #[error("Sandbox not ready: session is {state}")]
    NotReady { state: String },

    #[error("Cannot {operation} while sandbox session is {from}")]
    InvalidTransition { from: String, operation: &'static str },

    #[error("Hypervisor error: {0}")]
    Hypervisor(String),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Collection error: {0}")]
    Collection(#[from] CollectionError),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid whitelist pattern '{pattern}': {reason}")]
    InvalidDomainPattern { pattern: String, reason: String },

    #[error("Invalid evidence file pattern '{pattern}': {reason}")]
    InvalidPathPattern { pattern: String, reason: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),
}

/// Traffic capture errors.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture recorder failed to start: {0}")]
    StartFailed(String),

    #[error("Capture recorder failed: {0}")]
    Recorder(String),

    #[error("Capture log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Evidence bundle and archive errors.
#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("Archive member '{member}' would escape {destination}")]
    UnsafeMember { member: String, destination: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Bundle already exists: {0}")]
    BundleExists(String),

    #[error("Invalid bundle layout at {path}: {reason}")]
    InvalidLayout { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<zip::result::ZipError> for CollectionError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => CollectionError::Io(e),
            other => CollectionError::Archive(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, InspectorError>;
