//! Error types for the shellcache library.

use thiserror::Error;

/// Errors that can occur during cache lifecycle operations.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error (connection refused, DNS failure, timeout, ...).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error from on-disk storage or config loading.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file is malformed or inconsistent.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Deployment manifest is malformed or inconsistent.
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    /// Storage backend failed in a way not covered by [`Error::Io`].
    #[error("Storage error: {0}")]
    Storage(String),

    /// A fetch that must succeed returned a non-ok status.
    #[error("Fetch of {url} returned status {status}")]
    Fetch {
        /// URL that was requested.
        url: String,
        /// HTTP status code returned.
        status: u16,
    },

    /// A URL could not be parsed or resolved against the origin.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// A specialized `Result` type for shellcache operations.
pub type Result<T> = std::result::Result<T, Error>;
