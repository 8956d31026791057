//! Error types for the blob transfer engine.

use thiserror::Error;

/// Main error type for copy operations.
#[derive(Error, Debug)]
pub enum CopyError {
    /// Configuration error (invalid YAML, bad URL, unsupported topology, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The manifest could not be read locally or fetched from the server.
    #[error("Manifest unavailable for {model}: {reason}")]
    ManifestUnavailable { model: String, reason: String },

    /// HEAD on a blob returned neither 200 nor 404, so skip/upload is undecidable.
    #[error("Blob check failed for {digest}: unexpected HTTP status {status}")]
    BlobCheck { digest: String, status: u16 },

    /// Network or file failure while moving a blob.
    #[error("Transfer failed for blob {digest}: {message}")]
    Transfer { digest: String, message: String },

    /// The destination rejected the blob content (HTTP 400) or the local hash differed.
    #[error("Digest mismatch for blob {digest}: {message}")]
    DigestMismatch { digest: String, message: String },

    /// Model creation did not finish with a success status.
    #[error("Model creation failed for {model}: {status}")]
    CreateFailure { model: String, status: String },

    /// HTTP client error (connection refused, TLS, timeout, ...)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Copy was cancelled (SIGINT, etc.)
    #[error("Copy cancelled")]
    Cancelled,
}

impl CopyError {
    /// Create a Transfer error
    pub fn transfer(digest: impl Into<String>, message: impl Into<String>) -> Self {
        CopyError::Transfer {
            digest: digest.into(),
            message: message.into(),
        }
    }

    /// Create a ManifestUnavailable error
    pub fn manifest(model: impl Into<String>, reason: impl Into<String>) -> Self {
        CopyError::ManifestUnavailable {
            model: model.into(),
            reason: reason.into(),
        }
    }

    /// Map a transfer-leg IO error, keeping cancellation distinguishable.
    pub fn from_transfer_io(digest: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::Interrupted {
            CopyError::Cancelled
        } else {
            CopyError::transfer(digest, err.to_string())
        }
    }

    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            CopyError::Config(_) | CopyError::Yaml(_) => 2,
            CopyError::ManifestUnavailable { .. } => 3,
            CopyError::BlobCheck { .. } => 4,
            CopyError::Transfer { .. } | CopyError::Http(_) | CopyError::Io(_) => 5,
            CopyError::DigestMismatch { .. } => 6,
            CopyError::CreateFailure { .. } | CopyError::Json(_) => 7,
            CopyError::Cancelled => 130,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for copy operations.
pub type Result<T> = std::result::Result<T, CopyError>;
