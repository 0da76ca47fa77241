//! Error types for the audit pipeline.

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Input validation, raised before any network activity ===
    #[error("invalid scan mode: {0} (expected quick, special or full)")]
    InvalidMode(String),

    #[error("invalid module: {0} (expected snmp, cve, mitre or tls)")]
    InvalidModule(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("signature table error: {0}")]
    Signatures(String),

    // === Host / run level ===
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("report sink error: {0}")]
    Report(#[source] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Input rejected synchronously, the caller should fix the request rather than retry.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidMode(_)
                | Error::InvalidModule(_)
                | Error::InvalidTarget(_)
                | Error::Config(_)
                | Error::Signatures(_)
        )
    }

    /// Stable code for log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidMode(_) => "INVALID_MODE",
            Error::InvalidModule(_) => "INVALID_MODULE",
            Error::InvalidTarget(_) => "INVALID_TARGET",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Signatures(_) => "SIGNATURE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Report(_) => "REPORT_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}
