//! Error types for the sync gateway
//!
//! Every storage, transfer and identity operation reports one of a fixed set
//! of abstract error codes. Low-level failures (I/O, serialization) are
//! carried as their own variants but always classify as [`ErrorCode::Internal`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Codes
// =============================================================================

/// Abstract error code returned to callers of the core.
///
/// New codes must be appended: the numeric values are part of the wire API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum ErrorCode {
    /// Credential is malformed or expired
    InvalidToken = 0,
    /// No credential supplied where one is required
    Unauthenticated = 1,
    /// Credential well-formed but rejected
    BadAuthenticationData = 2,
    /// Request parameters failed validation
    BadInputData = 3,
    /// Referenced path or user does not exist
    NotFound = 4,
    /// Computed checksum differs from the declared one
    BadChecksum = 5,
    /// Payload exceeds a configured limit
    TooBig = 6,
    /// Credential resolved but the user record is gone
    UserNotFound = 7,
    /// Anything else
    Internal = 8,
}

impl ErrorCode {
    /// Stable snake_case name used in API error bodies
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidToken => "invalid_token",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::BadAuthenticationData => "bad_authentication_data",
            ErrorCode::BadInputData => "bad_input_data",
            ErrorCode::NotFound => "not_found",
            ErrorCode::BadChecksum => "bad_checksum",
            ErrorCode::TooBig => "too_big",
            ErrorCode::UserNotFound => "user_not_found",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Error
// =============================================================================

/// Unified error type for the gateway
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Identity Errors
    // =========================================================================
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Bad authentication data: {0}")]
    BadAuthenticationData(String),

    #[error("User not found: {username}")]
    UserNotFound { username: String },

    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Bad input data: {0}")]
    BadInputData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Checksum mismatch: expected {expected}, computed {computed}")]
    BadChecksum { expected: String, computed: String },

    #[error("Payload too big: limit is {limit} bytes")]
    TooBig { limit: u64 },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
}

impl Error {
    /// Abstract code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidToken(_) => ErrorCode::InvalidToken,
            Error::Unauthenticated => ErrorCode::Unauthenticated,
            Error::BadAuthenticationData(_) => ErrorCode::BadAuthenticationData,
            Error::UserNotFound { .. } => ErrorCode::UserNotFound,
            Error::BadInputData(_) => ErrorCode::BadInputData,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::BadChecksum { .. } => ErrorCode::BadChecksum,
            Error::TooBig { .. } => ErrorCode::TooBig,
            Error::Internal(_)
            | Error::Configuration(_)
            | Error::Io(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorCode::Internal,
        }
    }

    /// Whether the message is safe to show to a client
    pub fn is_client_visible(&self) -> bool {
        self.code() != ErrorCode::Internal
    }

    /// Translate an I/O error on `path`, turning a missing file into `NotFound`
    pub fn from_io_at(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.to_string()),
            _ => Error::Io(err),
        }
    }
}

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;
