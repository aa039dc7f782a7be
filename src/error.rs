//! Error types for persona-relay
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Wire-safe messages for session replies
//! - Close codes for refused connections

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection and identity errors (3xx)
    Unauthenticated = 300,
    Forbidden = 301,
    TransportFailed = 302,

    // Request errors (4xx)
    BadRequest = 400,
    MalformedJson = 401,

    // Completion service errors (5xx)
    UpstreamStatus = 500,
    UpstreamTimeout = 501,
    UpstreamMalformed = 502,
    UpstreamUnreachable = 503,
    UpstreamUnreadable = 504,

    // Storage errors (6xx)
    StorageFailed = 600,
    UserNotFound = 601,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            600..=699 => 60,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection and Identity Errors
    // ─────────────────────────────────────────────────────────────

    /// Credential missing, invalid, expired or bound to an unknown user
    #[error("Authentication failed: {reason}")]
    Unauthenticated { reason: String },

    /// Persona existence check failed on the strict admission path
    #[error("Persona '{persona}' is not available")]
    Forbidden { persona: String },

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // ─────────────────────────────────────────────────────────────
    // Request Errors
    // ─────────────────────────────────────────────────────────────

    /// Client request is missing a field or carries an invalid value.
    /// The message is sent to the client verbatim.
    #[error("{0}")]
    BadRequest(String),

    /// Inbound frame is not well-formed JSON
    #[error("Invalid message format. Please send a valid JSON.")]
    MalformedJson,

    // ─────────────────────────────────────────────────────────────
    // Completion Service Errors
    // ─────────────────────────────────────────────────────────────

    /// Non-success HTTP status from the completion service
    #[error("Completion service returned status {status}")]
    UpstreamStatus { status: u16, body: String },

    /// Completion service did not answer within the configured bound
    #[error("Completion service timed out after {timeout_secs}s")]
    UpstreamTimeout { timeout_secs: u64 },

    /// Response body did not have the expected shape
    #[error("Malformed completion response: {message}")]
    UpstreamMalformed { message: String },

    /// Success status but the body was not JSON
    #[error("Unreadable completion response: {message}")]
    UpstreamUnreadable { message: String },

    /// Transport-level failure reaching the completion service
    #[error("Completion service unreachable: {0}")]
    Upstream(String),

    // ─────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────

    /// SQLite failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// No user with the given handle
    #[error("User not found: {handle}")]
    UserNotFound { handle: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::InternalError,

            Error::Unauthenticated { .. } => ErrorCode::Unauthenticated,
            Error::Forbidden { .. } => ErrorCode::Forbidden,
            Error::WebSocket(_) => ErrorCode::TransportFailed,

            Error::BadRequest(_) => ErrorCode::BadRequest,
            Error::MalformedJson => ErrorCode::MalformedJson,

            Error::UpstreamStatus { .. } => ErrorCode::UpstreamStatus,
            Error::UpstreamTimeout { .. } => ErrorCode::UpstreamTimeout,
            Error::UpstreamMalformed { .. } => ErrorCode::UpstreamMalformed,
            Error::UpstreamUnreadable { .. } => ErrorCode::UpstreamUnreadable,
            Error::Upstream(_) => ErrorCode::UpstreamUnreachable,

            Error::Storage(_) => ErrorCode::StorageFailed,
            Error::UserNotFound { .. } => ErrorCode::UserNotFound,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if a completion call failing with this error may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::UpstreamStatus { status, .. } => *status == 429 || *status >= 500,
            Error::UpstreamTimeout { .. } | Error::Upstream(_) => true,
            _ => false,
        }
    }

    /// Check if the error belongs to the completion service category
    pub fn is_upstream(&self) -> bool {
        (500..600).contains(&(self.code() as u16))
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    /// Rejection to send when this error ends connection admission
    pub fn rejection(&self) -> Rejection {
        match self {
            Error::Unauthenticated { .. } => Rejection::Unauthenticated,
            Error::Forbidden { .. } => Rejection::Forbidden,
            Error::BadRequest(_) => Rejection::BadRequest,
            _ => Rejection::Internal,
        }
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Text placed in an `{"error": ...}` reply.
    ///
    /// Request errors are echoed as-is; completion failures get a fixed
    /// phrase; everything else is reduced to its code.
    pub fn client_message(&self) -> String {
        match self {
            Error::BadRequest(message) => message.clone(),
            Error::MalformedJson => self.to_string(),
            Error::UpstreamStatus { status, .. } => {
                format!("Completion service returned status {}", status)
            }
            Error::UpstreamTimeout { .. } => "Completion service timed out".to_string(),
            Error::UpstreamMalformed { .. } => {
                "Invalid conversation format received from completion service".to_string()
            }
            Error::UpstreamUnreadable { .. } => {
                "Completion service returned an unreadable response".to_string()
            }
            Error::Upstream(_) => "Completion service unavailable".to_string(),
            Error::Unauthenticated { .. } => "Unauthenticated".to_string(),
            Error::Forbidden { .. } => "Forbidden".to_string(),
            other => format!("Internal error [{}]", other.code()),
        }
    }

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'persona-relay config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'persona-relay config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::UserNotFound { .. } => Some(
                "Provision the user first with 'persona-relay user add <HANDLE>'."
            ),
            Error::Storage(_) => Some(
                "Check that the [storage] database path is writable and not locked by another process."
            ),
            Error::Upstream(_) | Error::UpstreamTimeout { .. } => Some(
                "Verify [completion] base_url points at a running completion service."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            self.code().as_str(),
            self
        );

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    pub fn config_parse(message: impl Into<String>, source: toml::de::Error) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn unauthenticated(reason: impl Into<String>) -> Self {
        Error::Unauthenticated {
            reason: reason.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest(message.into())
    }

    pub fn upstream_unreadable(message: impl Into<String>) -> Self {
        Error::UpstreamUnreadable {
            message: message.into(),
        }
    }

    pub fn upstream_malformed(message: impl Into<String>) -> Self {
        Error::UpstreamMalformed {
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection Rejection
// ─────────────────────────────────────────────────────────────────

/// Reason a connection was refused before reaching the active state.
///
/// Only the close code and the opaque name travel to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Unauthenticated,
    BadRequest,
    Forbidden,
    Internal,
}

impl Rejection {
    /// WebSocket close code sent to the peer
    pub fn close_code(&self) -> u16 {
        match self {
            Rejection::Unauthenticated => 4401,
            Rejection::BadRequest => 4400,
            Rejection::Forbidden => 4403,
            Rejection::Internal => 1011,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::Unauthenticated => "unauthenticated",
            Rejection::BadRequest => "bad_request",
            Rejection::Forbidden => "forbidden",
            Rejection::Internal => "internal",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
