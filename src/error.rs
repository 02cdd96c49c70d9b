//! Custom error types for the Duo bridge

use thiserror::Error;

/// Failures produced by the token codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("Token expired")]
    Expired,

    #[error("Integration key mismatch")]
    TenantMismatch,

    #[error("HMAC algorithm failure: {0}")]
    Algorithm(String),
}

impl TokenError {
    /// Protocol-level rejections the end user may retry.
    ///
    /// `Encoding` and `Algorithm` come from configuration or the primitive
    /// itself, so retrying cannot help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TokenError::MalformedToken(_)
                | TokenError::SignatureMismatch
                | TokenError::Expired
                | TokenError::TenantMismatch
        )
    }
}

/// Bridge-level error types
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Error codes for bridge protocol responses
pub mod codes {
    // Parse errors (1xxx)
    pub const MALFORMED_JSON: u32 = 1001;
    pub const UNKNOWN_COMMAND: u32 = 1002;
    pub const MISSING_FIELD: u32 = 1003;

    // Auth errors (2xxx)
    pub const AUTH_FAILED: u32 = 2001;
    pub const AUTH_REQUIRED: u32 = 2002;
    pub const SESSION_NOT_FOUND: u32 = 2003;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: u32 = 5000;
}
