//! Host bridge commands and message structures
//!
//! One JSON object per line in each direction.

use serde::{Deserialize, Serialize};

/// Incoming bridge request structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Command name (e.g., "INIT", "BEGIN", "COMPLETE")
    pub cmd: String,

    /// Optional data payload
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl Request {
    /// Parse a bridge request from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Get a string field from data
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.data
            .as_ref()?
            .get(key)?
            .as_str()
            .map(|s| s.to_string())
    }
}

/// Outgoing bridge response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Status ("OK" or "ERR")
    pub status: String,

    /// Command/response type
    pub cmd: String,

    /// Optional message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,

    /// Session token (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,

    /// Username of the session principal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Whether Duo has verified the session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,

    /// Error code (if error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,

    /// Additional data payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    /// Create a success response
    pub fn ok(cmd: &str) -> Self {
        Self {
            status: "OK".to_string(),
            cmd: cmd.to_string(),
            msg: None,
            session_token: None,
            username: None,
            verified: None,
            code: None,
            data: None,
        }
    }

    /// Create an error response
    pub fn err(cmd: &str, msg: &str, code: u32) -> Self {
        Self {
            status: "ERR".to_string(),
            cmd: cmd.to_string(),
            msg: Some(msg.to_string()),
            session_token: None,
            username: None,
            verified: None,
            code: Some(code),
            data: None,
        }
    }

    // Builder methods for chaining

    /// Add session token
    pub fn with_token(mut self, token: String) -> Self {
        self.session_token = Some(token);
        self
    }

    /// Add username
    pub fn with_username(mut self, username: String) -> Self {
        self.username = Some(username);
        self
    }

    /// Add verification status
    pub fn with_verified(mut self, verified: bool) -> Self {
        self.verified = Some(verified);
        self
    }

    /// Add message
    pub fn with_msg(mut self, msg: &str) -> Self {
        self.msg = Some(msg.to_string());
        self
    }

    /// Add data payload
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"status":"ERR","cmd":"INTERNAL","msg":"json_serialization_failed"}"#.to_string()
        })
    }
}

/// Command constants
pub mod cmd {
    // Session commands
    pub const INIT: &str = "INIT";
    pub const SESSION_INFO: &str = "SESSION_INFO";
    pub const LOGOUT: &str = "LOGOUT";

    // Challenge commands
    pub const BEGIN: &str = "BEGIN";
    pub const COMPLETE: &str = "COMPLETE";

    // Replies
    pub const INIT_OK: &str = "INIT_OK";
    pub const CHALLENGE: &str = "CHALLENGE";
    pub const AUTH_OK: &str = "AUTH_OK";

    // Connectivity commands
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
}

// ============================================================================
// TESTS
// ============================================================================
