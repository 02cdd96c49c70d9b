//! Bridge configuration management
//!
//! Loads the Duo credential set from environment variables.

use std::env;
use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use tracing_subscriber::EnvFilter;

use crate::error::{BridgeError, BridgeResult};

/// Required length of a Duo integration key
pub const IKEY_LEN: usize = 20;
/// Required length of a Duo secret key
pub const SKEY_LEN: usize = 40;
/// Minimum length of the application secret
pub const AKEY_MIN_LEN: usize = 40;

/// Log directives used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "duo_bridge=debug";

/// Duo credential set, read-only once loaded
#[derive(Clone)]
pub struct Credentials {
    /// Integration key (public tenant identifier)
    pub integration_key: String,

    /// Secret key shared with Duo
    pub secret_key: SecretString,

    /// Application secret, never sent anywhere
    pub application_secret: SecretString,

    /// API host the Duo frame talks to
    pub service_host: String,
}

impl Credentials {
    pub fn new(
        integration_key: impl Into<String>,
        secret_key: impl Into<String>,
        application_secret: impl Into<String>,
        service_host: impl Into<String>,
    ) -> Self {
        Self {
            integration_key: integration_key.into(),
            secret_key: SecretString::from(secret_key.into()),
            application_secret: SecretString::from(application_secret.into()),
            service_host: service_host.into(),
        }
    }

    /// Check key shapes against what Duo issues
    pub fn validate(&self) -> BridgeResult<()> {
        if self.integration_key.len() != IKEY_LEN {
            return Err(BridgeError::Config(format!(
                "integration key must be {IKEY_LEN} characters"
            )));
        }

        if self.secret_key.expose_secret().len() != SKEY_LEN {
            return Err(BridgeError::Config(format!(
                "secret key must be {SKEY_LEN} characters"
            )));
        }

        if self.application_secret.expose_secret().len() < AKEY_MIN_LEN {
            return Err(BridgeError::Config(format!(
                "application secret must be at least {AKEY_MIN_LEN} characters"
            )));
        }

        if self.service_host.trim().is_empty() {
            return Err(BridgeError::Config("service host is empty".to_string()));
        }

        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("integration_key", &self.integration_key)
            .field("secret_key", &"XXXXXXXXXX")
            .field("application_secret", &"XXXXXXXXXX")
            .field("service_host", &self.service_host)
            .finish()
    }
}

/// Bridge configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: Credentials,

    /// Template the host renders the Duo frame with
    pub login_page: String,

    /// Name the host registers this submodule under
    pub bean_name: String,

    /// Idle timeout of a bridge session in seconds
    pub session_timeout: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> BridgeResult<Self> {
        let credentials = Credentials::new(
            required("DUO_IKEY")?,
            required("DUO_SKEY")?,
            required("DUO_AKEY")?,
            required("DUO_HOST")?,
        );

        Ok(Self {
            credentials,
            login_page: env::var("DUO_LOGIN_PAGE").unwrap_or_else(|_| "duo.vm".to_string()),
            bean_name: env::var("DUO_BEAN_NAME").unwrap_or_else(|_| "duo".to_string()),
            session_timeout: env::var("DUO_SESSION_TIMEOUT")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .unwrap_or(600),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> BridgeResult<()> {
        self.credentials.validate()?;

        if self.login_page.trim().is_empty() {
            return Err(BridgeError::Config("login page is empty".to_string()));
        }

        Ok(())
    }
}

/// Log filter from `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`]
/// when it is unset or unparsable
pub fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn required(name: &str) -> BridgeResult<String> {
    env::var(name).map_err(|_| BridgeError::Config(format!("{name} is not set")))
}
