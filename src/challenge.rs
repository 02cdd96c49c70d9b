//! Duo challenge/response orchestration
//!
//! Sequences one second-factor exchange: sign a request for an already
//! authenticated principal, then check the response Duo hands back against
//! that same principal. Nothing here keeps state between calls; the host owns
//! the principal and stores it in its session.

use std::fmt;

use chrono::Utc;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{BridgeError, BridgeResult, TokenError};
use crate::token;

/// Placeholder name hosts use before anyone has logged in
pub const UNSET_PRINCIPAL: &str = "[principal]";

/// The principal established by the primary login method
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Username from the first factor
    pub name: Option<String>,

    /// Why the last second-factor attempt failed, for auditing
    pub failed_login: Option<String>,

    /// Unix timestamp of the last recorded failure
    pub failed_at: Option<i64>,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// The established username, if there is a real one
    pub fn established_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty() && *name != UNSET_PRINCIPAL)
    }

    pub fn set_failed_login(&mut self, reason: &str) {
        self.failed_login = Some(reason.to_string());
        self.failed_at = Some(Utc::now().timestamp());
    }

    pub fn clear_failed_login(&mut self) {
        self.failed_login = None;
        self.failed_at = None;
    }
}

/// What the host needs to put the Duo frame on the page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    pub signed_request: String,
    pub service_host: String,
}

/// Named values handed to the template collaborator
#[derive(Debug, Clone, Serialize)]
pub struct ChallengePage {
    pub template: String,

    #[serde(rename = "duoRequest")]
    pub duo_request: String,

    #[serde(rename = "duoHost")]
    pub duo_host: String,
}

/// Template rendering collaborator
pub trait Renderer {
    type Output;

    fn render(&self, page: &ChallengePage) -> BridgeResult<Self::Output>;
}

/// Why a response was turned away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    EmptyResponse,
    IdentityMismatch,
    Rejected(TokenError),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::EmptyResponse => write!(f, "empty response"),
            FailureReason::IdentityMismatch => write!(f, "identity mismatch"),
            FailureReason::Rejected(e) => write!(f, "unable to verify Duo: {e}"),
        }
    }
}

/// Result of checking a Duo response; failures are retryable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Success,
    Failure(FailureReason),
}

impl ChallengeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ChallengeOutcome::Success)
    }
}

/// Lifecycle a host drives for a second-factor submodule
pub trait SecondFactor {
    /// Check configuration and announce the submodule
    fn initialize(&self) -> BridgeResult<()>;

    /// Sign a request for an already authenticated identity
    fn begin_challenge(&self, identity: Option<&str>) -> BridgeResult<ChallengeRequest>;

    /// Verify the response posted back by the client
    ///
    /// Expected failures come back as [`ChallengeOutcome::Failure`] and are
    /// recorded on the principal. `Err` means the attempt has to be aborted.
    fn complete_challenge(
        &self,
        principal: &mut Principal,
        sig_response: Option<&str>,
    ) -> BridgeResult<ChallengeOutcome>;
}

/// Duo Web implementation of [`SecondFactor`]
#[derive(Debug, Clone)]
pub struct DuoChallenge {
    config: Config,
}

impl DuoChallenge {
    pub fn new(config: Config) -> Self {
        debug!(?config, "Duo submodule configured");
        Self { config }
    }

    /// Name the host registered this submodule under
    pub fn name(&self) -> &str {
        &self.config.bean_name
    }

    /// Sign a request and hand it to the template collaborator
    pub fn display_login<R: Renderer>(
        &self,
        identity: Option<&str>,
        renderer: &R,
    ) -> BridgeResult<R::Output> {
        let request = self.begin_challenge(identity)?;
        let page = ChallengePage {
            template: self.config.login_page.clone(),
            duo_request: request.signed_request,
            duo_host: request.service_host,
        };

        debug!(template = %page.template, "rendering Duo template");
        renderer.render(&page)
    }

    fn fail(&self, principal: &mut Principal, reason: FailureReason) -> ChallengeOutcome {
        principal.set_failed_login(&reason.to_string());
        ChallengeOutcome::Failure(reason)
    }
}

impl SecondFactor for DuoChallenge {
    fn initialize(&self) -> BridgeResult<()> {
        self.config.validate()?;
        info!(
            name = %self.config.bean_name,
            "Duo login submodule version {} initialized",
            env!("CARGO_PKG_VERSION")
        );
        Ok(())
    }

    fn begin_challenge(&self, identity: Option<&str>) -> BridgeResult<ChallengeRequest> {
        let Some(username) = identity.filter(|n| !n.is_empty() && *n != UNSET_PRINCIPAL) else {
            error!("Duo may not be invoked before the user has authenticated with another method");
            return Err(BridgeError::Precondition(
                "no authenticated principal".to_string(),
            ));
        };

        debug!(principal = %username, "creating signed Duo request");

        let creds = &self.config.credentials;
        let signed_request = token::sign_request(
            &creds.integration_key,
            creds.secret_key.expose_secret(),
            creds.application_secret.expose_secret(),
            username,
        )?;
        debug!(request = %signed_request, "Duo request");

        Ok(ChallengeRequest {
            signed_request,
            service_host: creds.service_host.clone(),
        })
    }

    fn complete_challenge(
        &self,
        principal: &mut Principal,
        sig_response: Option<&str>,
    ) -> BridgeResult<ChallengeOutcome> {
        let Some(expected) = principal.established_name().map(str::to_string) else {
            error!("Duo response received without an authenticated principal");
            return Err(BridgeError::Precondition(
                "no authenticated principal".to_string(),
            ));
        };

        let Some(sig_response) = sig_response.map(str::trim).filter(|s| !s.is_empty()) else {
            warn!(principal = %expected, "empty Duo response");
            return Ok(self.fail(principal, FailureReason::EmptyResponse));
        };
        debug!(principal = %expected, len = sig_response.len(), "verifying Duo response");

        let creds = &self.config.credentials;
        let result = token::verify_response(
            &creds.integration_key,
            creds.secret_key.expose_secret(),
            creds.application_secret.expose_secret(),
            sig_response,
        );

        match result {
            Ok(user) if user.to_lowercase() == expected.to_lowercase() => {
                info!(principal = %expected, "Duo verification succeeded");
                principal.clear_failed_login();
                Ok(ChallengeOutcome::Success)
            }
            Ok(user) => {
                warn!(principal = %expected, asserted = %user, "Duo response is for another user");
                Ok(self.fail(principal, FailureReason::IdentityMismatch))
            }
            Err(e) if e.is_retryable() => {
                warn!(principal = %expected, error = %e, "Duo response rejected");
                Ok(self.fail(principal, FailureReason::Rejected(e)))
            }
            Err(e) => {
                error!(principal = %expected, error = %e, "Duo verification failed");
                principal.set_failed_login("unable to verify Duo");
                Err(BridgeError::Authentication(format!(
                    "unable to verify Duo response: {e}"
                )))
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
