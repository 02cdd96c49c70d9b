//! Duo Bridge Library
//!
//! Duo Web second-factor step for an identity provider: signs the request
//! handed to the Duo frame and verifies the signed response it posts back.

pub mod challenge;
pub mod commands;
pub mod config;
pub mod error;
pub mod server;
pub mod session;
pub mod token;

// Re-exports for convenience
pub use challenge::{
    ChallengeOutcome, ChallengePage, ChallengeRequest, DuoChallenge, FailureReason, Principal,
    Renderer, SecondFactor,
};
pub use config::{Config, Credentials};
pub use error::{BridgeError, BridgeResult, TokenError};
pub use server::{run_bridge, run_stdio};
pub use session::{create_session_store, BridgeSession, SessionManager, SessionStore};
pub use token::{sign_request, sign_response, verify_response};
