//! Session management for the host bridge
//!
//! Holds the principal the host established between `BEGIN` and `COMPLETE`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::challenge::Principal;

/// Represents one login attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSession {
    /// Unique session token
    pub token: String,

    /// Principal from the first factor
    pub principal: Principal,

    /// Whether Duo has verified this session
    pub verified: bool,

    /// Session creation timestamp
    #[serde(skip)]
    pub created_at: Option<Instant>,

    /// Last activity timestamp
    #[serde(skip)]
    pub last_activity: Option<Instant>,
}

impl BridgeSession {
    /// Create a session for a principal that has passed the first factor
    pub fn new(token: String, principal: Principal) -> Self {
        let now = Instant::now();
        Self {
            token,
            principal,
            verified: false,
            created_at: Some(now),
            last_activity: Some(now),
        }
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Some(Instant::now());
    }

    /// Check if session has expired
    pub fn is_expired(&self, timeout: Duration) -> bool {
        match self.last_activity {
            Some(last) => last.elapsed() > timeout,
            None => true,
        }
    }

    /// Get session age in seconds
    pub fn age_secs(&self) -> u64 {
        self.created_at
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }
}

/// Generate a fresh session token
pub fn generate_session_token() -> String {
    format!("DUO-{}", uuid::Uuid::new_v4())
}

/// Thread-safe session store type
pub type SessionStore = Arc<Mutex<HashMap<String, BridgeSession>>>;

/// Create a new empty session store
pub fn create_session_store() -> SessionStore {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Session manager with helper operations
#[derive(Clone)]
pub struct SessionManager {
    store: SessionStore,
    session_timeout: Duration,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(store: SessionStore, timeout_secs: u64) -> Self {
        Self {
            store,
            session_timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BridgeSession>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session for `principal` and return its token
    pub fn open(&self, principal: Principal) -> String {
        let token = generate_session_token();
        self.insert(BridgeSession::new(token.clone(), principal));
        token
    }

    /// Insert a new session
    pub fn insert(&self, session: BridgeSession) {
        let mut store = self.lock();
        store.insert(session.token.clone(), session);
    }

    /// Get a live session by token (cloned)
    pub fn get(&self, token: &str) -> Option<BridgeSession> {
        let mut store = self.lock();
        let session = store.get_mut(token)?;
        if session.is_expired(self.session_timeout) {
            store.remove(token);
            return None;
        }
        session.touch();
        Some(session.clone())
    }

    /// Write back the principal after a completed attempt
    pub fn update(&self, token: &str, principal: Principal, verified: bool) -> bool {
        let mut store = self.lock();
        if let Some(session) = store.get_mut(token) {
            session.principal = principal;
            session.verified = verified;
            session.touch();
            true
        } else {
            false
        }
    }

    /// Remove a session
    pub fn remove(&self, token: &str) -> Option<BridgeSession> {
        let mut store = self.lock();
        store.remove(token)
    }

    /// Clean up expired sessions
    pub fn cleanup_expired(&self) -> usize {
        let mut store = self.lock();
        let before = store.len();
        store.retain(|_, session| !session.is_expired(self.session_timeout));
        before - store.len()
    }

    /// Get count of active sessions
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_creation() {
        let session = BridgeSession::new("t".to_string(), Principal::new("alice"));
        assert!(!session.verified);
        assert_eq!(session.principal.established_name(), Some("alice"));
        assert!(session.created_at.is_some());
        assert_eq!(session.age_secs(), 0);
    }

    #[test]
    fn test_session_token_format() {
        let a = generate_session_token();
        let b = generate_session_token();
        assert!(a.starts_with("DUO-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_manager_basic() {
        let manager = SessionManager::new(create_session_store(), 3600);

        let token = manager.open(Principal::new("alice"));
        assert!(manager.get(&token).is_some());
        assert!(manager.get("nonexistent").is_none());
        assert_eq!(manager.active_count(), 1);

        assert!(manager.remove(&token).is_some());
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_session_update() {
        let manager = SessionManager::new(create_session_store(), 3600);
        let token = manager.open(Principal::new("alice"));

        let mut principal = manager.get(&token).unwrap().principal;
        principal.set_failed_login("empty response");
        assert!(manager.update(&token, principal, false));

        let session = manager.get(&token).unwrap();
        assert_eq!(session.principal.failed_login.as_deref(), Some("empty response"));
        assert!(!manager.update("missing", Principal::new("bob"), true));
    }

    #[test]
    fn test_expired_sessions_are_dropped() {
        let manager = SessionManager::new(create_session_store(), 0);
        let mut session = BridgeSession::new("old".to_string(), Principal::new("alice"));
        session.last_activity = Some(Instant::now() - Duration::from_secs(5));
        manager.insert(session);

        assert_eq!(manager.cleanup_expired(), 1);
        assert_eq!(manager.active_count(), 0);
    }
}
