// src/server.rs
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::challenge::{ChallengeOutcome, ChallengePage, DuoChallenge, Principal, Renderer, SecondFactor};
use crate::commands::{cmd, Request, Response};
use crate::config::Config;
use crate::error::{codes, BridgeError, BridgeResult};
use crate::session::{create_session_store, BridgeSession, SessionManager};

/// How often stale sessions are swept, in seconds
const CLEANUP_INTERVAL: u64 = 60;

/// Hands the Duo page values back to the host as JSON
struct JsonPage;

impl Renderer for JsonPage {
    type Output = serde_json::Value;

    fn render(&self, page: &ChallengePage) -> BridgeResult<serde_json::Value> {
        Ok(serde_json::to_value(page)?)
    }
}

/// Serve the bridge protocol on stdin/stdout
pub async fn run_stdio(config: Config) -> Result<()> {
    let sessions = SessionManager::new(create_session_store(), config.session_timeout);
    let duo = Arc::new(DuoChallenge::new(config));
    duo.initialize()?;

    info!(name = %duo.name(), "Duo bridge listening on stdin");

    run_bridge(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        duo,
        sessions,
    )
    .await
}

/// Read one JSON request per line and answer each with one JSON line
pub async fn run_bridge<R, W>(
    reader: R,
    mut writer: W,
    duo: Arc<DuoChallenge>,
    sessions: SessionManager,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut cleanup = interval(Duration::from_secs(CLEANUP_INTERVAL));

    loop {
        tokio::select! {
            _ = cleanup.tick() => {
                let removed = sessions.cleanup_expired();
                if removed > 0 {
                    debug!(removed, "expired sessions removed");
                }
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };

                let text = line.trim();
                if text.is_empty() {
                    continue;
                }

                let response = process_command(text, &duo, &sessions);
                writer.write_all(format!("{response}\n").as_bytes()).await?;
                writer.flush().await?;
            }
        }
    }

    info!("Duo bridge input closed");
    Ok(())
}

/// Dispatch one request line and return the JSON reply
pub fn process_command(text: &str, duo: &DuoChallenge, sessions: &SessionManager) -> String {
    let req = match Request::from_json(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "unparsable request");
            return Response::err("PARSE", &format!("Invalid JSON: {e}"), codes::MALFORMED_JSON)
                .to_json();
        }
    };

    let command = req.cmd.to_uppercase();
    debug!(cmd = %command, "request");

    let response = match command.as_str() {
        cmd::INIT => handle_init(&req, sessions),
        cmd::BEGIN => handle_begin(&req, duo, sessions),
        cmd::COMPLETE => handle_complete(&req, duo, sessions),
        cmd::SESSION_INFO => handle_session_info(&req, sessions),
        cmd::LOGOUT => handle_logout(&req, sessions),
        cmd::PING => Response::ok(cmd::PONG)
            .with_msg("PONG")
            .with_data(serde_json::json!({ "server_time": Utc::now().to_rfc3339() })),
        _ => Response::err(
            &command,
            &format!("Unknown command: {command}"),
            codes::UNKNOWN_COMMAND,
        ),
    };

    response.to_json()
}

fn handle_init(req: &Request, sessions: &SessionManager) -> Response {
    let Some(username) = req.get_str("username") else {
        return Response::err(cmd::INIT, "MISSING_USERNAME", codes::MISSING_FIELD);
    };

    let token = sessions.open(Principal::new(username.clone()));
    info!(principal = %username, "session opened");

    Response::ok(cmd::INIT_OK)
        .with_token(token)
        .with_username(username)
        .with_verified(false)
}

fn handle_begin(req: &Request, duo: &DuoChallenge, sessions: &SessionManager) -> Response {
    let (token, session) = match session_for(cmd::BEGIN, req, sessions) {
        Ok(found) => found,
        Err(resp) => return resp,
    };

    match duo.display_login(session.principal.established_name(), &JsonPage) {
        Ok(page) => Response::ok(cmd::CHALLENGE).with_token(token).with_data(page),
        Err(BridgeError::Precondition(msg)) => {
            Response::err(cmd::BEGIN, &msg, codes::AUTH_REQUIRED)
        }
        Err(e) => {
            warn!(error = %e, "unable to create Duo request");
            Response::err(cmd::BEGIN, "unable to create Duo request", codes::INTERNAL_ERROR)
        }
    }
}

fn handle_complete(req: &Request, duo: &DuoChallenge, sessions: &SessionManager) -> Response {
    let (token, session) = match session_for(cmd::COMPLETE, req, sessions) {
        Ok(found) => found,
        Err(resp) => return resp,
    };

    // a verified session has consumed its response; replays and duplicate tabs stop here
    if session.verified {
        warn!("COMPLETE on an already verified session");
        return Response::err(cmd::COMPLETE, "already verified", codes::AUTH_FAILED)
            .with_token(token)
            .with_verified(true);
    }

    let sig_response = req.get_str("sig_response");
    let mut principal = session.principal;

    match duo.complete_challenge(&mut principal, sig_response.as_deref()) {
        Ok(ChallengeOutcome::Success) => {
            let username = principal.name.clone().unwrap_or_default();
            sessions.update(&token, principal, true);
            Response::ok(cmd::AUTH_OK)
                .with_token(token)
                .with_username(username)
                .with_verified(true)
        }
        Ok(ChallengeOutcome::Failure(reason)) => {
            sessions.update(&token, principal, false);
            Response::err(cmd::COMPLETE, &reason.to_string(), codes::AUTH_FAILED)
                .with_token(token)
                .with_verified(false)
        }
        Err(BridgeError::Precondition(msg)) => {
            Response::err(cmd::COMPLETE, &msg, codes::AUTH_REQUIRED)
        }
        Err(e) => {
            // attempt is over, the host has to start a new login
            warn!(error = %e, "Duo attempt aborted");
            sessions.remove(&token);
            Response::err(cmd::COMPLETE, "authentication aborted", codes::INTERNAL_ERROR)
        }
    }
}

fn handle_session_info(req: &Request, sessions: &SessionManager) -> Response {
    let (token, session) = match session_for(cmd::SESSION_INFO, req, sessions) {
        Ok(found) => found,
        Err(resp) => return resp,
    };

    let mut resp = Response::ok(cmd::SESSION_INFO)
        .with_token(token)
        .with_verified(session.verified)
        .with_data(serde_json::json!({ "age_secs": session.age_secs() }));

    if let Some(name) = session.principal.name {
        resp = resp.with_username(name);
    }
    if let Some(reason) = session.principal.failed_login.as_deref() {
        resp = resp.with_msg(reason);
    }
    resp
}

fn handle_logout(req: &Request, sessions: &SessionManager) -> Response {
    let Some(token) = req.get_str("session_token") else {
        return Response::err(cmd::LOGOUT, "MISSING_SESSION_TOKEN", codes::MISSING_FIELD);
    };

    match sessions.remove(&token) {
        Some(_) => Response::ok(cmd::LOGOUT).with_msg("Logged out"),
        None => Response::err(cmd::LOGOUT, "SESSION_NOT_FOUND", codes::SESSION_NOT_FOUND),
    }
}

fn session_for(
    command: &str,
    req: &Request,
    sessions: &SessionManager,
) -> Result<(String, BridgeSession), Response> {
    let token = req
        .get_str("session_token")
        .ok_or_else(|| Response::err(command, "MISSING_SESSION_TOKEN", codes::MISSING_FIELD))?;

    let session = sessions
        .get(&token)
        .ok_or_else(|| Response::err(command, "SESSION_NOT_FOUND", codes::SESSION_NOT_FOUND))?;

    Ok((token, session))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::token;
    use serde_json::Value;

    const IKEY: &str = "DIXXXXXXXXXXXXXXXXXX";
    const SKEY: &str = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef";
    const AKEY: &str = "useacustomerprovidedapplicationsecretkey";
    const HOST: &str = "api-123456.duosecurity.com";

    fn setup() -> (Arc<DuoChallenge>, SessionManager) {
        setup_with(Credentials::new(IKEY, SKEY, AKEY, HOST))
    }

    fn setup_with(credentials: Credentials) -> (Arc<DuoChallenge>, SessionManager) {
        let config = Config {
            credentials,
            login_page: "duo.vm".to_string(),
            bean_name: "duo".to_string(),
            session_timeout: 600,
        };
        (
            Arc::new(DuoChallenge::new(config)),
            SessionManager::new(create_session_store(), 600),
        )
    }

    fn send(line: &str, duo: &DuoChallenge, sessions: &SessionManager) -> Value {
        serde_json::from_str(&process_command(line, duo, sessions)).unwrap()
    }

    fn init(username: &str, duo: &DuoChallenge, sessions: &SessionManager) -> String {
        let line = serde_json::json!({ "cmd": "INIT", "data": { "username": username } });
        let resp = send(&line.to_string(), duo, sessions);
        assert_eq!(resp["status"], "OK");
        resp["session_token"].as_str().unwrap().to_string()
    }

    fn complete(token: &str, sig: &str, duo: &DuoChallenge, sessions: &SessionManager) -> Value {
        let line = serde_json::json!({
            "cmd": "COMPLETE",
            "data": { "session_token": token, "sig_response": sig }
        });
        send(&line.to_string(), duo, sessions)
    }

    #[test]
    fn test_full_exchange() {
        let (duo, sessions) = setup();
        let token = init("alice", &duo, &sessions);

        let begin = serde_json::json!({ "cmd": "begin", "data": { "session_token": token } });
        let resp = send(&begin.to_string(), &duo, &sessions);
        assert_eq!(resp["cmd"], "CHALLENGE");
        assert_eq!(resp["data"]["duoHost"], HOST);
        assert_eq!(resp["data"]["template"], "duo.vm");
        assert!(resp["data"]["duoRequest"].as_str().unwrap().starts_with("TX|"));

        let sig = token::sign_response(IKEY, SKEY, AKEY, "Alice").unwrap();
        let resp = complete(&token, &sig, &duo, &sessions);
        assert_eq!(resp["cmd"], "AUTH_OK");
        assert_eq!(resp["verified"], true);
        assert!(sessions.get(&token).unwrap().verified);
    }

    #[test]
    fn test_failed_attempt_is_recorded() {
        let (duo, sessions) = setup();
        let token = init("alice", &duo, &sessions);

        let sig = token::sign_response(IKEY, SKEY, AKEY, "bob").unwrap();
        let resp = complete(&token, &sig, &duo, &sessions);
        assert_eq!(resp["status"], "ERR");
        assert_eq!(resp["code"], codes::AUTH_FAILED);
        assert_eq!(resp["msg"], "identity mismatch");

        let info = serde_json::json!({ "cmd": "SESSION_INFO", "data": { "session_token": token } });
        let resp = send(&info.to_string(), &duo, &sessions);
        assert_eq!(resp["msg"], "identity mismatch");
        assert_eq!(resp["verified"], false);

        // the user may retry
        let resp = complete(&token, "", &duo, &sessions);
        assert_eq!(resp["msg"], "empty response");
    }

    #[test]
    fn test_verified_session_rejects_further_responses() {
        let (duo, sessions) = setup();
        let token = init("alice", &duo, &sessions);
        let sig = token::sign_response(IKEY, SKEY, AKEY, "alice").unwrap();

        assert_eq!(complete(&token, &sig, &duo, &sessions)["cmd"], "AUTH_OK");

        let replay = complete(&token, &sig, &duo, &sessions);
        assert_eq!(replay["status"], "ERR");
        assert_eq!(replay["msg"], "already verified");
        assert_eq!(replay["code"], codes::AUTH_FAILED);

        // duplicate tab posting an empty form
        let empty = complete(&token, "", &duo, &sessions);
        assert_eq!(empty["msg"], "already verified");

        let session = sessions.get(&token).unwrap();
        assert!(session.verified);
        assert!(session.principal.failed_login.is_none());
    }

    #[test]
    fn test_session_info_after_retry_success() {
        let (duo, sessions) = setup();
        let token = init("alice", &duo, &sessions);

        let wrong = token::sign_response(IKEY, SKEY, AKEY, "bob").unwrap();
        assert_eq!(complete(&token, &wrong, &duo, &sessions)["status"], "ERR");
        let right = token::sign_response(IKEY, SKEY, AKEY, "alice").unwrap();
        assert_eq!(complete(&token, &right, &duo, &sessions)["cmd"], "AUTH_OK");

        let info = serde_json::json!({ "cmd": "SESSION_INFO", "data": { "session_token": token } });
        let resp = send(&info.to_string(), &duo, &sessions);
        assert_eq!(resp["verified"], true);
        assert!(resp.get("msg").is_none());
    }

    #[test]
    fn test_fatal_complete_drops_session() {
        let (duo, sessions) = setup_with(Credentials::new(IKEY, "", AKEY, HOST));
        let token = init("alice", &duo, &sessions);
        let sig = token::sign_response(IKEY, SKEY, AKEY, "alice").unwrap();

        let resp = complete(&token, &sig, &duo, &sessions);
        assert_eq!(resp["status"], "ERR");
        assert_eq!(resp["code"], codes::INTERNAL_ERROR);
        assert_eq!(resp["msg"], "authentication aborted");
        assert!(sessions.get(&token).is_none());
    }

    #[test]
    fn test_fatal_begin_reports_internal_error() {
        let (duo, sessions) = setup_with(Credentials::new(IKEY, "", AKEY, HOST));
        let token = init("alice", &duo, &sessions);

        let begin = serde_json::json!({ "cmd": "BEGIN", "data": { "session_token": token } });
        let resp = send(&begin.to_string(), &duo, &sessions);
        assert_eq!(resp["status"], "ERR");
        assert_eq!(resp["code"], codes::INTERNAL_ERROR);
        assert!(!resp.to_string().contains(AKEY));
    }

    #[test]
    fn test_begin_without_principal() {
        let (duo, sessions) = setup();
        let token = init("", &duo, &sessions);

        let begin = serde_json::json!({ "cmd": "BEGIN", "data": { "session_token": token } });
        let resp = send(&begin.to_string(), &duo, &sessions);
        assert_eq!(resp["code"], codes::AUTH_REQUIRED);
    }

    #[test]
    fn test_unknown_session() {
        let (duo, sessions) = setup();
        let resp = complete("DUO-missing", "x", &duo, &sessions);
        assert_eq!(resp["code"], codes::SESSION_NOT_FOUND);
    }

    #[test]
    fn test_logout_and_ping() {
        let (duo, sessions) = setup();
        let token = init("alice", &duo, &sessions);

        let logout = serde_json::json!({ "cmd": "LOGOUT", "data": { "session_token": token } });
        assert_eq!(send(&logout.to_string(), &duo, &sessions)["status"], "OK");
        assert_eq!(send(&logout.to_string(), &duo, &sessions)["status"], "ERR");

        let pong = send(r#"{"cmd":"PING"}"#, &duo, &sessions);
        assert_eq!(pong["cmd"], "PONG");
        assert!(pong["data"]["server_time"].is_string());
    }

    #[test]
    fn test_bad_input() {
        let (duo, sessions) = setup();

        let resp = send("not json", &duo, &sessions);
        assert_eq!(resp["code"], codes::MALFORMED_JSON);

        let resp = send(r#"{"cmd":"INIT"}"#, &duo, &sessions);
        assert_eq!(resp["code"], codes::MISSING_FIELD);
    }

    #[tokio::test]
    async fn test_bridge_answers_each_line() {
        let (duo, sessions) = setup();
        let input = "{\"cmd\":\"INIT\",\"data\":{\"username\":\"alice\"}}\n\n{\"cmd\":\"PING\"}\n";
        let mut output = Vec::new();

        run_bridge(BufReader::new(input.as_bytes()), &mut output, duo, sessions.clone())
            .await
            .unwrap();

        let text = String::from_utf8(output).unwrap();
        let replies: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["cmd"], "INIT_OK");
        assert_eq!(replies[1]["cmd"], "PONG");
        assert_eq!(sessions.active_count(), 1);
    }

    #[tokio::test]
    async fn test_bridge_unknown_command() {
        let (duo, sessions) = setup();
        let reader = tokio_test::io::Builder::new()
            .read(b"{\"cmd\":\"FROB\"}\n")
            .build();
        let writer = tokio_test::io::Builder::new()
            .write(b"{\"status\":\"ERR\",\"cmd\":\"FROB\",\"msg\":\"Unknown command: FROB\",\"code\":1002}\n")
            .build();

        run_bridge(BufReader::new(reader), writer, duo, sessions)
            .await
            .unwrap();
    }
}
