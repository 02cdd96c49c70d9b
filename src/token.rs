//! Signed request/response tokens for Duo Web using HMAC-SHA1
//!
//! A token is two signed halves joined by `:`. Each half looks like
//! `PREFIX|base64(user|ikey|expires)|hex(hmac)`. The first half is signed
//! with the secret key shared with Duo, the second with the application
//! secret that never leaves this process.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::TokenError;

type HmacSha1 = Hmac<Sha1>;

/// Prefix of the half sent to Duo in a request
pub const DUO_PREFIX: &str = "TX";
/// Prefix of the application-signed half
pub const APP_PREFIX: &str = "APP";
/// Prefix of the half Duo returns in a response
pub const AUTH_PREFIX: &str = "AUTH";

/// Lifetime of the Duo-signed half, in seconds
pub const DUO_EXPIRE: i64 = 300;
/// Lifetime of the application-signed half, in seconds
pub const APP_EXPIRE: i64 = 3600;

const FIELD_SEP: char = '|';
const HALF_SEP: char = ':';

/// Create a signed request for `username` to hand to the Duo frame
///
/// # Arguments
/// * `ikey` - Integration key
/// * `skey` - Secret key shared with Duo
/// * `akey` - Application secret
/// * `username` - Already authenticated username
///
/// # Returns
/// `TX|...:APP|...`
pub fn sign_request(
    ikey: &str,
    skey: &str,
    akey: &str,
    username: &str,
) -> Result<String, TokenError> {
    sign_request_at(ikey, skey, akey, username, Utc::now().timestamp())
}

/// [`sign_request`] with an explicit clock (unix seconds)
pub fn sign_request_at(
    ikey: &str,
    skey: &str,
    akey: &str,
    username: &str,
    now: i64,
) -> Result<String, TokenError> {
    sign_pair(DUO_PREFIX, ikey, skey, akey, username, now)
}

/// Create the signed response Duo posts back after a successful second factor
///
/// The bridge itself only verifies responses; this is the issuing side of
/// the same format.
pub fn sign_response(
    ikey: &str,
    skey: &str,
    akey: &str,
    username: &str,
) -> Result<String, TokenError> {
    sign_response_at(ikey, skey, akey, username, Utc::now().timestamp())
}

/// [`sign_response`] with an explicit clock (unix seconds)
pub fn sign_response_at(
    ikey: &str,
    skey: &str,
    akey: &str,
    username: &str,
    now: i64,
) -> Result<String, TokenError> {
    sign_pair(AUTH_PREFIX, ikey, skey, akey, username, now)
}

/// Verify a signed response and return the username it asserts
///
/// Both signatures are checked before anything inside the token is decoded
/// or compared, so a forged token only ever learns "rejected".
pub fn verify_response(
    ikey: &str,
    skey: &str,
    akey: &str,
    sig_response: &str,
) -> Result<String, TokenError> {
    verify_response_at(ikey, skey, akey, sig_response, Utc::now().timestamp())
}

/// [`verify_response`] with an explicit clock (unix seconds)
pub fn verify_response_at(
    ikey: &str,
    skey: &str,
    akey: &str,
    sig_response: &str,
    now: i64,
) -> Result<String, TokenError> {
    require_keys(ikey, skey, akey)?;

    let (auth_half, app_half) = sig_response
        .split_once(HALF_SEP)
        .ok_or_else(|| TokenError::MalformedToken("expected two signed halves".into()))?;

    // outer (application) signature gates everything else
    let app = check_signature(akey, app_half)?;
    let auth = check_signature(skey, auth_half)?;

    let app = decode_half(&app, APP_PREFIX)?;
    let auth = decode_half(&auth, AUTH_PREFIX)?;

    if auth.ikey != ikey || app.ikey != ikey {
        return Err(TokenError::TenantMismatch);
    }

    if now >= auth.expires || now >= app.expires {
        return Err(TokenError::Expired);
    }

    if auth.user != app.user {
        return Err(TokenError::SignatureMismatch);
    }

    Ok(auth.user)
}

/// Build both halves for one user
fn sign_pair(
    prefix: &str,
    ikey: &str,
    skey: &str,
    akey: &str,
    username: &str,
    now: i64,
) -> Result<String, TokenError> {
    require_keys(ikey, skey, akey)?;

    if username.is_empty() {
        return Err(TokenError::Encoding("username is empty".into()));
    }
    if username.contains(FIELD_SEP) || ikey.contains(FIELD_SEP) {
        return Err(TokenError::Encoding(format!(
            "username and integration key may not contain '{FIELD_SEP}'"
        )));
    }

    let duo_sig = sign_values(skey, username, ikey, prefix, now + DUO_EXPIRE)?;
    let app_sig = sign_values(akey, username, ikey, APP_PREFIX, now + APP_EXPIRE)?;

    Ok(format!("{duo_sig}{HALF_SEP}{app_sig}"))
}

fn require_keys(ikey: &str, skey: &str, akey: &str) -> Result<(), TokenError> {
    if ikey.is_empty() {
        return Err(TokenError::Encoding("integration key is empty".into()));
    }
    if skey.is_empty() {
        return Err(TokenError::Encoding("secret key is empty".into()));
    }
    if akey.is_empty() {
        return Err(TokenError::Encoding("application secret is empty".into()));
    }
    Ok(())
}

/// `PREFIX|base64(user|ikey|expires)|hex(hmac)`
fn sign_values(
    key: &str,
    username: &str,
    ikey: &str,
    prefix: &str,
    expires: i64,
) -> Result<String, TokenError> {
    let val = format!("{username}{FIELD_SEP}{ikey}{FIELD_SEP}{expires}");
    let cookie = format!("{prefix}{FIELD_SEP}{}", STANDARD.encode(val));
    let sig = hmac_hex(key, &cookie)?;

    Ok(format!("{cookie}{FIELD_SEP}{sig}"))
}

/// A half whose signature has been checked but whose payload is still opaque
struct SignedHalf<'a> {
    prefix: &'a str,
    payload: &'a str,
}

/// Decoded contents of a verified half
struct HalfValues {
    user: String,
    ikey: String,
    expires: i64,
}

fn check_signature<'a>(key: &str, half: &'a str) -> Result<SignedHalf<'a>, TokenError> {
    let mut parts = half.split(FIELD_SEP);
    let (Some(prefix), Some(payload), Some(sig), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::MalformedToken(
            "signed half must have three fields".into(),
        ));
    };

    // signatures are emitted as lowercase hex only
    if !sig.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(TokenError::SignatureMismatch);
    }
    let sig = hex::decode(sig).map_err(|_| TokenError::SignatureMismatch)?;

    let mut mac = keyed_mac(key)?;
    mac.update(format!("{prefix}{FIELD_SEP}{payload}").as_bytes());
    mac.verify_slice(&sig).map_err(|_| TokenError::SignatureMismatch)?;

    Ok(SignedHalf { prefix, payload })
}

fn decode_half(half: &SignedHalf<'_>, expected_prefix: &str) -> Result<HalfValues, TokenError> {
    if half.prefix != expected_prefix {
        return Err(TokenError::MalformedToken(format!(
            "unexpected prefix {}, wanted {expected_prefix}",
            half.prefix
        )));
    }

    let raw = STANDARD
        .decode(half.payload)
        .map_err(|e| TokenError::MalformedToken(format!("payload is not base64: {e}")))?;
    let cookie = String::from_utf8(raw)
        .map_err(|_| TokenError::MalformedToken("payload is not UTF-8".into()))?;

    let mut fields = cookie.split(FIELD_SEP);
    let (Some(user), Some(ikey), Some(expires), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(TokenError::MalformedToken(
            "payload must have three fields".into(),
        ));
    };

    let expires = expires
        .parse::<i64>()
        .map_err(|_| TokenError::MalformedToken("expiration is not a timestamp".into()))?;

    Ok(HalfValues {
        user: user.to_string(),
        ikey: ikey.to_string(),
        expires,
    })
}

fn keyed_mac(key: &str) -> Result<HmacSha1, TokenError> {
    HmacSha1::new_from_slice(key.as_bytes()).map_err(|e| TokenError::Algorithm(e.to_string()))
}

fn hmac_hex(key: &str, data: &str) -> Result<String, TokenError> {
    let mut mac = keyed_mac(key)?;
    mac.update(data.as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()))
}

// ============================================================================
// TESTS
// ============================================================================
