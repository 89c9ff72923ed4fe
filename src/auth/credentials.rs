//! Credential resolution for both transports.
//!
//! SSH keys are compared by their canonical `"<algorithm> <base64>"` text,
//! the same form `add-key` stores. HTTP Basic credentials are tried as a
//! password login first and then as an access token in the username slot.

use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use tracing::{debug, instrument};

use super::access::{DenyReason, Principal};
use super::AuthError;
use crate::db::{AuthorizedKey, Database, User};
use crate::error::GatewayError;

// ---------------------------------------------------------------------------
// SSH
// ---------------------------------------------------------------------------

/// Canonical stored form of an offered key.
pub fn canonical_key(key: &PublicKey) -> String {
    format!("{} {}", key.name(), key.public_key_base64())
}

/// Parse an `authorized_keys`-style line (`algo base64 [comment]`) into the
/// canonical form. The comment is dropped.
pub fn parse_authorized_key(line: &str) -> Result<String, AuthError> {
    let mut parts = line.split_whitespace();
    let (Some(algo), Some(blob)) = (parts.next(), parts.next()) else {
        return Err(AuthError::InvalidKey(
            "expected '<algorithm> <base64>'".to_string(),
        ));
    };
    let key = russh_keys::parse_public_key_base64(blob)
        .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
    if key.name() != algo {
        return Err(AuthError::InvalidKey(format!(
            "algorithm '{algo}' does not match key type '{}'",
            key.name()
        )));
    }
    Ok(canonical_key(&key))
}

/// Handshake-time lookup. Only the key row comes back; who it stands for is
/// resolved later by the dispatcher.
pub async fn lookup_ssh_key(db: &Database, key: &PublicKey) -> crate::db::Result<Option<AuthorizedKey>> {
    db.keys().find_by_content(&canonical_key(key)).await
}

/// Resolve the key id passed to `serv` into a principal.
pub async fn principal_for_key(db: &Database, key_id: i64) -> Result<Principal, GatewayError> {
    let key = db.keys().get_by_id(key_id).await.map_err(|e| {
        if e.is_not_found() {
            GatewayError::AuthenticationFailed(format!("unknown key id {key_id}"))
        } else {
            e.into()
        }
    })?;
    if key.is_deploy_key() {
        return Ok(Principal::DeployKey(key));
    }
    let user = db.users().get_by_key_id(key.id).await?;
    Ok(Principal::User(user))
}

// ---------------------------------------------------------------------------
// HTTP Basic
// ---------------------------------------------------------------------------

/// Decode an `Authorization: Basic ...` header value. `None` when the value
/// is absent, of another scheme, or not valid base64 `user:pass`.
pub fn parse_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Password login, then token fallback. Every failure is an error; callers
/// answer all of them with the same challenge.
#[instrument(skip(db, password))]
pub async fn resolve_basic(db: &Database, username: &str, password: &str) -> Result<User, GatewayError> {
    if let Some(user) = db.users().authenticate(username, password).await? {
        if user.two_factor_enabled {
            return Err(GatewayError::AuthorizationDenied(
                DenyReason::TwoFactorRestricted,
            ));
        }
        return Ok(user);
    }

    match db.tokens().get_by_plaintext(username).await {
        Ok(token) => {
            db.tokens().touch(token.id).await?;
            debug!(token_id = token.id, "authenticated with access token");
            Ok(db.users().get_by_id(token.user_id).await?)
        }
        Err(e) if e.is_not_found() => Err(GatewayError::AuthenticationFailed(format!(
            "bad credentials for '{username}'"
        ))),
        Err(e) => Err(e.into()),
    }
}
