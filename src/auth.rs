use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::error::ApiError;
use crate::state::SharedState;
use crate::store::AuthedTenant;

/// SHA-256 hex digest of a raw API token. Keys are stored and compared only
/// in hashed form; the raw token is shown once at creation.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.trim().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("authorization")?.to_str().ok()?;
    let mut parts = raw.splitn(2, char::is_whitespace);
    let scheme = parts.next()?.trim();
    let rest = parts.next()?.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || rest.is_empty() {
        return None;
    }
    Some(rest.to_string())
}

/// Resolve the caller's tenant scope or reject with `unauthorized`.
pub fn require_tenant(state: &SharedState, headers: &HeaderMap) -> Result<AuthedTenant, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    let hash = hash_token(&token);
    state
        .store
        .auth_by_token_hash(&hash)?
        .ok_or(ApiError::Unauthorized)
}

fn token_matches(presented: &str, configured: &str) -> bool {
    // Compare hashes so the comparison cost is independent of the secret.
    !configured.is_empty() && hash_token(presented) == hash_token(configured)
}

pub fn require_admin(state: &SharedState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    if token_matches(&token, &state.config.admin_token) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Admin token or the read-only monitor token; used for status summaries.
pub fn require_monitor(state: &SharedState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    if token_matches(&token, &state.config.admin_token)
        || token_matches(&token, &state.config.monitor_token)
    {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Generate a fresh raw API token. Only the hash is persisted.
pub fn generate_token() -> String {
    format!("pw_{}", uuid::Uuid::new_v4().simple())
}
