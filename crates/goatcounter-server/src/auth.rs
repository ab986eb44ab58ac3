//! API authentication: bearer/basic tokens and the buffer sidecar secret.

use axum::http::{header, HeaderMap};
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};

use goatcounter_core::site::{ApiToken, Permissions};

use crate::error::AppError;
use crate::state::AppState;

/// Key in the `store` table holding the buffer sidecar's shared secret.
pub const BUFFER_SECRET_KEY: &str = "buffer-secret";

/// Header the buffer sidecar sets on forwarded batches.
pub const BUFFER_HEADER: &str = "x-goatcounter-buffer";

/// Tokens are stored as the hex SHA-256 of the secret.
pub fn hash_token(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// New random secret, for API tokens and the buffer key.
pub fn generate_secret() -> String {
    let mut raw = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

/// Secret from `Authorization: Bearer …`, or the password slot of
/// `Authorization: Basic …`.
pub fn extract_secret(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, rest) = value.split_once(' ')?;
    let rest = rest.trim();
    if scheme.eq_ignore_ascii_case("bearer") {
        return (!rest.is_empty()).then(|| rest.to_string());
    }
    if scheme.eq_ignore_ascii_case("basic") {
        let decoded = base64::engine::general_purpose::STANDARD.decode(rest).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (_, password) = decoded.split_once(':')?;
        return (!password.is_empty()).then(|| password.to_string());
    }
    None
}

/// Who is calling the API.
#[derive(Debug, Clone)]
pub enum Caller {
    Token(ApiToken),
    /// The buffer sidecar, forwarding on behalf of the `Host` it was sent to.
    Buffer,
}

impl Caller {
    pub fn require(&self, perm: Permissions) -> Result<(), AppError> {
        match self {
            Caller::Token(t) if t.permissions.has(perm) => Ok(()),
            Caller::Token(_) => Err(AppError::Forbidden(format!(
                "token doesn't have the {perm} permission"
            ))),
            Caller::Buffer if perm == Permissions::COUNT => Ok(()),
            Caller::Buffer => Err(AppError::Forbidden(
                "buffer secret can only be used to count".to_string(),
            )),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Caller, AppError> {
    let secret = extract_secret(headers)
        .ok_or_else(|| AppError::Unauthorized("no API token in Authorization header".into()))?;

    let from_buffer = headers
        .get(BUFFER_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "1");
    if from_buffer {
        let stored = state.store.get_value(BUFFER_SECRET_KEY).await?;
        return match stored {
            Some(key) if constant_time_eq(key.as_bytes(), secret.as_bytes()) => Ok(Caller::Buffer),
            _ => Err(AppError::Unauthorized("invalid buffer secret".into())),
        };
    }

    let token = state
        .store
        .api_token_by_hash(&hash_token(&secret))
        .await?
        .ok_or_else(|| AppError::Unauthorized("unknown API token".into()))?;
    if let Err(e) = state.store.touch_api_token(token.id, Utc::now()).await {
        tracing::warn!(token_id = token.id, error = %e, "updating last_used_at failed");
    }
    Ok(Caller::Token(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_and_basic() {
        let mut h = HeaderMap::new();
        assert_eq!(extract_secret(&h), None);

        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_secret(&h).as_deref(), Some("abc"));

        // "anything:secret"
        h.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic YW55dGhpbmc6c2VjcmV0"),
        );
        assert_eq!(extract_secret(&h).as_deref(), Some("secret"));

        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_secret(&h), None);
    }

    #[test]
    fn token_hash_is_sha256_hex() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(generate_secret().len(), 48);
    }
}
