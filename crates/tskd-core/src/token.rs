//! Bearer-token authentication for the HTTP transport (§6.1).
//!
//! A token is an HMAC-SHA256 MAC over the role name, keyed by a secret
//! shared between `tskd serve` and whoever mints tokens for callers.
//! Format: `tskd_<role>_<hmac_hex>`. There is no expiry or scoping beyond
//! the role: revocation means rotating the secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::auth::Role;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "tskd_";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),
    #[error("unknown role in token: {0}")]
    UnknownRole(String),
    #[error("token HMAC verification failed")]
    HmacMismatch,
    #[error("missing token secret")]
    MissingSecret,
}

/// The shared HMAC secret used to mint and verify tokens.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: Vec<u8>,
}

impl TokenConfig {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Load the secret from `TSKD_TOKEN_SECRET`, hex-encoded.
    pub fn from_env() -> Result<Self, TokenError> {
        let secret_hex = std::env::var("TSKD_TOKEN_SECRET").map_err(|_| TokenError::MissingSecret)?;
        let secret =
            hex::decode(&secret_hex).map_err(|e| TokenError::InvalidFormat(format!("TSKD_TOKEN_SECRET is not valid hex: {e}")))?;
        Ok(Self::new(secret))
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Viewer => "viewer",
        Role::Editor => "editor",
    }
}

fn compute_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Mint a bearer token scoped to `role`.
pub fn generate_token(config: &TokenConfig, role: Role) -> String {
    let name = role_name(role);
    let mac = compute_hmac(&config.secret, name.as_bytes());
    format!("{PREFIX}{name}_{}", hex::encode(mac))
}

/// Validate a bearer token and recover the role it was minted for.
pub fn validate_token(config: &TokenConfig, token: &str) -> Result<Role, TokenError> {
    let rest = token
        .strip_prefix(PREFIX)
        .ok_or_else(|| TokenError::InvalidFormat("token must start with 'tskd_'".to_string()))?;
    let (name, hmac_hex) = rest
        .split_once('_')
        .ok_or_else(|| TokenError::InvalidFormat("expected underscore between role and hmac".to_string()))?;
    let role = match name {
        "viewer" => Role::Viewer,
        "editor" => Role::Editor,
        other => return Err(TokenError::UnknownRole(other.to_string())),
    };

    let provided_mac =
        hex::decode(hmac_hex).map_err(|e| TokenError::InvalidFormat(format!("invalid hex in hmac: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(&config.secret).expect("HMAC accepts a key of any size");
    mac.update(name.as_bytes());
    mac.verify_slice(&provided_mac).map_err(|_| TokenError::HmacMismatch)?;

    Ok(role)
}
