//! Credential checks against the external authorization endpoint.
//!
//! Each password or public-key attempt becomes one `GET` to the configured
//! URL with `username` and either `password` or `key` (base64url of the SSH
//! wire-format public key) appended as query parameters. Any 2xx response
//! grants access. Everything else, including a timeout or a transport error,
//! denies it. There are no retries.

use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

use crate::error::TunnelError;

/// HTTP client for the authorization endpoint.
pub struct Authorizer {
    client: reqwest::Client,
    endpoint: Url,
}

impl Authorizer {
    /// Create a new authorizer. `timeout` bounds every call.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("Invalid authorization endpoint: {}", endpoint))?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("tunnel-gateway/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, endpoint })
    }

    /// Check a username/password pair.
    pub async fn check_password(&self, username: &str, password: &str) -> Result<(), TunnelError> {
        let url = self.url_with(&[("username", username), ("password", password)]);
        self.check(username, url).await
    }

    /// Check a username/public key pair.
    pub async fn check_public_key(&self, username: &str, key: &PublicKey) -> Result<(), TunnelError> {
        let encoded = encode_public_key(key);
        debug!(
            "Checking key {} for user '{}'",
            compute_fingerprint_from_pubkey(key),
            username
        );
        let url = self.url_with(&[("username", username), ("key", &encoded)]);
        self.check(username, url).await
    }

    fn url_with(&self, params: &[(&str, &str)]) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().extend_pairs(params);
        url
    }

    async fn check(&self, username: &str, url: Url) -> Result<(), TunnelError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TunnelError::AuthenticationDenied(format!("endpoint unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TunnelError::AuthenticationDenied(format!(
                "endpoint returned {} for user {}",
                status, username
            )));
        }

        info!("Authorized user '{}'", username);
        Ok(())
    }
}

/// Base64url (no padding) of the SSH wire-format key blob.
pub fn encode_public_key(key: &PublicKey) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key.public_key_bytes())
}

/// Compute fingerprint from raw key bytes (wire format).
/// SSH fingerprint = SHA256(raw_key_bytes_in_wire_format)
pub fn compute_fingerprint_from_bytes(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();

    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}

/// Compute fingerprint from a russh public key.
pub fn compute_fingerprint_from_pubkey(key: &PublicKey) -> String {
    compute_fingerprint_from_bytes(&key.public_key_bytes())
}
