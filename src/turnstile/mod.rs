//! Cloudflare Turnstile token verification.
//!
//! The verifier decides whether a client-presented challenge token is valid
//! while minimizing calls to the remote siteverify API: a successful
//! verification is cached single-use for ten minutes, keyed by a digest of
//! the token plus the client IP, so framework-internal retries of the same
//! request do not hit the network twice.
//!
//! The public contract is a plain boolean. Every failure mode (missing
//! configuration, malformed token, unreachable store, HTTP errors, rejected
//! challenges) degrades to `false` and is logged; nothing is thrown to the
//! caller. Fail-closed.

use std::sync::Arc;

use anyhow::Result;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, instrument, warn};

use crate::cache::CacheService;
use crate::gardisto::APP_USER_AGENT;
use crate::store::KeyValueStore;

pub mod gate;

pub const TURNSTILE_VERIFY_URL: &str =
    "https://challenges.cloudflare.com/turnstile/v0/siteverify";

/// Namespace for cached verdicts; distinct from the general cache prefix so
/// the two components never collide on the shared store.
pub const TURNSTILE_CACHE_PREFIX: &str = "turnstile:";

/// Cached verdicts expire after ten minutes if never consumed.
const RESULT_TTL_SECONDS: i64 = 600;

/// Tokens can be long; hashing only the head bounds key size and keeps the
/// full secret out of the store.
const TOKEN_DIGEST_CHARS: usize = 32;

#[derive(Debug, Clone)]
pub struct TurnstileConfig {
    pub enabled: bool,
    pub secret_key: Option<SecretString>,
    pub bypass_token: Option<SecretString>,
    pub production: bool,
}

impl TurnstileConfig {
    /// Disabled subsystem; every token verifies as valid.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            secret_key: None,
            bypass_token: None,
            production: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SiteverifyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

#[derive(Clone)]
pub struct TurnstileVerifier {
    config: TurnstileConfig,
    cache: CacheService,
    client: reqwest::Client,
    verify_url: String,
}

impl TurnstileVerifier {
    /// Build a verifier over the shared key-value store.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: TurnstileConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .build()?;

        Ok(Self {
            config,
            cache: CacheService::new(store, TURNSTILE_CACHE_PREFIX),
            client,
            verify_url: TURNSTILE_VERIFY_URL.to_string(),
        })
    }

    /// Point the verifier at a different siteverify endpoint. Used by tests
    /// and self-hosted verification proxies.
    #[must_use]
    pub fn with_verify_url(mut self, url: impl Into<String>) -> Self {
        self.verify_url = url.into();
        self
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Verify a challenge token. Never fails: all error paths return `false`
    /// except the disabled and bypass paths, which return `true`.
    #[instrument(skip(self, token))]
    pub async fn verify(&self, token: &str, remote_ip: Option<&str>) -> bool {
        if !self.config.enabled {
            debug!("turnstile disabled, skipping verification");
            return true;
        }

        if token.trim().is_empty() {
            warn!("empty turnstile token");
            return false;
        }

        let Some(secret) = self
            .config
            .secret_key
            .as_ref()
            .filter(|secret| !secret.expose_secret().is_empty())
        else {
            error!("turnstile enabled but no secret key configured");
            return false;
        };

        // The bypass token is for integration environments only; production
        // never honors it, whatever the configuration says.
        if !self.config.production {
            if let Some(bypass) = &self.config.bypass_token {
                if !bypass.expose_secret().is_empty() && token == bypass.expose_secret() {
                    info!("turnstile bypass token accepted outside production");
                    return true;
                }
            }
        }

        let key = result_cache_key(token, remote_ip);

        // Single-use consume: a hit is deleted immediately. The read+delete
        // pair is not atomic; two concurrent verifications of the same
        // token+IP could both observe the hit within that window. Accepted:
        // the window is narrow and replaying a consumed token buys nothing
        // beyond what the original verification already granted.
        match self.cache.get::<bool>(&key).await {
            Ok(Some(verdict)) => {
                if let Err(err) = self.cache.delete(&key).await {
                    warn!(error = %err, "failed to consume cached turnstile verdict");
                }
                debug!(verdict, "turnstile verdict served from cache");
                return verdict;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "turnstile cache read failed, calling remote verifier");
            }
        }

        let verdict = self.verify_remote(secret, token, remote_ip).await;

        // Only successful verifications are cached. A write failure loses the
        // caching side effect, not the verdict already obtained.
        if verdict {
            if let Err(err) = self
                .cache
                .set(&key, &true, Some(RESULT_TTL_SECONDS))
                .await
            {
                warn!(error = %err, "failed to cache turnstile verdict");
            }
        }

        verdict
    }

    async fn verify_remote(
        &self,
        secret: &SecretString,
        token: &str,
        remote_ip: Option<&str>,
    ) -> bool {
        let mut form = vec![
            ("secret", secret.expose_secret().to_string()),
            ("response", token.to_string()),
        ];
        // remoteip is omitted entirely when the caller has no address.
        if let Some(ip) = remote_ip {
            form.push(("remoteip", ip.to_string()));
        }

        let response = match self.client.post(&self.verify_url).form(&form).send().await {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "turnstile verification request failed");
                return false;
            }
        };

        if !response.status().is_success() {
            error!(status = %response.status(), "turnstile verification returned non-OK status");
            return false;
        }

        match response.json::<SiteverifyResponse>().await {
            Ok(body) if body.success => {
                debug!("turnstile verification succeeded");
                true
            }
            Ok(body) => {
                warn!(error_codes = ?body.error_codes, "turnstile verification rejected");
                false
            }
            Err(err) => {
                error!(error = %err, "malformed turnstile verification response");
                false
            }
        }
    }
}

/// Derive the single-use cache key: digest of the token head, plus the client
/// IP (or `unknown`). The `turnstile:` namespace is applied by the cache.
fn result_cache_key(token: &str, remote_ip: Option<&str>) -> String {
    let head: String = token.chars().take(TOKEN_DIGEST_CHARS).collect();
    let digest = Sha256::digest(head.as_bytes());
    format!("{}:{}", hex::encode(digest), remote_ip.unwrap_or("unknown"))
}
