//! Kalshi request signing with RSA-PSS.
//!
//! Every authenticated REST request and the WebSocket upgrade carry three
//! headers: KALSHI-ACCESS-KEY, KALSHI-ACCESS-TIMESTAMP and
//! KALSHI-ACCESS-SIGNATURE. The signature is RSA-PSS (SHA-256,
//! MGF1-SHA-256, salt length = digest length) over
//! `"{timestamp_ms}{METHOD}{path}"`, base64-encoded.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::{info, warn};
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::{Signature, SigningKey};
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::RsaPrivateKey;
use std::env;
use std::sync::Arc;

pub const ACCESS_KEY_HEADER: &str = "KALSHI-ACCESS-KEY";
pub const ACCESS_TIMESTAMP_HEADER: &str = "KALSHI-ACCESS-TIMESTAMP";
pub const ACCESS_SIGNATURE_HEADER: &str = "KALSHI-ACCESS-SIGNATURE";

#[derive(Clone)]
pub struct KalshiAuthenticator {
    api_key: String,
    private_key: Arc<RsaPrivateKey>,
}

impl std::fmt::Debug for KalshiAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        f.debug_struct("KalshiAuthenticator")
            .field("api_key_suffix", &self.api_key_suffix())
            .finish()
    }
}

impl KalshiAuthenticator {
    /// Create an authenticator from an inline PEM string. Escaped `\n`
    /// sequences (as they appear in env vars) are unescaped first.
    pub fn new(api_key: String, private_key_pem: &str) -> Result<Self> {
        let pem = private_key_pem.replace("\\n", "\n");
        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .context("Failed to parse Kalshi private key PEM")?;
        Ok(Self {
            api_key,
            private_key: Arc::new(private_key),
        })
    }

    pub fn from_pem_file(api_key: String, path: &str) -> Result<Self> {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read private key from {}", path))?;
        Self::new(api_key, &pem)
    }

    /// Build from environment variables:
    /// - KALSHI_API_KEY: the API key ID
    /// - KALSHI_PRIVATE_KEY: inline PEM (newlines may be escaped as \n)
    /// - KALSHI_PRIVATE_KEY_PATH: path to a PEM file (alternative)
    ///
    /// Returns Ok(None) when no credentials are configured; Kalshi
    /// listeners then fail at spawn time instead of process start.
    pub fn from_env() -> Result<Option<Self>> {
        let api_key = match env::var("KALSHI_API_KEY") {
            Ok(k) if !k.is_empty() => k,
            _ => {
                warn!("KALSHI_API_KEY not set; kalshi listeners will be unavailable");
                return Ok(None);
            }
        };

        let auth = if let Ok(pem) = env::var("KALSHI_PRIVATE_KEY") {
            Self::new(api_key, &pem)?
        } else if let Ok(path) = env::var("KALSHI_PRIVATE_KEY_PATH") {
            Self::from_pem_file(api_key, &path)?
        } else {
            warn!("KALSHI_API_KEY set but no private key; kalshi listeners will be unavailable");
            return Ok(None);
        };

        info!(
            "Kalshi authenticator initialized (API key: ...{})",
            auth.api_key_suffix()
        );
        Ok(Some(auth))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    fn api_key_suffix(&self) -> &str {
        if self.api_key.len() > 4 {
            &self.api_key[self.api_key.len() - 4..]
        } else {
            &self.api_key
        }
    }

    fn sign(&self, message: &str) -> String {
        let signing_key = SigningKey::<Sha256>::new((*self.private_key).clone());
        let mut rng = rand::thread_rng();
        let signature: Signature = signing_key.sign_with_rng(&mut rng, message.as_bytes());
        BASE64.encode(signature.to_bytes())
    }

    /// Headers for an authenticated request. `path` is the full API path
    /// as seen by the server (e.g. "/trade-api/v2/markets", excluding the
    /// query string).
    pub fn headers(&self, method: &str, path: &str) -> Vec<(&'static str, String)> {
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        self.headers_at(timestamp_ms, method, path)
    }

    fn headers_at(&self, timestamp_ms: i64, method: &str, path: &str) -> Vec<(&'static str, String)> {
        let message = format!("{}{}{}", timestamp_ms, method.to_uppercase(), path);
        let signature = self.sign(&message);
        vec![
            (ACCESS_KEY_HEADER, self.api_key.clone()),
            (ACCESS_TIMESTAMP_HEADER, timestamp_ms.to_string()),
            (ACCESS_SIGNATURE_HEADER, signature),
        ]
    }

    /// Headers for the WebSocket upgrade request. Kalshi authenticates the
    /// handshake itself, not a post-connect login command.
    pub fn ws_headers(&self, ws_path: &str) -> Vec<(&'static str, String)> {
        self.headers("GET", ws_path)
    }
}
