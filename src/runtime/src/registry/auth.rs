//! Bearer-token authentication against a registry's auth server.
//!
//! Any registry request may be answered with `401` carrying a
//! `WWW-Authenticate: Bearer realm="…",service="…"[,scope="…"]` header. The
//! challenge is answered with a GET to `realm?service=…&scope=…` using basic
//! credentials, yielding a bearer token that is cached per
//! `(service, scope)` for the session.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use regex::Regex;

use crypto_cli_core::error::{CryptoCliError, Result};

use super::credentials::Credentials;

/// Grammar of a bearer challenge header.
const CHALLENGE_PATTERN: &str =
    r#"^\s*Bearer\s+realm="([^"]+)",service="([^"]+)"(,scope="([^"]+)")?\s*$"#;

fn challenge_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(CHALLENGE_PATTERN).expect("challenge pattern is valid"))
}

/// A parsed bearer challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: String,
    pub scope: Option<String>,
}

/// Parse a `WWW-Authenticate` header into a challenge.
pub fn parse_challenge(header: &str) -> Result<BearerChallenge> {
    let captures = challenge_re()
        .captures(header)
        .ok_or_else(|| {
            CryptoCliError::AuthProtocolError(format!("malformed challenge header: {header}"))
        })?;
    Ok(BearerChallenge {
        realm: captures[1].to_string(),
        service: captures[2].to_string(),
        scope: captures.get(4).map(|m| m.as_str().to_string()),
    })
}

/// Token response from the auth server.
#[derive(serde::Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

/// Process-wide token cache: (service, scope) → bearer token. Reads
/// dominate.
fn token_cache() -> &'static Mutex<HashMap<(String, String), String>> {
    static CACHE: OnceLock<Mutex<HashMap<(String, String), String>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Token acquisition against an auth server.
pub struct Authenticator {
    http: reqwest::Client,
    credentials: Credentials,
}

impl Authenticator {
    pub fn new(http: reqwest::Client, credentials: Credentials) -> Self {
        Self { http, credentials }
    }

    /// A cached token for the scope, from any service seen this session.
    pub fn cached_for(&self, scope: &str) -> Option<String> {
        let tokens = token_cache().lock().expect("token cache poisoned");
        tokens
            .iter()
            .find(|((_, s), _)| s == scope)
            .map(|(_, token)| token.clone())
    }

    /// Answer a challenge, caching the fresh token.
    ///
    /// Always contacts the auth server, so a stale cached token is replaced
    /// after a 401 from the registry.
    pub async fn authenticate(
        &self,
        challenge: &BearerChallenge,
        fallback_scope: &str,
    ) -> Result<String> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| fallback_scope.to_string());

        tracing::debug!(
            realm = %challenge.realm,
            service = %challenge.service,
            scope = %scope,
            "Requesting bearer token"
        );

        let mut request = self
            .http
            .get(&challenge.realm)
            .query(&[("service", challenge.service.as_str()), ("scope", scope.as_str())]);
        if let Credentials::Basic { username, password } = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.map_err(|e| {
            CryptoCliError::NetworkError {
                url: challenge.realm.clone(),
                reason: e.to_string(),
            }
        })?;

        if !response.status().is_success() {
            return Err(CryptoCliError::AuthDenied { scope });
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            CryptoCliError::AuthProtocolError(format!("invalid token response: {e}"))
        })?;

        let token = token_response.token;
        token_cache()
            .lock()
            .expect("token cache poisoned")
            .insert((challenge.service.clone(), scope), token.clone());
        Ok(token)
    }
}
