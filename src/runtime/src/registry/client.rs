//! Registry v2 API client.
//!
//! Implements the distribution protocol surface the workflows need: blob
//! existence checks, the POST/PUT upload handshake, manifest PUT/GET, and
//! streaming blob downloads with digest verification.
//!
//! Transient failures (connection errors, timeouts, 5xx) are retried with
//! exponential backoff: base 500 ms, factor 2, capped at 8 s, at most 5
//! attempts. 429 honors `Retry-After`. Other 4xx are never retried. A 401
//! at any point runs the bearer-challenge handshake and repeats the request
//! with the fresh token; two consecutive 401s on the same scope surface as
//! `AuthDenied`.

use std::path::Path;
use std::time::Duration;

use reqwest::{header, Response, StatusCode};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crypto_cli_core::error::{CryptoCliError, Result};

use super::auth::{parse_challenge, Authenticator};
use super::credentials::Credentials;
use crate::digest::Digest;
use crate::manifest::{ImageManifest, MANIFEST_MEDIA_TYPE};
use crate::reference::ImageRef;

/// Maximum request attempts for transient failures.
const MAX_ATTEMPTS: u32 = 5;

/// Initial retry backoff.
const BASE_DELAY: Duration = Duration::from_millis(500);

/// Backoff ceiling.
const MAX_DELAY: Duration = Duration::from_secs(8);

/// Registry header carrying the canonical manifest digest.
const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Client for one repository on one registry.
pub struct RegistryClient {
    http: reqwest::Client,
    base: String,
    repository: String,
    scope: String,
    authenticator: Authenticator,
    cancel: CancellationToken,
}

impl RegistryClient {
    /// Client scoped for pushing to the referenced repository.
    pub fn for_push(
        reference: &ImageRef,
        credentials: Credentials,
        cancel: CancellationToken,
    ) -> Self {
        let scope = format!("repository:{}:pull,push", reference.repository);
        Self::with_base(
            reference.api_base(),
            reference.repository.clone(),
            credentials,
            scope,
            cancel,
        )
    }

    /// Client scoped for pulling from the referenced repository.
    pub fn for_pull(
        reference: &ImageRef,
        credentials: Credentials,
        cancel: CancellationToken,
    ) -> Self {
        let scope = format!("repository:{}:pull", reference.repository);
        Self::with_base(
            reference.api_base(),
            reference.repository.clone(),
            credentials,
            scope,
            cancel,
        )
    }

    /// Client against an explicit API base URL.
    pub fn with_base(
        base: impl Into<String>,
        repository: impl Into<String>,
        credentials: Credentials,
        scope: String,
        cancel: CancellationToken,
    ) -> Self {
        // The shared client pools connections and honors proxy variables.
        let http = reqwest::Client::new();
        let authenticator = Authenticator::new(http.clone(), credentials);
        Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            repository: repository.into(),
            scope,
            authenticator,
            cancel,
        }
    }

    /// Whether the registry already has the blob (HEAD returning 200).
    pub async fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        let url = self.blob_url(digest);
        let response = self.execute(|| async { Ok(self.http.head(&url)) }).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(CryptoCliError::HttpStatus {
                status: status.as_u16(),
                url,
            }),
        }
    }

    /// Upload one blob via the POST/PUT handshake, skipping blobs the
    /// registry already has.
    pub async fn upload_blob(&self, path: &Path, digest: &Digest, size: u64) -> Result<()> {
        if self.blob_exists(digest).await? {
            tracing::info!(digest = %digest, "Blob exists, skipping upload");
            return Ok(());
        }

        let post_url = format!("{}/v2/{}/blobs/uploads/", self.base, self.repository);
        let response = self
            .execute(|| async { Ok(self.http.post(&post_url)) })
            .await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(CryptoCliError::UploadFailed {
                digest: digest.to_string(),
                status: response.status().as_u16(),
            });
        }
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                CryptoCliError::Other("Upload session returned no Location".to_string())
            })?;
        let upload_url = self.resolve_location(location, digest);

        let response = self
            .execute(|| async {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| CryptoCliError::io(path, e))?;
                Ok(self
                    .http
                    .put(&upload_url)
                    .header(header::CONTENT_LENGTH, size)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(reqwest::Body::wrap_stream(ReaderStream::new(file))))
            })
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(CryptoCliError::UploadFailed {
                digest: digest.to_string(),
                status: response.status().as_u16(),
            });
        }

        tracing::info!(digest = %digest, size, "Uploaded blob");
        Ok(())
    }

    /// PUT the manifest for a tag, returning the registry's canonical
    /// digest.
    pub async fn put_manifest(&self, tag: &str, manifest: &ImageManifest) -> Result<Digest> {
        let body = manifest.to_canonical_json()?;
        let url = format!("{}/v2/{}/manifests/{}", self.base, self.repository, tag);

        let response = self
            .execute(|| {
                let body = body.clone();
                let url = &url;
                async move {
                    Ok(self
                        .http
                        .put(url)
                        .header(header::CONTENT_TYPE, MANIFEST_MEDIA_TYPE)
                        .body(body))
                }
            })
            .await?;

        if response.status() != StatusCode::CREATED {
            return Err(CryptoCliError::HttpStatus {
                status: response.status().as_u16(),
                url,
            });
        }

        let digest = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                CryptoCliError::Other(
                    "Registry did not return Docker-Content-Digest".to_string(),
                )
            })?;
        Digest::parse(digest)
    }

    /// GET and parse the manifest for a tag.
    pub async fn get_manifest(&self, tag: &str) -> Result<ImageManifest> {
        let url = format!("{}/v2/{}/manifests/{}", self.base, self.repository, tag);
        let response = self
            .execute(|| async {
                Ok(self
                    .http
                    .get(&url)
                    .header(header::ACCEPT, MANIFEST_MEDIA_TYPE))
            })
            .await?;

        if response.status() != StatusCode::OK {
            return Err(CryptoCliError::HttpStatus {
                status: response.status().as_u16(),
                url,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| CryptoCliError::NetworkError {
                url,
                reason: e.to_string(),
            })?;
        ImageManifest::parse(&text)
    }

    /// Stream a blob to disk, verifying its digest on completion.
    pub async fn get_blob(&self, expected: &Digest, dest: &Path) -> Result<()> {
        let url = self.blob_url(expected);
        let response = self.execute(|| async { Ok(self.http.get(&url)) }).await?;

        if response.status() != StatusCode::OK {
            return Err(CryptoCliError::HttpStatus {
                status: response.status().as_u16(),
                url,
            });
        }

        let result = self.stream_to_file(response, expected, dest, &url).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }

    async fn stream_to_file(
        &self,
        mut response: Response,
        expected: &Digest,
        dest: &Path,
        url: &str,
    ) -> Result<()> {
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| CryptoCliError::io(dest, e))?;
        let mut hasher = Sha256::new();

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CryptoCliError::Cancelled),
                chunk = response.chunk() => chunk,
            };
            match chunk {
                Ok(Some(bytes)) => {
                    hasher.update(&bytes);
                    file.write_all(&bytes)
                        .await
                        .map_err(|e| CryptoCliError::io(dest, e))?;
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(CryptoCliError::NetworkError {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        file.flush().await.map_err(|e| CryptoCliError::io(dest, e))?;

        let actual = Digest::from_sha256(hasher.finalize());
        if &actual != expected {
            return Err(CryptoCliError::CorruptTransport {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        tracing::debug!(digest = %expected, "Downloaded blob");
        Ok(())
    }

    /// Run one logical request through the auth and retry state machine.
    ///
    /// `build` is called once per attempt so streaming bodies can be
    /// reopened.
    async fn execute<F, Fut>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::RequestBuilder>>,
    {
        let mut token = self.authenticator.cached_for(&self.scope);
        let mut auth_failures = 0u32;
        let mut attempt = 0u32;
        let mut delay = BASE_DELAY;

        loop {
            if self.cancel.is_cancelled() {
                return Err(CryptoCliError::Cancelled);
            }

            let mut builder = build().await?;
            if let Some(token) = &token {
                builder = builder.bearer_auth(token);
            }
            let request = builder
                .build()
                .map_err(|e| CryptoCliError::Other(format!("Invalid request: {e}")))?;
            let url = request.url().to_string();

            let response = match self.http.execute(request).await {
                Ok(response) => response,
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(CryptoCliError::NetworkError {
                            url,
                            reason: e.to_string(),
                        });
                    }
                    tracing::debug!(url = %url, attempt, error = %e, "Retrying after network error");
                    self.backoff(&mut delay, None).await?;
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                auth_failures += 1;
                if auth_failures >= 2 {
                    return Err(CryptoCliError::AuthDenied {
                        scope: self.scope.clone(),
                    });
                }
                let challenge_header = response
                    .headers()
                    .get(header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        CryptoCliError::AuthProtocolError(
                            "401 without WWW-Authenticate header".to_string(),
                        )
                    })?;
                let challenge = parse_challenge(challenge_header)?;
                token = Some(self.authenticator.authenticate(&challenge, &self.scope).await?);
                continue;
            }
            auth_failures = 0;

            if status == StatusCode::TOO_MANY_REQUESTS {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(CryptoCliError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                let retry_after = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs);
                self.backoff(&mut delay, retry_after).await?;
                continue;
            }

            if status.is_server_error() {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(CryptoCliError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                tracing::debug!(url = %url, status = status.as_u16(), attempt, "Retrying after server error");
                self.backoff(&mut delay, None).await?;
                continue;
            }

            return Ok(response);
        }
    }

    /// Sleep for the current backoff (or an explicit `Retry-After`), then
    /// double the delay up to the ceiling. Aborts promptly on cancellation.
    async fn backoff(&self, delay: &mut Duration, hint: Option<Duration>) -> Result<()> {
        let wait = hint.unwrap_or(*delay);
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(CryptoCliError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
        *delay = (*delay * 2).min(MAX_DELAY);
        Ok(())
    }

    fn blob_url(&self, digest: &Digest) -> String {
        format!("{}/v2/{}/blobs/{}", self.base, self.repository, digest)
    }

    /// Make an upload `Location` absolute and attach the digest parameter.
    fn resolve_location(&self, location: &str, digest: &Digest) -> String {
        let absolute = if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}{}", self.base, location)
        };
        let separator = if absolute.contains('?') { '&' } else { '?' };
        format!("{absolute}{separator}digest={digest}")
    }
}
