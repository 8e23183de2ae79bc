//! Image reference parsing.
//!
//! Parses references like `ghcr.io/org/image:tag` into a single normalized
//! `ImageRef { registry, repository, tag }`, with the tag defaulting to
//! `latest`. Push and pull address images by tag, so digest references are
//! rejected here.

use crypto_cli_core::error::{CryptoCliError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Registry host serving the v2 API for Docker Hub references.
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry hostname (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx")
    pub repository: String,
    /// Tag, defaulting to "latest"
    pub tag: String,
}

impl ImageRef {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `myuser/myimage` → docker.io/myuser/myimage:latest
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "empty reference"));
        }
        if reference.contains('@') {
            return Err(invalid(reference, "digest references are not supported"));
        }

        // Split tag on the last colon after the last slash
        let (name, tag) = if let Some(slash_pos) = reference.rfind('/') {
            let after_slash = &reference[slash_pos + 1..];
            if let Some(colon_pos) = after_slash.rfind(':') {
                let tag = &after_slash[colon_pos + 1..];
                let name = &reference[..slash_pos + 1 + colon_pos];
                (name.to_string(), Some(tag.to_string()))
            } else {
                (reference.to_string(), None)
            }
        } else if let Some(colon_pos) = reference.rfind(':') {
            // Could be registry:port or name:tag; digits after the colon
            // mean a port
            let after_colon = &reference[colon_pos + 1..];
            if after_colon.chars().all(|c| c.is_ascii_digit()) {
                (reference.to_string(), None)
            } else {
                (
                    reference[..colon_pos].to_string(),
                    Some(after_colon.to_string()),
                )
            }
        } else {
            (reference.to_string(), None)
        };

        let tag = tag.unwrap_or_else(|| DEFAULT_TAG.to_string());
        if tag.is_empty() {
            return Err(invalid(reference, "empty tag"));
        }

        let (registry, repository) = split_registry_repository(&name)
            .map_err(|reason| invalid(reference, &reason))?;

        Ok(ImageRef {
            registry,
            repository,
            tag,
        })
    }

    /// `repository:tag`, as handed to the local daemon.
    pub fn repo_tag(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// Base URL of the registry's v2 API.
    ///
    /// Docker Hub aliases resolve to the dedicated API host. Loopback
    /// registries are addressed over plain HTTP, everything else over
    /// HTTPS.
    pub fn api_base(&self) -> String {
        let host = match self.registry.as_str() {
            "docker.io" | "index.docker.io" => DOCKER_HUB_API_HOST,
            other => other,
        };
        let scheme = if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, host)
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

fn invalid(reference: &str, reason: &str) -> CryptoCliError {
    CryptoCliError::InvalidReference {
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
}

/// Split a name into registry and repository components.
fn split_registry_repository(name: &str) -> std::result::Result<(String, String), String> {
    // The first component is a registry hostname if it contains a dot or
    // colon, or is "localhost"
    if let Some(slash_pos) = name.find('/') {
        let first = &name[..slash_pos];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            let repo = &name[slash_pos + 1..];
            if repo.is_empty() {
                return Err("empty repository".to_string());
            }
            return Ok((first.to_string(), repo.to_string()));
        }
    }

    if name.is_empty() {
        return Err("empty repository".to_string());
    }

    // No registry detected — use the default
    let repository = if name.contains('/') {
        name.to_string()
    } else {
        // Single name like "nginx" → "library/nginx" for Docker Hub
        format!("library/{}", name)
    };

    Ok((DEFAULT_REGISTRY.to_string(), repository))
}
