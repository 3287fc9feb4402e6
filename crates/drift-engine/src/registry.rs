//! Remote digest resolution
//!
//! Registry families differ only in where the pull token comes from and how
//! the token request is parameterised. Both live in one strategy table.

use crate::config::RegistryConfig;
use crate::reference::ImageRef;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

pub const MEDIA_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Resolves the digest a registry currently serves for an image tag.
///
/// `None` means "unknown", never "up to date".
#[async_trait]
pub trait DigestResolver: Send + Sync {
    async fn resolve(&self, image: &ImageRef) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryFamily {
    Ghcr,
    DockerHub,
    GitLab,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthStyle {
    /// `?scope=repository:{repo}:pull`
    Scope,
    /// `?service={service}&scope=repository:{repo}:pull`
    ServiceScope(&'static str),
}

#[derive(Debug, Clone, Copy)]
struct RegistryStrategy {
    family: RegistryFamily,
    hosts: &'static [&'static str],
    token_endpoint: &'static str,
    auth: AuthStyle,
    manifest_endpoint: &'static str,
}

static STRATEGIES: [RegistryStrategy; 4] = [
    RegistryStrategy {
        family: RegistryFamily::Ghcr,
        hosts: &["ghcr.io"],
        token_endpoint: "{scheme}://{host}/token",
        auth: AuthStyle::Scope,
        manifest_endpoint: "{scheme}://{host}/v2/{repo}/manifests/{tag}",
    },
    RegistryStrategy {
        family: RegistryFamily::DockerHub,
        hosts: &["docker.io", "registry.hub.docker.com"],
        token_endpoint: "{scheme}://auth.docker.io/token",
        auth: AuthStyle::ServiceScope("registry.docker.io"),
        manifest_endpoint: "{scheme}://registry-1.docker.io/v2/{repo}/manifests/{tag}",
    },
    RegistryStrategy {
        family: RegistryFamily::GitLab,
        hosts: &["registry.gitlab.com"],
        token_endpoint: "{scheme}://gitlab.com/jwt/auth",
        auth: AuthStyle::ServiceScope("container_registry"),
        manifest_endpoint: "{scheme}://{host}/v2/{repo}/manifests/{tag}",
    },
    RegistryStrategy {
        family: RegistryFamily::Generic,
        hosts: &[],
        token_endpoint: "{scheme}://{host}/v2/token",
        auth: AuthStyle::Scope,
        manifest_endpoint: "{scheme}://{host}/v2/{repo}/manifests/{tag}",
    },
];

fn strategy_for(host: &str) -> &'static RegistryStrategy {
    let host = host.to_ascii_lowercase();
    STRATEGIES
        .iter()
        .find(|s| s.hosts.contains(&host.as_str()))
        .unwrap_or(&STRATEGIES[3])
}

/// Fully expanded URLs for one image lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub family: RegistryFamily,
    pub token_url: String,
    pub token_query: Vec<(String, String)>,
    pub manifest_url: String,
}

impl Endpoints {
    pub fn for_image(image: &ImageRef, scheme: &str) -> Self {
        let strategy = strategy_for(&image.source);
        let repo = image.repository();
        let expand = |template: &str| {
            template
                .replace("{scheme}", scheme)
                .replace("{host}", &image.source)
                .replace("{repo}", &repo)
                .replace("{tag}", &image.tag)
        };

        let scope = format!("repository:{repo}:pull");
        let token_query = match strategy.auth {
            AuthStyle::Scope => vec![("scope".to_string(), scope)],
            AuthStyle::ServiceScope(service) => vec![
                ("service".to_string(), service.to_string()),
                ("scope".to_string(), scope),
            ],
        };

        Self {
            family: strategy.family,
            token_url: expand(strategy.token_endpoint),
            token_query,
            manifest_url: expand(strategy.manifest_endpoint),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestIndex {
    #[serde(default)]
    manifests: Option<Vec<ManifestDescriptor>>,
}

#[derive(Debug, Deserialize)]
struct ManifestDescriptor {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    digest: String,
}

/// Outcome of a single lookup attempt.
enum Attempt {
    Found(String),
    /// Registry says the tag or repository is not there; retrying will not help
    Absent,
    Retry(String),
}

/// Registry client implementing [`DigestResolver`] over HTTPS.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    attempts: u32,
    retry_delay: Duration,
    scheme: String,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            attempts: config.attempts.max(1),
            retry_delay: config.retry_delay,
            scheme: config.scheme.clone(),
        })
    }

    async fn attempt(&self, endpoints: &Endpoints) -> Attempt {
        let token = match self.fetch_token(endpoints).await {
            Ok(Some(token)) => token,
            Ok(None) => return Attempt::Absent,
            Err(reason) => return Attempt::Retry(reason),
        };

        let response = match self
            .http
            .get(&endpoints.manifest_url)
            .bearer_auth(&token)
            .header(
                reqwest::header::ACCEPT,
                [
                    MEDIA_DOCKER_MANIFEST,
                    MEDIA_DOCKER_LIST,
                    MEDIA_OCI_MANIFEST,
                    MEDIA_OCI_INDEX,
                ]
                .join(", "),
            )
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Attempt::Retry(format!("manifest request failed: {e}")),
        };

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED => return Attempt::Absent,
            status => return Attempt::Retry(format!("manifest returned {status}")),
        }

        if let Some(digest) = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            return Attempt::Found(digest.to_string());
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return Attempt::Retry(format!("manifest body unreadable: {e}")),
        };

        match digest_from_body(&body) {
            Some(digest) => Attempt::Found(digest),
            None => Attempt::Absent,
        }
    }

    /// `Ok(None)` when the token endpoint refuses outright.
    async fn fetch_token(&self, endpoints: &Endpoints) -> Result<Option<String>, String> {
        let response = self
            .http
            .get(&endpoints.token_url)
            .query(&endpoints.token_query)
            .send()
            .await
            .map_err(|e| format!("token request failed: {e}"))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED => return Ok(None),
            status => return Err(format!("token endpoint returned {status}")),
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| format!("token response unreadable: {e}"))?;

        Ok(Some(body.token.or(body.access_token).unwrap_or_default()))
    }
}

#[async_trait]
impl DigestResolver for RegistryClient {
    async fn resolve(&self, image: &ImageRef) -> Option<String> {
        let endpoints = Endpoints::for_image(image, &self.scheme);

        for attempt in 1..=self.attempts {
            match self.attempt(&endpoints).await {
                Attempt::Found(digest) => {
                    debug!(image = %image, family = ?endpoints.family, digest = %digest, "Resolved remote digest");
                    return Some(digest);
                }
                Attempt::Absent => {
                    debug!(image = %image, family = ?endpoints.family, "Registry has no digest for tag");
                    return None;
                }
                Attempt::Retry(reason) => {
                    warn!(
                        image = %image,
                        attempt,
                        max_attempts = self.attempts,
                        reason = %reason,
                        "Registry lookup failed"
                    );
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        None
    }
}

/// Digest for a manifest body that arrived without a digest header.
///
/// An index yields the first single-platform manifest it lists. Any other
/// document is hashed as-is.
fn digest_from_body(body: &[u8]) -> Option<String> {
    if let Ok(ManifestIndex {
        manifests: Some(manifests),
    }) = serde_json::from_slice::<ManifestIndex>(body)
    {
        return manifests
            .into_iter()
            .find(|m| {
                matches!(
                    m.media_type.as_deref(),
                    Some(MEDIA_DOCKER_MANIFEST) | Some(MEDIA_OCI_MANIFEST)
                )
            })
            .map(|m| m.digest);
    }

    Some(format!("sha256:{}", hex::encode(Sha256::digest(body))))
}
