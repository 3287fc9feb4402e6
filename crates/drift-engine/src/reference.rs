//! Canonical image coordinates
//!
//! Every inventoried image is reduced to `source/owner/name:tag`. The parser
//! is total: a reference either yields four non-empty parts or an error.

use serde::Serialize;
use std::fmt;

pub const DEFAULT_SOURCE: &str = "docker.io";
pub const DEFAULT_OWNER: &str = "library";
pub const LOCAL_SOURCE: &str = "local";
pub const DEFAULT_TAG: &str = "latest";
/// Tag synthesized for images that are pinned by digest but carry no tag.
pub const NONE_TAG: &str = "<none>";

/// Hosts that name Docker Hub.
const HUB_HOSTS: &[&str] = &[DEFAULT_SOURCE, "index.docker.io", "registry.hub.docker.com"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    #[error("empty image reference")]
    Empty,
    #[error("image reference '{0}' has no repository name")]
    MissingName(String),
    #[error("image reference '{0}' has an empty tag")]
    EmptyTag(String),
    #[error("canonical reference '{0}' is not source/owner/name:tag")]
    NotCanonical(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ImageRef {
    pub source: String,
    pub owner: String,
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    /// Canonicalizes a runtime tag reference such as `nginx:1.25`,
    /// `grafana/grafana` or `ghcr.io/org/app:v2`.
    ///
    /// A first path segment counts as a registry host only when it contains a
    /// dot or a colon (or is `localhost`). `local` images keep their owner
    /// and name but are moved under the `local` source so they are never sent
    /// to a registry.
    ///
    /// # Examples
    ///
    /// ```
    /// use drift_engine::reference::ImageRef;
    ///
    /// let image = ImageRef::canonicalize("nginx:1.25", false).unwrap();
    /// assert_eq!(image.to_string(), "docker.io/library/nginx:1.25");
    ///
    /// let image = ImageRef::canonicalize("ghcr.io/org/team/app", false).unwrap();
    /// assert_eq!(image.owner, "org");
    /// assert_eq!(image.name, "team/app");
    /// assert_eq!(image.tag, "latest");
    /// ```
    pub fn canonicalize(reference: &str, local: bool) -> Result<Self, ReferenceError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ReferenceError::Empty);
        }

        // Digest suffixes are never part of the coordinates.
        let without_digest = reference.split('@').next().unwrap_or(reference);
        let (path, tag) = split_tag(without_digest);
        if tag.is_empty() {
            return Err(ReferenceError::EmptyTag(reference.to_string()));
        }

        let segments: Vec<&str> = path.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ReferenceError::MissingName(reference.to_string()));
        }

        let (source, rest) = if segments.len() > 1 && is_registry_host(segments[0]) {
            (segments[0].to_string(), &segments[1..])
        } else {
            (DEFAULT_SOURCE.to_string(), &segments[..])
        };

        let (owner, name) = match rest {
            [name] => (DEFAULT_OWNER.to_string(), name.to_string()),
            [owner, name @ ..] => (owner.to_string(), name.join("/")),
            [] => return Err(ReferenceError::MissingName(reference.to_string())),
        };

        Ok(Self {
            source: if local {
                LOCAL_SOURCE.to_string()
            } else {
                source
            },
            owner,
            name,
            tag: tag.to_string(),
        })
    }

    /// Parses a canonical `source/owner/name:tag` string back into parts.
    /// A two-segment form (`local/myapp:latest`) takes the default owner.
    pub fn parse(canonical: &str) -> Result<Self, ReferenceError> {
        let not_canonical = || ReferenceError::NotCanonical(canonical.to_string());

        let (path, tag) = canonical.rsplit_once(':').ok_or_else(not_canonical)?;
        if tag.is_empty() || tag.contains('/') {
            return Err(not_canonical());
        }

        let mut parts = path.splitn(3, '/');
        let source = parts.next().filter(|s| !s.is_empty()).ok_or_else(not_canonical)?;
        let second = parts.next().filter(|s| !s.is_empty()).ok_or_else(not_canonical)?;
        let (owner, name) = match parts.next() {
            Some(name) if !name.is_empty() => (second, name),
            Some(_) => return Err(not_canonical()),
            None => (DEFAULT_OWNER, second),
        };

        Ok(Self {
            source: source.to_string(),
            owner: owner.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    pub fn is_local(&self) -> bool {
        self.source == LOCAL_SOURCE
    }

    pub fn is_digest_pinned(&self) -> bool {
        self.tag == NONE_TAG
    }

    pub fn is_default_owner(&self) -> bool {
        self.owner == DEFAULT_OWNER
    }

    /// Docker Hub serves official images under `library/`. Other registries
    /// have no such namespace.
    pub fn is_hub(&self) -> bool {
        HUB_HOSTS.contains(&self.source.as_str())
    }

    /// Repository path the registry serves. The default owner is only a
    /// display placeholder outside Docker Hub and is dropped there.
    pub fn repository(&self) -> String {
        if self.is_default_owner() && !self.is_hub() {
            self.name.clone()
        } else {
            format!("{}/{}", self.owner, self.name)
        }
    }

    /// `owner/name:tag`, used in notification lines.
    pub fn short(&self) -> String {
        format!("{}/{}:{}", self.owner, self.name, self.tag)
    }

    /// Reference handed to the runtime for a pull.
    pub fn pull_reference(&self) -> String {
        format!("{}/{}:{}", self.source, self.repository(), self.tag)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}:{}", self.source, self.owner, self.name, self.tag)
    }
}

/// Splits on the last `:` unless a `/` follows it (which makes it a port).
fn split_tag(reference: &str) -> (&str, &str) {
    match reference.rsplit_once(':') {
        Some((path, tag)) if !tag.contains('/') => (path, tag),
        _ => (reference, DEFAULT_TAG),
    }
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// Repository part of a `repo@sha256:...` entry.
pub fn digest_repository(repo_digest: &str) -> Option<&str> {
    repo_digest.split_once('@').map(|(repo, _)| repo)
}

/// Repository part of a `repo:tag` entry.
pub fn tag_repository(repo_tag: &str) -> &str {
    split_tag(repo_tag).0
}
