//! Image inventory
//!
//! One [`ImageRecord`] per distinct image that at least one container
//! (running or not) references. Rebuilt from scratch every cycle.

use crate::docker::{ContainerInfo, ContainerRuntime, ImageInfo};
use crate::reference::{digest_repository, tag_repository, ImageRef, NONE_TAG};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    #[default]
    Unknown,
    UpToDate,
    Outdated,
    Error,
    NoDigest,
    Unable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRecord {
    /// Display position, assigned after sorting
    pub index: usize,
    /// Canonical `source/owner/name:tag`, or the raw tag when it could not be canonicalized
    pub image: String,
    pub image_id: String,
    pub digest: Option<String>,
    pub size: i64,
    pub created: Option<DateTime<Utc>>,
    pub containers: Vec<String>,
    pub status: ImageStatus,
}

impl ImageRecord {
    /// Every field except the reference and display index matches.
    fn same_image(&self, other: &ImageRecord) -> bool {
        self.image_id == other.image_id
            && self.digest == other.digest
            && self.size == other.size
            && self.created == other.created
            && self.containers == other.containers
            && self.status == other.status
    }

    fn under_default_owner(&self) -> bool {
        ImageRef::parse(&self.image)
            .map(|r| r.is_default_owner())
            .unwrap_or(false)
    }
}

/// Collects the inventory from the runtime. A runtime error yields an empty
/// inventory for this cycle.
pub async fn build_inventory(runtime: &dyn ContainerRuntime) -> Vec<ImageRecord> {
    let images = match runtime.list_images().await {
        Ok(images) => images,
        Err(e) => {
            error!(error = %e, "Failed to list images, skipping this cycle");
            return Vec::new();
        }
    };
    let containers = match runtime.list_containers().await {
        Ok(containers) => containers,
        Err(e) => {
            error!(error = %e, "Failed to list containers, skipping this cycle");
            return Vec::new();
        }
    };

    let records = assemble(&images, &containers);
    debug!(
        images = images.len(),
        containers = containers.len(),
        records = records.len(),
        "Inventory built"
    );
    records
}

/// Pure inventory assembly: match, canonicalize, dedup, sort, index.
pub fn assemble(images: &[ImageInfo], containers: &[ContainerInfo]) -> Vec<ImageRecord> {
    let mut users: HashMap<&str, Vec<String>> = HashMap::new();
    for container in containers {
        users
            .entry(short_id(&container.image_id))
            .or_default()
            .push(container.name.clone());
    }

    let mut records: Vec<ImageRecord> = images
        .iter()
        .filter_map(|image| {
            let containers = users.get(short_id(&image.id))?;
            record_for(image, containers.clone())
        })
        .collect();

    records = dedup(records);
    records.sort_by(|a, b| first_container(a).cmp(first_container(b)));
    for (i, record) in records.iter_mut().enumerate() {
        record.index = i + 1;
    }
    records
}

fn record_for(image: &ImageInfo, containers: Vec<String>) -> Option<ImageRecord> {
    let reference = match image.repo_tags.iter().find(|t| !t.starts_with("<none>")) {
        Some(tag) => tag.clone(),
        None => {
            // Untagged but digest-pinned: keep the repository, mark the tag.
            let repo = image.repo_digests.iter().find_map(|d| digest_repository(d))?;
            format!("{repo}:{NONE_TAG}")
        }
    };

    let local = image.repo_digests.is_empty();
    let digest = if local {
        Some(image.id.clone())
    } else {
        local_digest(&reference, &image.repo_digests)
    };

    let (image_ref, status) = match ImageRef::canonicalize(&reference, local) {
        Ok(image_ref) => (image_ref.to_string(), ImageStatus::Unknown),
        Err(e) => {
            warn!(reference = %reference, error = %e, "Unparseable image reference");
            (reference.clone(), ImageStatus::Error)
        }
    };

    Some(ImageRecord {
        index: 0,
        image: image_ref,
        image_id: image.id.clone(),
        digest,
        size: image.size,
        created: Utc.timestamp_opt(image.created, 0).single(),
        containers,
        status,
    })
}

/// Digest of the repo digest whose repository matches the tag's repository,
/// falling back to the first entry.
fn local_digest(reference: &str, repo_digests: &[String]) -> Option<String> {
    let repository = tag_repository(reference);
    let chosen = repo_digests
        .iter()
        .find(|d| digest_repository(d) == Some(repository))
        .or_else(|| repo_digests.first())?;
    chosen
        .split_once('@')
        .map(|(_, digest)| digest.to_string())
        .filter(|d| !d.is_empty())
}

/// Drops duplicates, keeping the entry not under the default owner.
fn dedup(records: Vec<ImageRecord>) -> Vec<ImageRecord> {
    let mut kept: Vec<ImageRecord> = Vec::with_capacity(records.len());
    for record in records {
        match kept.iter_mut().find(|k| k.same_image(&record)) {
            Some(existing) => {
                if existing.under_default_owner() && !record.under_default_owner() {
                    debug!(dropped = %existing.image, kept = %record.image, "Duplicate image entry");
                    *existing = record;
                } else {
                    debug!(dropped = %record.image, kept = %existing.image, "Duplicate image entry");
                }
            }
            None => kept.push(record),
        }
    }
    kept
}

fn first_container(record: &ImageRecord) -> &str {
    record.containers.first().map(String::as_str).unwrap_or("")
}

fn short_id(id: &str) -> &str {
    id.strip_prefix("sha256:").unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::docker::{ContainerSpec, EngineInfo};

    fn image(id: &str, tags: &[&str], digests: &[&str]) -> ImageInfo {
        ImageInfo {
            id: id.to_string(),
            repo_tags: tags.iter().map(|s| s.to_string()).collect(),
            repo_digests: digests.iter().map(|s| s.to_string()).collect(),
            size: 10 * 1024 * 1024,
            created: 1_700_000_000,
        }
    }

    fn container(name: &str, image_id: &str) -> ContainerInfo {
        ContainerInfo {
            id: format!("id-{name}"),
            name: name.to_string(),
            image_id: image_id.to_string(),
        }
    }

    #[test]
    fn test_assemble_excludes_unused_images() {
        let images = vec![
            image("sha256:aaa", &["nginx:1.25"], &["nginx@sha256:d1"]),
            image("sha256:bbb", &["redis:7"], &["redis@sha256:d2"]),
        ];
        let containers = vec![container("web", "sha256:aaa")];

        let records = assemble(&images, &containers);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.image, "docker.io/library/nginx:1.25");
        assert_eq!(record.digest.as_deref(), Some("sha256:d1"));
        assert_eq!(record.containers, vec!["web"]);
        assert_eq!(record.status, ImageStatus::Unknown);
        assert_eq!(record.index, 1);
        assert_eq!(record.size, 10 * 1024 * 1024);
        assert!(record.created.is_some());
    }

    #[test]
    fn test_assemble_matches_ids_with_or_without_prefix() {
        let images = vec![image("sha256:aaa", &["nginx:1.25"], &["nginx@sha256:d1"])];
        let containers = vec![container("web", "aaa"), container("api", "sha256:aaa")];

        let records = assemble(&images, &containers);
        assert_eq!(records[0].containers, vec!["web", "api"]);
    }

    #[test]
    fn test_local_image_gets_synthetic_digest() {
        let images = vec![image("sha256:local1", &["myapp:latest"], &[])];
        let containers = vec![container("app", "sha256:local1")];

        let records = assemble(&images, &containers);
        assert_eq!(records[0].image, "local/library/myapp:latest");
        assert_eq!(records[0].digest.as_deref(), Some("sha256:local1"));
    }

    #[test]
    fn test_untagged_digest_pinned_image_gets_none_tag() {
        let images = vec![image("sha256:p1", &[], &["ghcr.io/org/app@sha256:d9"])];
        let containers = vec![container("pinned", "sha256:p1")];

        let records = assemble(&images, &containers);
        assert_eq!(records[0].image, "ghcr.io/org/app:<none>");
        assert_eq!(records[0].digest.as_deref(), Some("sha256:d9"));
    }

    #[test]
    fn test_repo_digest_matching_tag_repository_wins() {
        let images = vec![image(
            "sha256:m1",
            &["ghcr.io/org/app:2"],
            &["docker.io/org/app@sha256:hub", "ghcr.io/org/app@sha256:gh"],
        )];
        let containers = vec![container("app", "sha256:m1")];

        let records = assemble(&images, &containers);
        assert_eq!(records[0].digest.as_deref(), Some("sha256:gh"));
    }

    #[test]
    fn test_malformed_repo_digest_leaves_digest_empty() {
        let images = vec![image("sha256:x", &["nginx:1"], &["garbage"])];
        let containers = vec![container("web", "sha256:x")];

        let records = assemble(&images, &containers);
        assert_eq!(records[0].digest, None);
    }

    #[test]
    fn test_unparseable_reference_marked_error() {
        let images = vec![image("sha256:bad", &["org//app:1"], &["org//app@sha256:d"])];
        let containers = vec![container("broken", "sha256:bad")];

        let records = assemble(&images, &containers);
        assert_eq!(records[0].status, ImageStatus::Error);
        assert_eq!(records[0].image, "org//app:1");
    }

    #[test]
    fn test_sorted_by_first_container_and_indexed() {
        let images = vec![
            image("sha256:a", &["nginx:1"], &["nginx@sha256:1"]),
            image("sha256:b", &["redis:7"], &["redis@sha256:2"]),
            image("sha256:c", &["postgres:16"], &["postgres@sha256:3"]),
        ];
        let containers = vec![
            container("zeta", "sha256:a"),
            container("alpha", "sha256:b"),
            container("mid", "sha256:c"),
        ];

        let records = assemble(&images, &containers);
        let order: Vec<(&str, usize)> = records
            .iter()
            .map(|r| (r.containers[0].as_str(), r.index))
            .collect();
        assert_eq!(order, vec![("alpha", 1), ("mid", 2), ("zeta", 3)]);
    }

    #[test]
    fn test_dedup_prefers_non_library_owner() {
        let mut library = record_for(
            &image("sha256:a", &["postgres:16"], &["postgres@sha256:1"]),
            vec!["db".to_string()],
        )
        .unwrap();
        let mut explicit = library.clone();
        explicit.image = "docker.io/bitnami/postgres:16".to_string();
        library.index = 1;
        explicit.index = 2;

        let kept = dedup(vec![library.clone(), explicit.clone()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].image, "docker.io/bitnami/postgres:16");

        let kept = dedup(vec![explicit, library]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].image, "docker.io/bitnami/postgres:16");
    }

    struct FailingRuntime;

    #[async_trait]
    impl ContainerRuntime for FailingRuntime {
        async fn list_images(&self) -> anyhow::Result<Vec<ImageInfo>> {
            anyhow::bail!("daemon gone")
        }
        async fn list_containers(&self) -> anyhow::Result<Vec<ContainerInfo>> {
            Ok(Vec::new())
        }
        async fn inspect_container(&self, _name: &str) -> anyhow::Result<ContainerSpec> {
            anyhow::bail!("unused")
        }
        async fn pull_image(&self, _image: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop_container(&self, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn remove_container(&self, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn run_container(&self, _spec: &ContainerSpec) -> anyhow::Result<String> {
            Ok(String::new())
        }
        async fn is_container_running(&self, _name: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
        async fn remove_image(&self, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn engine_info(&self) -> anyhow::Result<EngineInfo> {
            Ok(EngineInfo::default())
        }
    }

    #[tokio::test]
    async fn test_runtime_error_yields_empty_inventory() {
        assert!(build_inventory(&FailingRuntime).await.is_empty());
    }
}
