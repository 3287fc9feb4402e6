//! Drift classification and notification batching

use crate::inventory::{ImageRecord, ImageStatus};
use crate::notifier::DotStyle;
use crate::reference::ImageRef;
use crate::registry::DigestResolver;
use tracing::{debug, warn};

/// One container whose image has a newer remote digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutdatedEntry {
    pub container: String,
    pub image: ImageRef,
}

/// Result of classifying one inventory.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub records: Vec<ImageRecord>,
    /// Candidate notified lines, one per outdated image, in inventory order
    pub lines: Vec<String>,
    pub outdated: Vec<OutdatedEntry>,
    /// Records whose remote digest resolved
    pub resolved: usize,
}

pub fn outdated_line(dots: &DotStyle, image: &ImageRef) -> String {
    format!("{} *{}* outdated!", dots.orange, image.short())
}

/// Assigns a status to every record, consulting the resolver only for
/// registry-backed, tagged images with a known local digest.
pub async fn classify(
    mut records: Vec<ImageRecord>,
    resolver: &dyn DigestResolver,
    dots: &DotStyle,
) -> Classification {
    let mut lines: Vec<String> = Vec::new();
    let mut outdated = Vec::new();
    let mut resolved = 0;

    for record in records.iter_mut() {
        let image = match ImageRef::parse(&record.image) {
            Ok(image) => image,
            Err(e) => {
                warn!(image = %record.image, error = %e, "Skipping image with unparseable reference");
                record.status = ImageStatus::Error;
                continue;
            }
        };

        if image.is_local() || image.is_digest_pinned() {
            record.status = ImageStatus::Unable;
            continue;
        }

        let Some(local) = record.digest.as_deref() else {
            record.status = ImageStatus::NoDigest;
            continue;
        };

        match resolver.resolve(&image).await {
            Some(remote) => {
                resolved += 1;
                if remote != local {
                    debug!(image = %image, local = %local, remote = %remote, "Image outdated");
                    record.status = ImageStatus::Outdated;
                    let line = outdated_line(dots, &image);
                    if !lines.contains(&line) {
                        lines.push(line);
                    }
                    outdated.extend(record.containers.iter().map(|container| OutdatedEntry {
                        container: container.clone(),
                        image: image.clone(),
                    }));
                } else {
                    record.status = ImageStatus::UpToDate;
                }
            }
            None => {
                warn!(image = %image, "Remote digest unavailable");
                record.status = ImageStatus::Error;
            }
        }
    }

    Classification {
        records,
        lines,
        outdated,
        resolved,
    }
}

/// Lines to announce given the previously persisted batch.
///
/// Nothing is announced when the candidate batch is empty or smaller than
/// the previous one; otherwise only lines absent from the previous batch.
pub fn batch_delta(previous: &[String], candidate: &[String]) -> Vec<String> {
    if candidate.is_empty() || candidate.len() < previous.len() {
        return Vec::new();
    }
    candidate
        .iter()
        .filter(|line| !previous.contains(line))
        .cloned()
        .collect()
}
