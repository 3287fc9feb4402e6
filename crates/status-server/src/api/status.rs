//! Status API handler
//!
//! Exposes the inventory and schedule of the last completed cycle.

use crate::state::AppState;
use axum::{extract::State, Json};
use chrono::{DateTime, Local};
use drift_engine::{DotStyle, ImageRecord, ImageStatus, ScheduledTime};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub up_to_date: usize,
    pub outdated: usize,
    pub unable: usize,
    pub errors: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub last_checked: Option<DateTime<Local>>,
    pub next_run: Option<DateTime<Local>>,
    pub schedule: Vec<ScheduledTime>,
    pub counts: StatusCounts,
    pub dots: DotStyle,
    pub images: Vec<ImageRecord>,
}

fn count(images: &[ImageRecord]) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for image in images {
        match image.status {
            ImageStatus::UpToDate => counts.up_to_date += 1,
            ImageStatus::Outdated => counts.outdated += 1,
            ImageStatus::Unable | ImageStatus::NoDigest => counts.unable += 1,
            ImageStatus::Error => counts.errors += 1,
            ImageStatus::Unknown => {}
        }
    }
    counts
}

/// GET / - Inventory, last check and upcoming runs
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let snapshot = state.snapshot.latest();
    Json(StatusResponse {
        last_checked: snapshot.last_checked,
        next_run: snapshot.next_run,
        schedule: snapshot.schedule.clone(),
        counts: count(&snapshot.images),
        dots: snapshot.dots,
        images: snapshot.images.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(image: &str, status: ImageStatus) -> ImageRecord {
        ImageRecord {
            index: 1,
            image: image.to_string(),
            image_id: "sha256:1".to_string(),
            digest: None,
            size: 0,
            created: None,
            containers: vec!["web".to_string()],
            status,
        }
    }

    #[test]
    fn test_counts_by_status() {
        let images = vec![
            record("docker.io/library/nginx:1.25", ImageStatus::Outdated),
            record("docker.io/library/redis:7", ImageStatus::UpToDate),
            record("local/library/app:latest", ImageStatus::Unable),
            record("ghcr.io/acme/api:1", ImageStatus::Error),
            record("docker.io/acme/worker:2", ImageStatus::NoDigest),
        ];
        assert_eq!(
            count(&images),
            StatusCounts {
                up_to_date: 1,
                outdated: 1,
                unable: 2,
                errors: 1,
            }
        );
    }
}
