//! Bounded readiness polling against the container runtime

use crate::docker::ContainerRuntime;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Polls until `name` reports running or `timeout` elapses.
pub async fn wait_until_running(
    runtime: &dyn ContainerRuntime,
    name: &str,
    timeout: Duration,
    poll: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    let mut ticker = interval(poll.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match runtime.is_container_running(name).await {
            Ok(true) => {
                debug!(container = %name, "Container running");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => warn!(container = %name, error = %e, "Readiness probe failed"),
        }
        if Instant::now() >= deadline {
            anyhow::bail!(
                "container {name} not running after {}s",
                timeout.as_secs_f64()
            );
        }
    }
}

/// Polls the image list until none of `removed` is present. Returns the ids
/// still listed when `timeout` elapses.
pub async fn wait_until_images_removed(
    runtime: &dyn ContainerRuntime,
    removed: &HashSet<String>,
    timeout: Duration,
    poll: Duration,
) -> Vec<String> {
    if removed.is_empty() {
        return Vec::new();
    }

    let deadline = Instant::now() + timeout;
    let mut ticker = interval(poll.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let lingering: Vec<String> = match runtime.list_images().await {
            Ok(images) => images
                .into_iter()
                .map(|image| image.id)
                .filter(|id| removed.contains(id))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list images while waiting for removal");
                removed.iter().cloned().collect()
            }
        };

        if lingering.is_empty() {
            return lingering;
        }
        if Instant::now() >= deadline {
            warn!(images = ?lingering, "Images still present after removal");
            return lingering;
        }
    }
}
