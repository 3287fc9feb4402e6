//! Drift Engine
//!
//! Watches the images behind running containers and reports when their
//! registry has published a newer digest. Provides:
//! - Canonical, deduplicated image inventory
//! - Remote digest resolution across registry auth schemes
//! - Repeat-safe drift notifications
//! - Optional remediation (pull, restart, prune)
//! - Daily run planning around remediation anchors
//!
//! All cycles run sequentially on one scheduler task. The status surface
//! only reads the [`SnapshotHandle`] published after each cycle.

pub mod compose;
pub mod config;
pub mod docker;
pub mod drift;
pub mod health;
pub mod inventory;
pub mod notifier;
pub mod reference;
pub mod registry;
pub mod remediation;
pub mod schedule;
pub mod snapshot;
pub mod store;

#[cfg(test)]
mod testing;

pub use compose::{ComposeCli, ComposeRunner};
pub use config::*;
pub use docker::{ContainerRuntime, DockerClient};
pub use drift::{batch_delta, classify, Classification, OutdatedEntry};
pub use inventory::{build_inventory, ImageRecord, ImageStatus};
pub use notifier::{DotStyle, NotificationSink, WebhookNotifier};
pub use reference::ImageRef;
pub use registry::{DigestResolver, RegistryClient};
pub use remediation::{RemediationReport, Remediator};
pub use schedule::{RunKind, Schedule};
pub use snapshot::{CycleSnapshot, ScheduledTime, SnapshotHandle};
pub use store::BatchStore;

use chrono::{Local, TimeZone};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Outcome of one detection cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub tracked: usize,
    pub resolved: usize,
    pub outdated: usize,
    /// Lines sent in this cycle's notification, empty when nothing was sent
    pub notified: Vec<String>,
}

/// Drives detection and remediation cycles against one host.
pub struct DigestWatcher {
    runtime: Arc<dyn ContainerRuntime>,
    resolver: Arc<dyn DigestResolver>,
    notifier: Arc<dyn NotificationSink>,
    remediator: Remediator,
    store: BatchStore,
    schedule: Schedule,
    snapshot: SnapshotHandle,
    dots: DotStyle,
}

impl DigestWatcher {
    /// Builds a watcher from already connected collaborators.
    pub fn with_parts(
        runtime: Arc<dyn ContainerRuntime>,
        resolver: Arc<dyn DigestResolver>,
        notifier: Arc<dyn NotificationSink>,
        compose: Arc<dyn ComposeRunner>,
        store: BatchStore,
        config: &AppConfig,
    ) -> Self {
        let dots = config.dots();
        let schedule = Schedule::from_config(&config.schedule);
        let remediator = Remediator::new(runtime.clone(), compose, config.remediation.clone());

        let mut initial = CycleSnapshot::empty(dots);
        initial.schedule = scheduled_times(&schedule);

        Self {
            runtime,
            resolver,
            notifier,
            remediator,
            store,
            schedule,
            snapshot: SnapshotHandle::new(initial),
            dots,
        }
    }

    pub fn snapshot(&self) -> SnapshotHandle {
        self.snapshot.clone()
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Engine-reported node name, falling back to this host's name.
    pub async fn node_name(&self) -> String {
        match self.runtime.engine_info().await {
            Ok(info) if !info.name.is_empty() => info.name,
            Ok(_) => local_hostname(),
            Err(e) => {
                warn!(error = %e, "Cannot query engine info, using host name");
                local_hostname()
            }
        }
    }

    /// Header line every notification starts with.
    async fn header(&self) -> String {
        format!("*{}* (.digest)", self.node_name().await)
    }

    async fn notify(&self, body: &str) {
        let message = format!("{}\n{}", self.header().await, body);
        if let Err(e) = self.notifier.send(&message).await {
            error!(error = %e, "Failed to deliver notification");
        }
    }

    /// Summary of the running configuration, sent once at startup.
    pub async fn startup_message(&self) -> String {
        let engine = match self.runtime.engine_info().await {
            Ok(info) if !info.version.is_empty() => info.version,
            Ok(_) => "unknown".to_string(),
            Err(e) => {
                warn!(error = %e, "Cannot query engine version");
                "unknown".to_string()
            }
        };
        let channels = self.notifier.channels();
        let channels = if channels.is_empty() {
            "none".to_string()
        } else {
            channels.join(", ")
        };

        let lines = [
            format!("{} Docker engine: {}", self.dots.green, engine),
            format!("{} Channels: {}", self.dots.green, channels),
            format!("{} Schedule: {}", self.dots.green, self.schedule.describe()),
            format!(
                "{} Remediation: {}",
                self.dots.green,
                if self.schedule.remediation_enabled() { "yes" } else { "no" }
            ),
            format!(
                "{} Dots: {}",
                self.dots.green,
                if self.dots.is_round() { "Round" } else { "Square" }
            ),
        ];
        format!("{}\n{}", self.header().await, lines.join("\n"))
    }

    pub async fn send_startup_message(&self) {
        let message = self.startup_message().await;
        if let Err(e) = self.notifier.send(&message).await {
            error!(error = %e, "Failed to deliver startup message");
        }
    }

    /// One detection cycle: inventory, classify, notify new drift, persist
    /// the batch, publish the snapshot.
    pub async fn run_check(&self) -> CheckSummary {
        self.check_cycle().await.0
    }

    async fn check_cycle(&self) -> (CheckSummary, Vec<OutdatedEntry>) {
        let started = Instant::now();

        let records = build_inventory(self.runtime.as_ref()).await;
        let classification = classify(records, self.resolver.as_ref(), &self.dots).await;

        let previous = self.store.load().await;
        let delta = batch_delta(&previous, &classification.lines);
        if !delta.is_empty() {
            self.notify(&delta.join("\n")).await;
        } else if classification.lines.len() < previous.len() {
            info!(
                previous = previous.len(),
                current = classification.lines.len(),
                "Outdated batch shrank, notification suppressed"
            );
        }
        if let Err(e) = self.store.save(&classification.lines).await {
            error!(path = %self.store.path().display(), error = %e, "Failed to persist notification batch");
        }

        let summary = CheckSummary {
            tracked: classification.records.len(),
            resolved: classification.resolved,
            outdated: classification.lines.len(),
            notified: delta,
        };
        info!(
            elapsed = %format_elapsed(started.elapsed()),
            tracked = summary.tracked,
            resolved = summary.resolved,
            outdated = summary.outdated,
            "Check finished"
        );

        let Classification { records, outdated, .. } = classification;
        self.snapshot.update(|s| {
            s.images = records;
            s.last_checked = Some(Local::now());
        });

        (summary, outdated)
    }

    /// Check, remediate what is outdated, then check again so the published
    /// state reflects the result.
    pub async fn run_remediation(&self) -> Option<RemediationReport> {
        let (_, outdated) = self.check_cycle().await;
        if outdated.is_empty() {
            info!("Nothing outdated, remediation skipped");
            return None;
        }

        let report = self.remediator.remediate(&outdated).await;
        if !report.is_empty() {
            self.notify(&report.render(&self.dots)).await;
        }
        if report.has_failures() {
            warn!(
                aborted = report.aborted,
                failed = report.failed.len(),
                "Remediation finished with failures"
            );
        }

        self.run_check().await;
        Some(report)
    }

    /// Runs scheduled cycles until ctrl-c.
    pub async fn run_forever(&self) {
        info!(schedule = %self.schedule.describe(), "Scheduler started");
        for slot in self.schedule.slots() {
            debug!(
                anchor = %slot.anchor.format("%H:%M"),
                probes = ?slot.probes.iter().map(|p| p.format("%H:%M").to_string()).collect::<Vec<_>>(),
                "Schedule slot"
            );
        }
        loop {
            let now = Local::now().naive_local();
            let (next, kind) = self.schedule.next_after(now);
            let next_local = Local.from_local_datetime(&next).earliest();
            self.snapshot.update(|s| s.next_run = next_local);

            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(next = %next.format("%Y-%m-%d %H:%M"), kind = ?kind, "Next run scheduled");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested, scheduler stopping");
                    return;
                }
            }

            match kind {
                RunKind::Check => {
                    self.run_check().await;
                }
                RunKind::Remediate => {
                    self.run_remediation().await;
                }
            }
        }
    }
}

fn scheduled_times(schedule: &Schedule) -> Vec<ScheduledTime> {
    schedule
        .entries()
        .iter()
        .map(|&(time, kind)| ScheduledTime { time, kind })
        .collect()
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestCompose, TestResolver, TestRuntime, TestSink};

    struct Harness {
        runtime: TestRuntime,
        resolver: Arc<TestResolver>,
        sink: Arc<TestSink>,
        watcher: DigestWatcher,
        _dir: tempfile::TempDir,
        batch_path: std::path::PathBuf,
    }

    fn harness(config: AppConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let batch_path = dir.path().join("state").join("outdated.txt");
        let runtime = TestRuntime::default();
        let resolver = Arc::new(TestResolver::default());
        let sink = Arc::new(TestSink::default());
        let watcher = DigestWatcher::with_parts(
            Arc::new(runtime.clone()),
            resolver.clone(),
            sink.clone(),
            Arc::new(TestCompose::new(runtime.clone())),
            BatchStore::new(&batch_path),
            &config,
        );
        Harness {
            runtime,
            resolver,
            sink,
            watcher,
            _dir: dir,
            batch_path,
        }
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.schedule.remediation = true;
        config.remediation.running_timeout = Duration::from_millis(50);
        config.remediation.poll_interval = Duration::from_millis(5);
        config.remediation.settle = Duration::from_millis(1);
        config.remediation.image_removal_timeout = Duration::from_millis(50);
        config
    }

    fn nginx_outdated(h: &Harness) {
        h.runtime
            .add_image("sha256:old", "nginx:1.25", Some("nginx@sha256:aaa"));
        h.runtime.add_container("web", "sha256:old", "nginx:1.25");
        h.resolver.set("docker.io/library/nginx:1.25", "sha256:bbb");
    }

    #[tokio::test]
    async fn test_outdated_image_notified_and_persisted() {
        let h = harness(AppConfig::default());
        nginx_outdated(&h);

        let summary = h.watcher.run_check().await;

        let line = format!("{} *library/nginx:1.25* outdated!", DotStyle::round().orange);
        assert_eq!(summary.tracked, 1);
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.notified, vec![line.clone()]);
        assert_eq!(
            h.sink.messages(),
            vec![format!("*test-node* (.digest)\n{line}")]
        );
        assert_eq!(
            std::fs::read_to_string(&h.batch_path).unwrap(),
            format!("{line}\n")
        );

        let snapshot = h.watcher.snapshot().latest();
        assert_eq!(snapshot.images.len(), 1);
        assert_eq!(snapshot.images[0].image, "docker.io/library/nginx:1.25");
        assert_eq!(snapshot.images[0].status, ImageStatus::Outdated);
        assert!(snapshot.last_checked.is_some());
    }

    #[tokio::test]
    async fn test_repeated_check_does_not_notify_again() {
        let h = harness(AppConfig::default());
        nginx_outdated(&h);

        h.watcher.run_check().await;
        let second = h.watcher.run_check().await;

        assert!(second.notified.is_empty());
        assert_eq!(second.outdated, 1);
        assert_eq!(h.sink.messages().len(), 1);
        assert_eq!(
            h.watcher.snapshot().latest().images[0].status,
            ImageStatus::Outdated
        );
    }

    #[tokio::test]
    async fn test_local_image_never_resolved() {
        let h = harness(AppConfig::default());
        h.runtime.add_image("sha256:local", "myapp:latest", None);
        h.runtime.add_container("app", "sha256:local", "myapp:latest");

        let summary = h.watcher.run_check().await;

        assert!(h.resolver.calls().is_empty());
        assert_eq!(summary.resolved, 0);
        assert!(h.sink.messages().is_empty());
        let snapshot = h.watcher.snapshot().latest();
        assert_eq!(snapshot.images[0].image, "local/library/myapp:latest");
        assert_eq!(snapshot.images[0].status, ImageStatus::Unable);
    }

    #[tokio::test]
    async fn test_shrinking_batch_is_persisted_silently() {
        let h = harness(AppConfig::default());
        std::fs::create_dir_all(h.batch_path.parent().unwrap()).unwrap();
        std::fs::write(&h.batch_path, "old line a\nold line b\n").unwrap();
        nginx_outdated(&h);

        let summary = h.watcher.run_check().await;

        assert!(summary.notified.is_empty());
        assert!(h.sink.messages().is_empty());
        let persisted = std::fs::read_to_string(&h.batch_path).unwrap();
        assert_eq!(persisted.lines().count(), 1);
        assert!(persisted.contains("*library/nginx:1.25* outdated!"));
    }

    #[tokio::test]
    async fn test_remediation_cycle_updates_and_rechecks() {
        let h = harness(fast_config());
        nginx_outdated(&h);
        h.runtime
            .add_image("sha256:new", "nginx:1.25", Some("nginx@sha256:bbb"));
        h.runtime.upgrade_on_restart("web", "sha256:new");

        let report = h.watcher.run_remediation().await.unwrap();

        assert_eq!(report.restarted.len(), 1);
        assert_eq!(report.removed_images, vec!["sha256:old"]);
        let messages = h.sink.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].starts_with("*test-node* (.digest)\n"));
        assert!(messages[1].contains("*web* updated (library/nginx:1.25)"));

        let snapshot = h.watcher.snapshot().latest();
        assert_eq!(snapshot.images[0].image_id, "sha256:new");
        assert_eq!(snapshot.images[0].status, ImageStatus::UpToDate);
        assert_eq!(std::fs::read_to_string(&h.batch_path).unwrap(), "");
    }

    #[tokio::test]
    async fn test_remediation_skipped_when_current() {
        let h = harness(fast_config());
        h.runtime
            .add_image("sha256:cur", "nginx:1.25", Some("nginx@sha256:aaa"));
        h.runtime.add_container("web", "sha256:cur", "nginx:1.25");
        h.resolver.set("docker.io/library/nginx:1.25", "sha256:aaa");

        assert!(h.watcher.run_remediation().await.is_none());
        assert!(h
            .runtime
            .operations()
            .iter()
            .all(|op| !op.starts_with("pull:")));
    }

    #[tokio::test]
    async fn test_startup_message_lists_configuration() {
        let mut config = AppConfig::default();
        config.default_dot_style = false;
        let h = harness(config);

        let message = h.watcher.startup_message().await;

        assert!(message.starts_with("*test-node* (.digest)\n"));
        assert!(message.contains("Docker engine: 27.0.0"));
        assert!(message.contains("Channels: test"));
        assert!(message.contains("Schedule: 02:20, 03:00, 03:40, 04:20"));
        assert!(message.contains("Remediation: no"));
        assert!(message.contains("Dots: Square"));
    }

    #[test]
    fn test_initial_snapshot_carries_schedule() {
        let h = harness(fast_config());
        let snapshot = h.watcher.snapshot().latest();
        assert_eq!(snapshot.schedule.len(), h.watcher.schedule().entries().len());
        assert!(snapshot
            .schedule
            .iter()
            .any(|t| t.kind == RunKind::Remediate));
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(75)), "01:15");
        assert_eq!(format_elapsed(Duration::from_millis(900)), "00:00");
    }
}
