//! Remediation of outdated containers
//!
//! Every outdated image is pulled first. If any pull fails nothing is
//! restarted. Otherwise each container is restarted independently (through compose
//! when it belongs to a compose project, by recreation otherwise) and images
//! no container uses anymore are removed.

use crate::compose::{locate_compose_file, ComposeProject, ComposeRunner};
use crate::config::RemediationConfig;
use crate::docker::{ContainerRuntime, ContainerSpec};
use crate::drift::OutdatedEntry;
use crate::health::{wait_until_images_removed, wait_until_running};
use crate::notifier::DotStyle;
use crate::reference::ImageRef;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPath {
    /// Scoped `up` for the container's service
    ComposeService,
    /// Project-wide `up` after the scoped one failed
    ComposeProject,
    Recreate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restarted {
    pub container: String,
    pub image: ImageRef,
    pub path: RestartPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Container name, or the image reference for pull failures
    pub subject: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemediationReport {
    /// Set when a pull failed and no container was touched
    pub aborted: bool,
    pub pull_failures: Vec<Failure>,
    pub restarted: Vec<Restarted>,
    pub failed: Vec<Failure>,
    pub removed_images: Vec<String>,
    pub lingering_images: Vec<String>,
}

impl RemediationReport {
    pub fn is_empty(&self) -> bool {
        !self.aborted && self.restarted.is_empty() && self.failed.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        self.aborted || !self.failed.is_empty()
    }

    /// Message body listing successes and failures, `*emphasis*` marked.
    pub fn render(&self, dots: &DotStyle) -> String {
        let mut lines = Vec::new();

        if self.aborted {
            lines.push(format!("{} update aborted, nothing restarted", dots.red));
            for failure in &self.pull_failures {
                lines.push(format!(
                    "{} *{}* pull failed: {}",
                    dots.red, failure.subject, failure.reason
                ));
            }
            return lines.join("\n");
        }

        for restarted in &self.restarted {
            lines.push(format!(
                "{} *{}* updated ({})",
                dots.green,
                restarted.container,
                restarted.image.short()
            ));
        }
        for failure in &self.failed {
            lines.push(format!(
                "{} *{}* failed: {}",
                dots.red, failure.subject, failure.reason
            ));
        }
        if !self.removed_images.is_empty() {
            lines.push(format!(
                "{} {} unused image(s) removed",
                dots.yellow,
                self.removed_images.len()
            ));
        }
        if !self.lingering_images.is_empty() {
            lines.push(format!(
                "{} {} unused image(s) could not be removed",
                dots.red,
                self.lingering_images.len()
            ));
        }
        lines.join("\n")
    }
}

pub struct Remediator {
    runtime: Arc<dyn ContainerRuntime>,
    compose: Arc<dyn ComposeRunner>,
    config: RemediationConfig,
}

impl Remediator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        compose: Arc<dyn ComposeRunner>,
        config: RemediationConfig,
    ) -> Self {
        Self {
            runtime,
            compose,
            config,
        }
    }

    /// Remediates `entries`, which must come from a classification made in
    /// this same cycle. An empty slice is a no-op.
    pub async fn remediate(&self, entries: &[OutdatedEntry]) -> RemediationReport {
        let mut report = RemediationReport::default();
        if entries.is_empty() {
            return report;
        }

        let before = self.referenced_images().await;

        let mut images: Vec<&ImageRef> = Vec::new();
        for entry in entries {
            if !images.contains(&&entry.image) {
                images.push(&entry.image);
            }
        }

        for image in &images {
            if let Err(e) = self.runtime.pull_image(&image.pull_reference()).await {
                error!(image = %image, error = %e, "Pull failed");
                report.pull_failures.push(Failure {
                    subject: image.short(),
                    reason: e.to_string(),
                });
            }
        }
        if !report.pull_failures.is_empty() {
            warn!(
                failed = report.pull_failures.len(),
                "Aborting remediation, no container restarted"
            );
            report.aborted = true;
            return report;
        }

        for entry in entries {
            match self.restart(entry).await {
                Ok(path) => {
                    info!(container = %entry.container, image = %entry.image, path = ?path, "Container updated");
                    report.restarted.push(Restarted {
                        container: entry.container.clone(),
                        image: entry.image.clone(),
                        path,
                    });
                }
                Err(e) => {
                    error!(container = %entry.container, error = %e, "Container update failed");
                    report.failed.push(Failure {
                        subject: entry.container.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if let Some(before) = before {
            self.remove_unused(&before, &mut report).await;
        }

        report
    }

    async fn restart(&self, entry: &OutdatedEntry) -> anyhow::Result<RestartPath> {
        let spec = self.runtime.inspect_container(&entry.container).await?;

        let path = match ComposeProject::from_labels(&spec.labels) {
            Some(project) => match locate_compose_file(&project.working_dir, &self.config.compose_files) {
                Some(file) => self.compose_up(&file, project.service.as_deref()).await?,
                None => {
                    warn!(
                        container = %entry.container,
                        dir = %project.working_dir.display(),
                        "Compose file not found, recreating container directly"
                    );
                    self.recreate(&spec).await?
                }
            },
            None => self.recreate(&spec).await?,
        };

        wait_until_running(
            self.runtime.as_ref(),
            &entry.container,
            self.config.running_timeout,
            self.config.poll_interval,
        )
        .await?;
        tokio::time::sleep(self.config.settle).await;
        Ok(path)
    }

    async fn compose_up(
        &self,
        file: &std::path::Path,
        service: Option<&str>,
    ) -> anyhow::Result<RestartPath> {
        if let Some(service) = service {
            match self.compose.up(file, Some(service)).await {
                Ok(()) => return Ok(RestartPath::ComposeService),
                Err(e) => warn!(
                    service = %service,
                    error = %e,
                    "Scoped compose up failed, retrying for the whole project"
                ),
            }
        }
        self.compose.up(file, None).await?;
        Ok(RestartPath::ComposeProject)
    }

    async fn recreate(&self, spec: &ContainerSpec) -> anyhow::Result<RestartPath> {
        self.runtime.stop_container(&spec.name).await?;
        self.runtime.remove_container(&spec.name).await?;
        self.runtime.run_container(spec).await?;
        Ok(RestartPath::Recreate)
    }

    /// Image ids referenced by any container, `None` when the runtime cannot say.
    async fn referenced_images(&self) -> Option<HashSet<String>> {
        match self.runtime.list_containers().await {
            Ok(containers) => Some(containers.into_iter().map(|c| c.image_id).collect()),
            Err(e) => {
                warn!(error = %e, "Cannot list containers, unused image cleanup skipped");
                None
            }
        }
    }

    async fn remove_unused(&self, before: &HashSet<String>, report: &mut RemediationReport) {
        let Some(after) = self.referenced_images().await else {
            return;
        };

        let mut unused: Vec<&String> = before.difference(&after).collect();
        unused.sort();
        let mut requested = HashSet::new();
        for id in unused {
            match self.runtime.remove_image(id).await {
                Ok(()) => {
                    requested.insert(id.clone());
                }
                Err(e) => warn!(image_id = %id, error = %e, "Failed to remove unused image"),
            }
        }

        let lingering = wait_until_images_removed(
            self.runtime.as_ref(),
            &requested,
            self.config.image_removal_timeout,
            self.config.poll_interval,
        )
        .await;

        let mut removed: Vec<String> = requested
            .into_iter()
            .filter(|id| !lingering.contains(id))
            .collect();
        removed.sort();
        info!(removed = removed.len(), lingering = lingering.len(), "Unused images cleaned up");
        report.removed_images = removed;
        report.lingering_images = lingering;
    }
}
