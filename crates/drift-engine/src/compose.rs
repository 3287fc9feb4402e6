//! Compose-managed containers
//!
//! Containers started by a compose tool carry labels naming the project
//! working directory and the service. Those are restarted through the
//! compose CLI instead of being recreated by hand.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const WORKING_DIR_LABEL: &str = "com.docker.compose.project.working_dir";
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeProject {
    pub working_dir: PathBuf,
    pub service: Option<String>,
}

impl ComposeProject {
    /// `None` when the container was not started by a compose tool.
    pub fn from_labels(labels: &HashMap<String, String>) -> Option<Self> {
        let working_dir = labels
            .get(WORKING_DIR_LABEL)
            .filter(|dir| !dir.trim().is_empty())?;
        Some(Self {
            working_dir: PathBuf::from(working_dir),
            service: labels.get(SERVICE_LABEL).filter(|s| !s.is_empty()).cloned(),
        })
    }
}

/// First candidate file name that exists in `dir`.
pub fn locate_compose_file(dir: &Path, candidates: &[String]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

#[async_trait]
pub trait ComposeRunner: Send + Sync {
    /// `up -d` for one service, or the whole project when `service` is `None`.
    async fn up(&self, file: &Path, service: Option<&str>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeDriver {
    /// `docker compose`
    DockerCli,
    /// `docker-compose`
    DockerCompose,
}

impl ComposeDriver {
    /// Program and arguments for an `up -d` invocation.
    pub fn up_command(self, file: &Path, service: Option<&str>) -> (&'static str, Vec<String>) {
        let mut args = Vec::new();
        let program = match self {
            ComposeDriver::DockerCli => {
                args.push("compose".to_string());
                "docker"
            }
            ComposeDriver::DockerCompose => "docker-compose",
        };
        args.extend([
            "-f".to_string(),
            file.display().to_string(),
            "up".to_string(),
            "-d".to_string(),
        ]);
        if let Some(service) = service {
            args.push(service.to_string());
        }
        (program, args)
    }
}

/// Runs the compose tool found on this host.
#[derive(Debug, Clone)]
pub struct ComposeCli {
    driver: Option<ComposeDriver>,
}

impl ComposeCli {
    /// Prefers `docker compose`, falls back to `docker-compose`.
    pub async fn detect() -> Self {
        let driver = if probe("docker", &["compose", "version"]).await {
            Some(ComposeDriver::DockerCli)
        } else if probe("docker-compose", &["version"]).await {
            Some(ComposeDriver::DockerCompose)
        } else {
            warn!("Neither 'docker compose' nor 'docker-compose' found, compose restarts disabled");
            None
        };
        if let Some(driver) = driver {
            info!(driver = ?driver, "Compose driver detected");
        }
        Self { driver }
    }
}

async fn probe(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[async_trait]
impl ComposeRunner for ComposeCli {
    async fn up(&self, file: &Path, service: Option<&str>) -> anyhow::Result<()> {
        let driver = self
            .driver
            .ok_or_else(|| anyhow::anyhow!("no compose tool available"))?;
        let (program, args) = driver.up_command(file, service);
        debug!(program, args = ?args, "Running compose");

        let mut command = Command::new(program);
        command.args(&args);
        if let Some(dir) = file.parent() {
            command.current_dir(dir);
        }
        let output = command.output().await.map_err(|e| {
            anyhow::anyhow!("failed to run {program} for {}: {e}", file.display())
        })?;

        if !output.status.success() {
            anyhow::bail!(
                "{program} up failed for {}: {}",
                file.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
