//! Docker client wrapper for inventory and remediation
//!
//! Two seams sit here. [`DockerBridge`] mirrors the raw bollard calls so tests
//! can record them, while [`ContainerRuntime`] is the domain surface the rest
//! of the engine talks to.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::{
    ContainerCreateResponse, ContainerInspectResponse, ContainerSummary, CreateImageInfo,
    HostConfig, ImageSummary, PortBinding, RestartPolicy, RestartPolicyNameEnum, SystemInfo,
};
use bollard::system::Version as SystemVersion;
use bollard::Docker;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

type ImageStream = Pin<Box<dyn Stream<Item = Result<CreateImageInfo, DockerError>> + Send>>;

/// Seconds bollard waits on a daemon response before giving up.
const DOCKER_TIMEOUT_SECS: u64 = 120;

#[async_trait]
pub trait DockerBridge: Send + Sync {
    async fn ping(&self) -> Result<(), DockerError>;
    async fn info(&self) -> Result<SystemInfo, DockerError>;
    async fn version(&self) -> Result<SystemVersion, DockerError>;
    async fn list_images(
        &self,
        options: Option<ListImagesOptions<String>>,
    ) -> Result<Vec<ImageSummary>, DockerError>;
    async fn list_containers(
        &self,
        options: Option<ListContainersOptions<String>>,
    ) -> Result<Vec<ContainerSummary>, DockerError>;
    async fn inspect_container(
        &self,
        id: &str,
        options: Option<InspectContainerOptions>,
    ) -> Result<ContainerInspectResponse, DockerError>;
    fn create_image_stream(&self, options: Option<CreateImageOptions<String>>) -> ImageStream;
    async fn create_container(
        &self,
        options: Option<CreateContainerOptions<String>>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError>;
    async fn start_container(
        &self,
        id: &str,
        options: Option<StartContainerOptions<String>>,
    ) -> Result<(), DockerError>;
    async fn stop_container(
        &self,
        id: &str,
        options: Option<StopContainerOptions>,
    ) -> Result<(), DockerError>;
    async fn remove_container(
        &self,
        id: &str,
        options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError>;
    async fn remove_image(
        &self,
        name: &str,
        options: Option<RemoveImageOptions>,
    ) -> Result<(), DockerError>;
}

#[derive(Clone)]
struct BollardBridge {
    docker: Docker,
}

#[async_trait]
impl DockerBridge for BollardBridge {
    async fn ping(&self) -> Result<(), DockerError> {
        self.docker.ping().await.map(|_| ())
    }

    async fn info(&self) -> Result<SystemInfo, DockerError> {
        self.docker.info().await
    }

    async fn version(&self) -> Result<SystemVersion, DockerError> {
        self.docker.version().await
    }

    async fn list_images(
        &self,
        options: Option<ListImagesOptions<String>>,
    ) -> Result<Vec<ImageSummary>, DockerError> {
        self.docker.list_images(options).await
    }

    async fn list_containers(
        &self,
        options: Option<ListContainersOptions<String>>,
    ) -> Result<Vec<ContainerSummary>, DockerError> {
        self.docker.list_containers(options).await
    }

    async fn inspect_container(
        &self,
        id: &str,
        options: Option<InspectContainerOptions>,
    ) -> Result<ContainerInspectResponse, DockerError> {
        self.docker.inspect_container(id, options).await
    }

    fn create_image_stream(&self, options: Option<CreateImageOptions<String>>) -> ImageStream {
        Box::pin(self.docker.create_image(options, None, None))
    }

    async fn create_container(
        &self,
        options: Option<CreateContainerOptions<String>>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError> {
        self.docker.create_container(options, config).await
    }

    async fn start_container(
        &self,
        id: &str,
        options: Option<StartContainerOptions<String>>,
    ) -> Result<(), DockerError> {
        self.docker.start_container(id, options).await
    }

    async fn stop_container(
        &self,
        id: &str,
        options: Option<StopContainerOptions>,
    ) -> Result<(), DockerError> {
        self.docker.stop_container(id, options).await
    }

    async fn remove_container(
        &self,
        id: &str,
        options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError> {
        self.docker.remove_container(id, options).await
    }

    async fn remove_image(
        &self,
        name: &str,
        options: Option<RemoveImageOptions>,
    ) -> Result<(), DockerError> {
        self.docker.remove_image(name, options, None).await.map(|_| ())
    }
}

/// A locally stored image as reported by the runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub size: i64,
    /// Unix seconds
    pub created: i64,
}

/// A container of any state, reduced to what inventory needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineInfo {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostPort {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

/// Run parameters captured from an existing container so it can be recreated
/// from a freshly pulled image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub labels: HashMap<String, String>,
    pub exposed_ports: Vec<String>,
    pub port_bindings: HashMap<String, Vec<HostPort>>,
    pub binds: Vec<String>,
    pub restart_policy: Option<String>,
    pub restart_max_retries: Option<i64>,
    pub network: Option<String>,
}

/// Domain-level container runtime operations.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_images(&self) -> anyhow::Result<Vec<ImageInfo>>;
    async fn list_containers(&self) -> anyhow::Result<Vec<ContainerInfo>>;
    async fn inspect_container(&self, name: &str) -> anyhow::Result<ContainerSpec>;
    async fn pull_image(&self, image: &str) -> anyhow::Result<()>;
    async fn stop_container(&self, name: &str) -> anyhow::Result<()>;
    async fn remove_container(&self, name: &str) -> anyhow::Result<()>;
    async fn run_container(&self, spec: &ContainerSpec) -> anyhow::Result<String>;
    async fn is_container_running(&self, name: &str) -> anyhow::Result<bool>;
    async fn remove_image(&self, id: &str) -> anyhow::Result<()>;
    async fn engine_info(&self) -> anyhow::Result<EngineInfo>;
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn list_images(&self) -> anyhow::Result<Vec<ImageInfo>> {
        DockerClient::list_images(self).await
    }

    async fn list_containers(&self) -> anyhow::Result<Vec<ContainerInfo>> {
        DockerClient::list_containers(self).await
    }

    async fn inspect_container(&self, name: &str) -> anyhow::Result<ContainerSpec> {
        DockerClient::inspect_container(self, name).await
    }

    async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
        DockerClient::pull_image(self, image).await
    }

    async fn stop_container(&self, name: &str) -> anyhow::Result<()> {
        DockerClient::stop_container(self, name).await
    }

    async fn remove_container(&self, name: &str) -> anyhow::Result<()> {
        DockerClient::remove_container(self, name).await
    }

    async fn run_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        DockerClient::run_container(self, spec).await
    }

    async fn is_container_running(&self, name: &str) -> anyhow::Result<bool> {
        DockerClient::is_container_running(self, name).await
    }

    async fn remove_image(&self, id: &str) -> anyhow::Result<()> {
        DockerClient::remove_image(self, id).await
    }

    async fn engine_info(&self) -> anyhow::Result<EngineInfo> {
        DockerClient::engine_info(self).await
    }
}

/// Docker client backed by a [`DockerBridge`].
#[derive(Clone)]
pub struct DockerClient {
    docker: Arc<dyn DockerBridge>,
    stop_timeout: i64,
}

impl DockerClient {
    /// Wraps an arbitrary bridge. Used by tests and by [`DockerClient::connect`].
    pub fn with_bridge(docker: impl DockerBridge + 'static, stop_timeout: i64) -> Self {
        Self {
            docker: Arc::new(docker),
            stop_timeout,
        }
    }

    /// Connects to the Docker daemon and verifies it answers a ping.
    ///
    /// `docker_host` accepts `unix://` socket paths and `tcp://`/`http://`
    /// endpoints. When absent the local defaults (including `DOCKER_HOST`)
    /// are used.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # async fn run() -> anyhow::Result<()> {
    /// let client = drift_engine::docker::DockerClient::connect(None, 30).await?;
    /// # let _ = client;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(docker_host: Option<&str>, stop_timeout: i64) -> anyhow::Result<Self> {
        let docker = match docker_host {
            Some(host) if host.starts_with("unix://") => Docker::connect_with_socket(
                host,
                DOCKER_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )?,
            Some(host) => {
                Docker::connect_with_http(host, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
            None => Docker::connect_with_local_defaults()?,
        };

        let bridge = BollardBridge { docker };
        bridge
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("Docker daemon unreachable: {e}"))?;

        info!(host = docker_host.unwrap_or("local"), "Connected to Docker daemon");
        Ok(Self::with_bridge(bridge, stop_timeout))
    }

    /// Lists non-dangling images.
    pub async fn list_images(&self) -> anyhow::Result<Vec<ImageInfo>> {
        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec!["false".to_string()]);
        let options = ListImagesOptions {
            all: false,
            filters,
            ..Default::default()
        };

        let images = self.docker.list_images(Some(options)).await?;
        Ok(images.into_iter().map(image_info_from_summary).collect())
    }

    /// Lists every container regardless of state.
    pub async fn list_containers(&self) -> anyhow::Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(container_info_from_summary)
            .collect())
    }

    pub async fn inspect_container(&self, name: &str) -> anyhow::Result<ContainerSpec> {
        let response = self.docker.inspect_container(name, None).await?;
        spec_from_inspect(name, response)
    }

    /// Pulls an image by reference. Any error reported on the progress
    /// stream fails the pull.
    pub async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
        info!(image = %image, "Pulling Docker image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image_stream(Some(options));

        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        warn!(image = %image, error = %error, "Pull failed");
                        anyhow::bail!("failed to pull {image}: {error}");
                    }
                    if let Some(status) = progress.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(DockerError::DockerStreamError { error }) => {
                    warn!(image = %image, error = %error, "Pull failed");
                    anyhow::bail!("failed to pull {image}: {error}");
                }
                Err(e) => {
                    warn!(image = %image, error = %e, "Pull failed");
                    anyhow::bail!("failed to pull {image}: {e}");
                }
            }
        }

        info!(image = %image, "Image pulled successfully");
        Ok(())
    }

    /// Stop a container
    pub async fn stop_container(&self, name: &str) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: self.stop_timeout,
        };

        match self.docker.stop_container(name, Some(options)).await {
            Ok(_) => {
                debug!(container = %name, "Container stopped");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a container
    pub async fn remove_container(&self, name: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(name, Some(options)).await {
            Ok(_) => {
                debug!(container = %name, "Container removed");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates and starts a container from `spec`, returning its id.
    pub async fn run_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await?;

        info!(container = %spec.name, image = %spec.image, id = %response.id, "Container started");
        Ok(response.id)
    }

    /// Check if a container is running
    pub async fn is_container_running(&self, name: &str) -> anyhow::Result<bool> {
        match self.docker.inspect_container(name, None).await {
            Ok(info) => Ok(info.state.and_then(|s| s.running).unwrap_or(false)),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes an image by id. An image that is already gone counts as removed.
    pub async fn remove_image(&self, id: &str) -> anyhow::Result<()> {
        let options = RemoveImageOptions {
            force: false,
            noprune: false,
        };

        match self.docker.remove_image(id, Some(options)).await {
            Ok(_) => {
                debug!(image_id = %id, "Image removed");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn engine_info(&self) -> anyhow::Result<EngineInfo> {
        let info = self.docker.info().await?;
        let version = self.docker.version().await?;
        Ok(EngineInfo {
            name: info.name.unwrap_or_else(|| "unknown".to_string()),
            version: version.version.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

fn image_info_from_summary(summary: ImageSummary) -> ImageInfo {
    ImageInfo {
        id: summary.id,
        repo_tags: summary.repo_tags,
        repo_digests: summary.repo_digests,
        size: summary.size,
        created: summary.created,
    }
}

fn container_info_from_summary(summary: ContainerSummary) -> Option<ContainerInfo> {
    let id = summary.id?;
    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.clone());
    Some(ContainerInfo {
        id,
        name,
        image_id: summary.image_id.unwrap_or_default(),
    })
}

fn spec_from_inspect(name: &str, response: ContainerInspectResponse) -> anyhow::Result<ContainerSpec> {
    let config = response
        .config
        .ok_or_else(|| anyhow::anyhow!("container {name} has no config"))?;
    let image = config
        .image
        .ok_or_else(|| anyhow::anyhow!("container {name} has no image reference"))?;
    let host = response.host_config.unwrap_or_default();

    let port_bindings = host
        .port_bindings
        .unwrap_or_default()
        .into_iter()
        .map(|(port, bindings)| {
            let hosts = bindings
                .unwrap_or_default()
                .into_iter()
                .map(|b| HostPort {
                    host_ip: b.host_ip,
                    host_port: b.host_port,
                })
                .collect();
            (port, hosts)
        })
        .collect();

    let mut exposed_ports: Vec<String> = config
        .exposed_ports
        .map(|ports| ports.into_keys().collect())
        .unwrap_or_default();
    exposed_ports.sort();

    let (restart_policy, restart_max_retries) = match host.restart_policy {
        Some(policy) => (restart_policy_name(&policy), policy.maximum_retry_count),
        None => (None, None),
    };

    let name = response
        .name
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| name.to_string());

    Ok(ContainerSpec {
        name,
        image,
        env: config.env.unwrap_or_default(),
        cmd: config.cmd,
        entrypoint: config.entrypoint,
        labels: config.labels.unwrap_or_default(),
        exposed_ports,
        port_bindings,
        binds: host.binds.unwrap_or_default(),
        restart_policy,
        restart_max_retries,
        network: host.network_mode,
    })
}

fn restart_policy_name(policy: &RestartPolicy) -> Option<String> {
    let name = match policy.name.as_ref()? {
        RestartPolicyNameEnum::EMPTY => return None,
        RestartPolicyNameEnum::NO => "no",
        RestartPolicyNameEnum::ALWAYS => "always",
        RestartPolicyNameEnum::UNLESS_STOPPED => "unless-stopped",
        RestartPolicyNameEnum::ON_FAILURE => "on-failure",
    };
    Some(name.to_string())
}

fn restart_policy_enum(name: &str) -> Option<RestartPolicyNameEnum> {
    match name {
        "no" => Some(RestartPolicyNameEnum::NO),
        "always" => Some(RestartPolicyNameEnum::ALWAYS),
        "unless-stopped" => Some(RestartPolicyNameEnum::UNLESS_STOPPED),
        "on-failure" => Some(RestartPolicyNameEnum::ON_FAILURE),
        _ => None,
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
        .port_bindings
        .iter()
        .map(|(port, hosts)| {
            let bindings = hosts
                .iter()
                .map(|h| PortBinding {
                    host_ip: h.host_ip.clone(),
                    host_port: h.host_port.clone(),
                })
                .collect();
            (port.clone(), Some(bindings))
        })
        .collect();

    let restart_policy = spec
        .restart_policy
        .as_deref()
        .and_then(restart_policy_enum)
        .map(|name| RestartPolicy {
            name: Some(name),
            maximum_retry_count: spec.restart_max_retries,
        });

    let host_config = HostConfig {
        binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        restart_policy,
        network_mode: spec.network.clone(),
        ..Default::default()
    };

    let exposed_ports = (!spec.exposed_ports.is_empty()).then(|| {
        spec.exposed_ports
            .iter()
            .map(|p| (p.clone(), HashMap::new()))
            .collect()
    });

    Config {
        image: Some(spec.image.clone()),
        env: (!spec.env.is_empty()).then(|| spec.env.clone()),
        cmd: spec.cmd.clone(),
        entrypoint: spec.entrypoint.clone(),
        labels: (!spec.labels.is_empty()).then(|| spec.labels.clone()),
        exposed_ports,
        host_config: Some(host_config),
        ..Default::default()
    }
}
