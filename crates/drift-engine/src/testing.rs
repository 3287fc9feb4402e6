//! In-memory doubles shared by the engine tests.

use crate::compose::ComposeRunner;
use crate::docker::{ContainerInfo, ContainerRuntime, ContainerSpec, EngineInfo, ImageInfo};
use crate::notifier::NotificationSink;
use crate::reference::ImageRef;
use crate::registry::DigestResolver;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub(crate) struct TestRuntime {
    inner: Arc<RuntimeInner>,
}

#[derive(Default)]
struct RuntimeInner {
    operations: Mutex<Vec<String>>,
    images: Mutex<Vec<ImageInfo>>,
    containers: Mutex<Vec<ContainerInfo>>,
    specs: Mutex<HashMap<String, ContainerSpec>>,
    failing_pulls: Mutex<HashSet<String>>,
    failing_runs: Mutex<HashSet<String>>,
    never_running: Mutex<HashSet<String>>,
    /// container name -> image id it moves to once recreated
    upgrades: Mutex<HashMap<String, String>>,
}

impl TestRuntime {
    pub fn add_image(&self, id: &str, tag: &str, repo_digest: Option<&str>) {
        self.inner.images.lock().unwrap().push(ImageInfo {
            id: id.to_string(),
            repo_tags: vec![tag.to_string()],
            repo_digests: repo_digest.map(|d| vec![d.to_string()]).unwrap_or_default(),
            size: 1024,
            created: 1_700_000_000,
        });
    }

    pub fn add_container(&self, name: &str, image_id: &str, image: &str) {
        self.add_container_with_labels(name, image_id, image, HashMap::new());
    }

    pub fn add_container_with_labels(
        &self,
        name: &str,
        image_id: &str,
        image: &str,
        labels: HashMap<String, String>,
    ) {
        self.inner.containers.lock().unwrap().push(ContainerInfo {
            id: format!("id-{name}"),
            name: name.to_string(),
            image_id: image_id.to_string(),
        });
        self.inner.specs.lock().unwrap().insert(
            name.to_string(),
            ContainerSpec {
                name: name.to_string(),
                image: image.to_string(),
                env: vec!["MODE=test".to_string()],
                labels,
                restart_policy: Some("unless-stopped".to_string()),
                ..Default::default()
            },
        );
    }

    /// After recreation `container` runs `new_image_id`, which also appears
    /// in the image list.
    pub fn upgrade_on_restart(&self, container: &str, new_image_id: &str) {
        self.inner
            .upgrades
            .lock()
            .unwrap()
            .insert(container.to_string(), new_image_id.to_string());
    }

    pub fn fail_pull(&self, image: &str) {
        self.inner.failing_pulls.lock().unwrap().insert(image.to_string());
    }

    pub fn fail_run(&self, container: &str) {
        self.inner.failing_runs.lock().unwrap().insert(container.to_string());
    }

    pub fn never_running(&self, container: &str) {
        self.inner
            .never_running
            .lock()
            .unwrap()
            .insert(container.to_string());
    }

    pub fn operations(&self) -> Vec<String> {
        self.inner.operations.lock().unwrap().clone()
    }

    pub fn image_ids(&self) -> Vec<String> {
        self.inner
            .images
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.id.clone())
            .collect()
    }

    fn record(&self, operation: String) {
        self.inner.operations.lock().unwrap().push(operation);
    }

    /// Points `container` at its upgraded image, as a restart would.
    pub fn apply_upgrade(&self, container: &str) {
        let Some(new_id) = self.inner.upgrades.lock().unwrap().get(container).cloned() else {
            return;
        };
        if let Some(entry) = self
            .inner
            .containers
            .lock()
            .unwrap()
            .iter_mut()
            .find(|c| c.name == container)
        {
            entry.image_id = new_id.clone();
        }
        let mut images = self.inner.images.lock().unwrap();
        if !images.iter().any(|i| i.id == new_id) {
            images.push(ImageInfo {
                id: new_id,
                ..Default::default()
            });
        }
    }
}

#[async_trait]
impl ContainerRuntime for TestRuntime {
    async fn list_images(&self) -> anyhow::Result<Vec<ImageInfo>> {
        Ok(self.inner.images.lock().unwrap().clone())
    }

    async fn list_containers(&self) -> anyhow::Result<Vec<ContainerInfo>> {
        Ok(self.inner.containers.lock().unwrap().clone())
    }

    async fn inspect_container(&self, name: &str) -> anyhow::Result<ContainerSpec> {
        self.record(format!("inspect:{name}"));
        self.inner
            .specs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such container: {name}"))
    }

    async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
        self.record(format!("pull:{image}"));
        if self.inner.failing_pulls.lock().unwrap().contains(image) {
            anyhow::bail!("manifest unknown for {image}");
        }
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> anyhow::Result<()> {
        self.record(format!("stop:{name}"));
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> anyhow::Result<()> {
        self.record(format!("remove:{name}"));
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        self.record(format!("run:{}", spec.name));
        if self.inner.failing_runs.lock().unwrap().contains(&spec.name) {
            anyhow::bail!("port is already allocated");
        }
        self.apply_upgrade(&spec.name);
        Ok(format!("id-{}", spec.name))
    }

    async fn is_container_running(&self, name: &str) -> anyhow::Result<bool> {
        Ok(!self.inner.never_running.lock().unwrap().contains(name))
    }

    async fn remove_image(&self, id: &str) -> anyhow::Result<()> {
        self.record(format!("remove_image:{id}"));
        self.inner.images.lock().unwrap().retain(|i| i.id != id);
        Ok(())
    }

    async fn engine_info(&self) -> anyhow::Result<EngineInfo> {
        Ok(EngineInfo {
            name: "test-node".to_string(),
            version: "27.0.0".to_string(),
        })
    }
}

/// Compose double: records invocations and upgrades the container named
/// like the service.
#[derive(Clone)]
pub(crate) struct TestCompose {
    runtime: TestRuntime,
    fail_scoped: Arc<Mutex<HashSet<String>>>,
}

impl TestCompose {
    pub fn new(runtime: TestRuntime) -> Self {
        Self {
            runtime,
            fail_scoped: Arc::default(),
        }
    }

    pub fn fail_service(&self, service: &str) {
        self.fail_scoped.lock().unwrap().insert(service.to_string());
    }
}

#[async_trait]
impl ComposeRunner for TestCompose {
    async fn up(&self, file: &Path, service: Option<&str>) -> anyhow::Result<()> {
        self.runtime.record(format!(
            "compose_up:{}:{}",
            file.display(),
            service.unwrap_or("*")
        ));
        match service {
            Some(service) if self.fail_scoped.lock().unwrap().contains(service) => {
                anyhow::bail!("no such service: {service}")
            }
            Some(service) => self.runtime.apply_upgrade(service),
            None => {
                let names: Vec<String> = self
                    .runtime
                    .inner
                    .containers
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|c| c.name.clone())
                    .collect();
                for name in names {
                    self.runtime.apply_upgrade(&name);
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct TestResolver {
    digests: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
}

impl TestResolver {
    pub fn set(&self, image: &str, digest: &str) {
        self.digests
            .lock()
            .unwrap()
            .insert(image.to_string(), digest.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DigestResolver for TestResolver {
    async fn resolve(&self, image: &ImageRef) -> Option<String> {
        self.calls.lock().unwrap().push(image.to_string());
        self.digests.lock().unwrap().get(&image.to_string()).cloned()
    }
}

#[derive(Default)]
pub(crate) struct TestSink {
    messages: Mutex<Vec<String>>,
}

impl TestSink {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for TestSink {
    async fn send(&self, message: &str) -> anyhow::Result<()> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }

    fn channels(&self) -> Vec<String> {
        vec!["test".to_string()]
    }
}
