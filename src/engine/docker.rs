use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig,
    RemoveContainerOptions, RenameContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::{ContainerInspectResponse, ContainerSummary, ImageSummary};
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::debug;

use super::ContainerEngine;
use crate::types::{ContainerRecord, ImageRecord, RecreateConfig};

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the local Docker daemon using default settings.
    /// This handles the unix socket on Linux.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Connecting to the Docker daemon")?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_running(&self) -> Result<Vec<ContainerRecord>> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .context("Listing running containers")?;

        let mut records = Vec::with_capacity(containers.len());
        for summary in containers {
            match shallow_record(summary) {
                Some(record) => records.push(record),
                None => debug!("Skipping container listing entry without id"),
            }
        }
        Ok(records)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerRecord> {
        let detail = self
            .docker
            .inspect_container(id, None)
            .await
            .with_context(|| format!("Inspecting container {}", id))?;
        full_record(detail)
    }

    async fn pull_image(&self, reference: &str) -> Result<ImageRecord> {
        let opts = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(progress) = stream.next().await {
            let info = progress.with_context(|| format!("Pulling image {}", reference))?;
            if let Some(status) = info.status {
                debug!("Pull {}: {}", reference, status);
            }
        }

        let inspect = self
            .docker
            .inspect_image(reference)
            .await
            .with_context(|| format!("Inspecting pulled image {}", reference))?;

        let id = inspect
            .id
            .ok_or_else(|| anyhow!("Engine reported no id for pulled image {}", reference))?;
        let created = inspect
            .created
            .as_deref()
            .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.timestamp());
        Ok(ImageRecord {
            id,
            repo_tags: inspect.repo_tags.unwrap_or_default(),
            created,
            size: inspect.size.unwrap_or_default(),
            labels: inspect
                .config
                .and_then(|c| c.labels)
                .unwrap_or_default(),
        })
    }

    async fn list_dangling_images(&self) -> Result<Vec<ImageRecord>> {
        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec!["true".to_string()]);
        let opts = ListImagesOptions::<String> {
            filters,
            ..Default::default()
        };
        let images = self
            .docker
            .list_images(Some(opts))
            .await
            .context("Listing dangling images")?;
        Ok(images.into_iter().map(image_record).collect())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        self.docker
            .remove_image(id, None::<RemoveImageOptions>, None)
            .await
            .with_context(|| format!("Removing image {}", id))?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let opts = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        self.docker
            .stop_container(id, Some(opts))
            .await
            .with_context(|| format!("Stopping container {}", id))?;
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("Starting container {}", id))?;
        Ok(())
    }

    async fn rename_container(&self, id: &str, name: &str) -> Result<()> {
        let opts = RenameContainerOptions {
            name: name.to_string(),
        };
        self.docker
            .rename_container(id, opts)
            .await
            .with_context(|| format!("Renaming container {} to {}", id, name))?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let opts = RemoveContainerOptions {
            force: false,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(opts))
            .await
            .with_context(|| format!("Removing container {}", id))?;
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        config: &RecreateConfig,
    ) -> Result<String> {
        let opts = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(opts), create_config(image, config, None))
            .await
            .with_context(|| format!("Creating container {} from image {}", name, image))?;
        Ok(response.id)
    }

    async fn create_helper_container(
        &self,
        name: &str,
        image: &str,
        source: &RecreateConfig,
        command: Vec<String>,
    ) -> Result<String> {
        let opts = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(opts), create_config(image, source, Some(command)))
            .await
            .with_context(|| format!("Creating helper container {}", name))?;
        Ok(response.id)
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        let detail = self
            .docker
            .inspect_container(id, None)
            .await
            .with_context(|| format!("Inspecting container {}", id))?;
        Ok(detail
            .state
            .and_then(|s| s.running)
            .unwrap_or(false))
    }
}

fn shallow_record(summary: ContainerSummary) -> Option<ContainerRecord> {
    let id = summary.id?;
    let name = summary
        .names
        .as_ref()
        .and_then(|n| n.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.clone());
    Some(ContainerRecord {
        id,
        name,
        image_ref: summary.image.unwrap_or_default(),
        image_id: summary.image_id.unwrap_or_default(),
        labels: summary.labels.unwrap_or_default(),
        recreate: None,
    })
}

fn full_record(detail: ContainerInspectResponse) -> Result<ContainerRecord> {
    let id = detail
        .id
        .ok_or_else(|| anyhow!("Engine reported a container without an id"))?;
    let name = detail
        .name
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.clone());
    let config = detail.config.unwrap_or_default();
    let networks = detail.network_settings.and_then(|s| s.networks);

    Ok(ContainerRecord {
        id,
        name,
        image_ref: config.image.clone().unwrap_or_default(),
        image_id: detail.image.unwrap_or_default(),
        labels: config.labels.clone().unwrap_or_default(),
        recreate: Some(RecreateConfig {
            entrypoint: config.entrypoint,
            cmd: config.cmd,
            env: config.env,
            hostname: config.hostname,
            user: config.user,
            working_dir: config.working_dir,
            labels: config.labels,
            exposed_ports: config.exposed_ports,
            volumes: config.volumes,
            host_config: detail.host_config,
            networks,
        }),
    })
}

fn image_record(summary: ImageSummary) -> ImageRecord {
    ImageRecord {
        id: summary.id,
        repo_tags: summary.repo_tags,
        created: Some(summary.created),
        size: summary.size,
        labels: summary.labels,
    }
}

/// Build an engine create payload from a recreate config with `image`
/// substituted. `command` overrides the stored cmd for helper containers.
fn create_config(
    image: &str,
    config: &RecreateConfig,
    command: Option<Vec<String>>,
) -> Config<String> {
    let networking_config = config.networks.clone().map(|endpoints| NetworkingConfig {
        endpoints_config: endpoints,
    });
    Config {
        image: Some(image.to_string()),
        entrypoint: config.entrypoint.clone(),
        cmd: command.or_else(|| config.cmd.clone()),
        env: config.env.clone(),
        hostname: config.hostname.clone(),
        user: config.user.clone(),
        working_dir: config.working_dir.clone(),
        labels: config.labels.clone(),
        exposed_ports: config.exposed_ports.clone(),
        volumes: config.volumes.clone(),
        host_config: config.host_config.clone(),
        networking_config,
        ..Default::default()
    }
}
