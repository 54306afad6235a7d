use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{ContainerRecord, ImageRecord, RecreateConfig};

pub mod docker;
pub use docker::DockerEngine;

/// The container engine as the update engine consumes it.
///
/// Every call surfaces the engine-level error wrapped with an
/// operation-specific message. Listing returns shallow records; `inspect`
/// returns full ones.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// List running containers as shallow records.
    async fn list_running(&self) -> Result<Vec<ContainerRecord>>;

    /// Inspect one container, returning a full record with its recreate
    /// config.
    async fn inspect(&self, id: &str) -> Result<ContainerRecord>;

    /// Pull an image by reference and report what landed locally.
    async fn pull_image(&self, reference: &str) -> Result<ImageRecord>;

    /// List images with no repository tags.
    async fn list_dangling_images(&self) -> Result<Vec<ImageRecord>>;

    async fn remove_image(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn rename_container(&self, id: &str, name: &str) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Create (but do not start) a container from a recreate config with the
    /// given image substituted. Returns the new container id.
    async fn create_container(
        &self,
        name: &str,
        image: &str,
        config: &RecreateConfig,
    ) -> Result<String>;

    /// Create (but do not start) a helper container cloned from `source`'s
    /// config with its command overridden. Returns the new container id.
    async fn create_helper_container(
        &self,
        name: &str,
        image: &str,
        source: &RecreateConfig,
        command: Vec<String>,
    ) -> Result<String>;

    /// Whether the container currently reports a running state.
    async fn is_running(&self, id: &str) -> Result<bool>;
}
