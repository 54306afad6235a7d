//! Data structures shared across the update engine.
//!
//! These are thin owned carriers for what the container engine reports.
//! They are produced per call and never persisted; a [`ContainerRecord`]
//! starts out *shallow* (discovery listing) and is upgraded to *full* by an
//! explicit inspect before anything mutating happens to the container.

use std::collections::HashMap;

use bollard::models::{EndpointSettings, HostConfig};

/// Placeholder tag the engine reports for untagged images.
pub const NONE_TAG: &str = "<none>:<none>";

/// Label keys consulted for a human-friendly container name, in priority
/// order.
const NAME_LABELS: [&str; 4] = [
    "org.opencontainers.image.title",
    "org.label-schema.name",
    "com.docker.compose.service",
    "name",
];

/// A running container as the engine reports it.
///
/// `recreate` is `None` for records coming from the cheap discovery listing
/// and `Some` after an explicit inspect. Replacement must only ever run on a
/// full record.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    pub image_id: String,
    pub labels: HashMap<String, String>,
    pub recreate: Option<RecreateConfig>,
}

impl ContainerRecord {
    /// First non-empty well-known name label, or the empty string.
    /// Only used to make log lines readable.
    pub fn friendly_name(&self) -> &str {
        friendly_name(&self.labels)
    }
}

/// Everything needed to create an equivalent container with a different
/// image. The host and network settings are carried as the engine's own
/// models and passed back verbatim on create.
#[derive(Debug, Clone, Default)]
pub struct RecreateConfig {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub labels: Option<HashMap<String, String>>,
    pub exposed_ports: Option<HashMap<String, HashMap<(), ()>>>,
    pub volumes: Option<HashMap<String, HashMap<(), ()>>>,
    pub host_config: Option<HostConfig>,
    pub networks: Option<HashMap<String, EndpointSettings>>,
}

/// An image as the engine reports it. Transient, produced per call.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: String,
    pub repo_tags: Vec<String>,
    /// Unix seconds, when the engine reports it.
    pub created: Option<i64>,
    pub size: i64,
    pub labels: HashMap<String, String>,
}

impl ImageRecord {
    /// An image with no tags (or only the engine's placeholder tag) is
    /// dangling, typically orphaned by an update.
    pub fn is_dangling(&self) -> bool {
        self.repo_tags.is_empty() || self.repo_tags.iter().all(|t| t == NONE_TAG)
    }
}

/// Outcome of the eligibility check. Pure function of a container and the
/// allow/deny/label configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDecision {
    pub eligible: bool,
    pub reason: String,
}

impl UpdateDecision {
    pub fn accept(reason: impl Into<String>) -> Self {
        Self {
            eligible: true,
            reason: reason.into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            eligible: false,
            reason: reason.into(),
        }
    }
}

/// First non-empty value among the well-known name labels.
pub fn friendly_name(labels: &HashMap<String, String>) -> &str {
    for key in NAME_LABELS {
        if let Some(value) = labels.get(key) {
            if !value.is_empty() {
                return value;
            }
        }
    }
    ""
}
