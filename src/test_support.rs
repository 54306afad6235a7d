//! Recording mock of the container engine for unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::engine::ContainerEngine;
use crate::types::{ContainerRecord, ImageRecord, RecreateConfig};

/// In-memory engine that records every call in order and fails on demand.
#[derive(Default)]
pub struct MockEngine {
    calls: Mutex<Vec<String>>,
    fail_exact: Mutex<Vec<String>>,
    fail_prefix: Mutex<Vec<String>>,
    list_result: Mutex<Vec<ContainerRecord>>,
    inspect_results: Mutex<HashMap<String, ContainerRecord>>,
    pull_results: Mutex<HashMap<String, ImageRecord>>,
    dangling: Mutex<Vec<ImageRecord>>,
    /// Per-container sequence of `is_running` answers; exhausted means
    /// stopped.
    running: Mutex<HashMap<String, Vec<bool>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_on(&self, call: &str) {
        self.fail_exact.lock().unwrap().push(call.to_string());
    }

    pub fn fail_on_prefix(&self, prefix: &str) {
        self.fail_prefix.lock().unwrap().push(prefix.to_string());
    }

    pub fn set_list(&self, containers: Vec<ContainerRecord>) {
        *self.list_result.lock().unwrap() = containers;
    }

    pub fn set_inspect(&self, record: ContainerRecord) {
        self.inspect_results
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
    }

    pub fn set_pull(&self, reference: &str, image: ImageRecord) {
        self.pull_results
            .lock()
            .unwrap()
            .insert(reference.to_string(), image);
    }

    pub fn set_dangling(&self, images: Vec<ImageRecord>) {
        *self.dangling.lock().unwrap() = images;
    }

    pub fn set_running_sequence(&self, id: &str, answers: Vec<bool>) {
        self.running
            .lock()
            .unwrap()
            .insert(id.to_string(), answers);
    }

    fn record(&self, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call.clone());
        if self.fail_exact.lock().unwrap().iter().any(|f| *f == call) {
            return Err(anyhow!("injected failure for '{}'", call));
        }
        if self
            .fail_prefix
            .lock()
            .unwrap()
            .iter()
            .any(|p| call.starts_with(p.as_str()))
        {
            return Err(anyhow!("injected failure for '{}'", call));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn list_running(&self) -> Result<Vec<ContainerRecord>> {
        self.record("list".into())?;
        Ok(self.list_result.lock().unwrap().clone())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerRecord> {
        self.record(format!("inspect {}", id))?;
        self.inspect_results
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("no such container {}", id))
    }

    async fn pull_image(&self, reference: &str) -> Result<ImageRecord> {
        self.record(format!("pull {}", reference))?;
        self.pull_results
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| anyhow!("no such image {}", reference))
    }

    async fn list_dangling_images(&self) -> Result<Vec<ImageRecord>> {
        self.record("list_dangling".into())?;
        Ok(self.dangling.lock().unwrap().clone())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        self.record(format!("remove_image {}", id))
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.record(format!("stop {}", id))
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(format!("start {}", id))
    }

    async fn rename_container(&self, id: &str, name: &str) -> Result<()> {
        self.record(format!("rename {} {}", id, name))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.record(format!("remove_container {}", id))
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        _config: &RecreateConfig,
    ) -> Result<String> {
        self.record(format!("create {} {}", name, image))?;
        Ok(format!("created-{}", name))
    }

    async fn create_helper_container(
        &self,
        name: &str,
        image: &str,
        _source: &RecreateConfig,
        command: Vec<String>,
    ) -> Result<String> {
        self.record(format!("create_helper {} {} [{}]", name, image, command.join(" ")))?;
        Ok(format!("created-{}", name))
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        self.record(format!("is_running {}", id))?;
        let mut running = self.running.lock().unwrap();
        match running.get_mut(id) {
            Some(answers) if !answers.is_empty() => Ok(answers.remove(0)),
            _ => Ok(false),
        }
    }
}

/// Shallow container record helper for tests.
pub fn shallow(id: &str, name: &str, image_ref: &str, image_id: &str) -> ContainerRecord {
    ContainerRecord {
        id: id.into(),
        name: name.into(),
        image_ref: image_ref.into(),
        image_id: image_id.into(),
        labels: HashMap::new(),
        recreate: None,
    }
}

/// Full container record helper for tests.
pub fn full(id: &str, name: &str, image_ref: &str, image_id: &str) -> ContainerRecord {
    ContainerRecord {
        recreate: Some(RecreateConfig::default()),
        ..shallow(id, name, image_ref, image_id)
    }
}

/// Image record helper for tests.
pub fn image(id: &str, tags: &[&str], created: Option<i64>) -> ImageRecord {
    ImageRecord {
        id: id.into(),
        repo_tags: tags.iter().map(|t| t.to_string()).collect(),
        created,
        size: 0,
        labels: HashMap::new(),
    }
}
