//! Self-update hand-off.
//!
//! A process cannot remove or rename the container it runs inside of. When
//! the agent finds itself among the update candidates it spawns a short
//! lived helper container that performs the swap from outside, then asks
//! its caller to terminate the process so the helper sees the old container
//! stop. Once the original container is removed there is no rollback on
//! this path; helper-side failures are terminal and reported loudly.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use log::{error, info, warn};

use crate::engine::ContainerEngine;
use crate::logging::LogScope;
use crate::types::ContainerRecord;

/// How often the helper probes the old agent container for shutdown.
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How long the helper waits for the old agent container to stop.
const STOP_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Returned by [`trigger`] once the helper is running: the caller must now
/// terminate the process. Modeled as a value so the exit stays at the
/// process entry point and the coordinator remains testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandOff;

/// The process's own container identity signals, captured once at startup
/// and injectable for tests.
#[derive(Debug, Clone, Default)]
pub struct SelfIdentity {
    /// The engine conventionally sets a container's hostname to its own
    /// short id.
    pub hostname: String,
    /// Content of the process's cgroup membership file.
    pub cgroup: String,
}

impl SelfIdentity {
    pub fn capture() -> Self {
        Self {
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            cgroup: std::fs::read_to_string("/proc/self/cgroup").unwrap_or_default(),
        }
    }
}

/// Whether `candidate_id` is the container this process runs inside of.
///
/// The hostname signal is only evaluated when the hostname is non-empty: an
/// empty hostname would vacuously prefix-match every id. The cgroup signal
/// likewise requires a non-empty candidate id.
pub fn is_self(candidate_id: &str, identity: &SelfIdentity) -> bool {
    if !identity.hostname.is_empty() && candidate_id.starts_with(&identity.hostname) {
        return true;
    }
    !candidate_id.is_empty() && identity.cgroup.contains(candidate_id)
}

/// Spawn the helper container and request process termination.
///
/// The helper is cloned from the agent's own recreate config (inheriting
/// the engine-socket mount) but runs the new image with its command
/// overridden to updater mode. If the helper cannot be created or started
/// the agent keeps running and the error is returned.
pub async fn trigger(
    engine: &dyn ContainerEngine,
    scope: &LogScope,
    me: &ContainerRecord,
    new_image: &str,
) -> Result<HandOff> {
    let recreate = me
        .recreate
        .as_ref()
        .ok_or_else(|| anyhow!("self container record is shallow"))?;

    let helper_name = format!("harborbuddy-updater-{}", Utc::now().timestamp());
    let command = vec![
        "updater".to_string(),
        me.id.clone(),
        new_image.to_string(),
    ];

    let helper_id = engine
        .create_helper_container(&helper_name, new_image, recreate, command)
        .await
        .context("Creating self-update helper container")?;

    if let Err(e) = engine.start_container(&helper_id).await {
        if let Err(cleanup) = engine.remove_container(&helper_id).await {
            warn!(
                "{} Could not remove unstartable helper {}: {:#}",
                scope, helper_name, cleanup
            );
        }
        return Err(e).context("Starting self-update helper container");
    }

    info!(
        "{} Helper {} started for self-update to {}; requesting termination",
        scope, helper_name, new_image
    );
    Ok(HandOff)
}

/// Updater mode, executed inside the helper container.
///
/// Waits for the old agent container to stop, then recreates it with the
/// new image under its original name. There is no compensating rollback
/// here: past the removal of the target every failure is terminal.
pub async fn run_updater(
    engine: &dyn ContainerEngine,
    target_id: &str,
    new_image: &str,
) -> Result<()> {
    run_updater_with(
        engine,
        target_id,
        new_image,
        STOP_POLL_INTERVAL,
        STOP_WAIT_TIMEOUT,
    )
    .await
}

pub async fn run_updater_with(
    engine: &dyn ContainerEngine,
    target_id: &str,
    new_image: &str,
    poll: Duration,
    wait_limit: Duration,
) -> Result<()> {
    wait_until_stopped(engine, target_id, poll, wait_limit).await?;

    let target = engine
        .inspect(target_id)
        .await
        .context("Inspecting stopped update target")?;
    let recreate = target
        .recreate
        .clone()
        .ok_or_else(|| anyhow!("inspect returned a shallow record for {}", target_id))?;

    engine
        .remove_container(target_id)
        .await
        .context("Removing stopped update target")?;

    // Past this point the original container is gone. Any failure below
    // leaves the service down and must be surfaced, not masked.
    let staging_name = format!("{}-next-{}", target.name, Utc::now().timestamp());
    let new_id = match engine
        .create_container(&staging_name, new_image, &recreate)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            error!(
                "Self-update is unrecoverable: {} was removed but its replacement could not be created: {:#}",
                target.name, e
            );
            return Err(e).context("Creating replacement for removed update target");
        }
    };
    engine
        .rename_container(&new_id, &target.name)
        .await
        .context("Renaming replacement to the original name")?;
    engine
        .start_container(&new_id)
        .await
        .context("Starting replacement container")?;

    info!(
        "Self-update complete: {} now runs {} as {}",
        new_id, new_image, target.name
    );
    Ok(())
}

async fn wait_until_stopped(
    engine: &dyn ContainerEngine,
    target_id: &str,
    poll: Duration,
    wait_limit: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + wait_limit;
    loop {
        match engine.is_running(target_id).await {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            // A probe error is not "stopped"; keep polling within the bound.
            Err(e) => warn!("Probing update target {}: {:#}", target_id, e),
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "update target {} still running after {:?}",
                target_id,
                wait_limit
            );
        }
        tokio::time::sleep(poll).await;
    }
}
