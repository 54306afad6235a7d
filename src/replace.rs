//! Blue-green container replacement.
//!
//! The swap is a linear saga: stop old, rename old to a backup name, rename
//! new to the target name, start new, remove old. On a failure at step k the
//! driver runs the compensations of steps k-1..1 in reverse order, so once
//! compensation finishes exactly one of {old, new} serves under the target
//! name. Failure of the final removal is a warning, not a rollback: the new
//! container is already serving.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use thiserror::Error;

use crate::engine::ContainerEngine;
use crate::logging::LogScope;

/// One replacement, created and consumed within a single [`replace`] call.
#[derive(Debug, Clone)]
pub struct ReplaceRequest {
    pub old_id: String,
    /// Must already exist (created from the old container's recreate config
    /// with the new image), not be running, and not hold `target_name`.
    pub new_id: String,
    pub target_name: String,
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapStep {
    StopOld,
    RenameOldToBackup,
    RenameNewToTarget,
    StartNew,
    RemoveOld,
}

impl SwapStep {
    fn describe(self) -> &'static str {
        match self {
            SwapStep::StopOld => "stop old container",
            SwapStep::RenameOldToBackup => "rename old container to backup name",
            SwapStep::RenameNewToTarget => "rename new container to target name",
            SwapStep::StartNew => "start new container",
            SwapStep::RemoveOld => "remove old container",
        }
    }
}

const STEPS: [SwapStep; 5] = [
    SwapStep::StopOld,
    SwapStep::RenameOldToBackup,
    SwapStep::RenameNewToTarget,
    SwapStep::StartNew,
    SwapStep::RemoveOld,
];

#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Steps 1-4 failed; compensations ran and the old container serves
    /// again.
    #[error("replacing {target}: failed to {step}: {cause}")]
    RolledBack {
        target: String,
        step: &'static str,
        cause: anyhow::Error,
    },
    /// The swap succeeded but the backup-named old container could not be
    /// removed. Success-with-warning, never a rollback.
    #[error("replaced {target}, but removing the old container failed: {cause}")]
    Warning {
        target: String,
        cause: anyhow::Error,
    },
}

impl ReplaceError {
    pub fn is_warning(&self) -> bool {
        matches!(self, ReplaceError::Warning { .. })
    }
}

/// Swap `old_id` for `new_id` under `target_name`.
pub async fn replace(
    engine: &dyn ContainerEngine,
    scope: &LogScope,
    request: &ReplaceRequest,
) -> Result<(), ReplaceError> {
    let backup_name = backup_name(&request.target_name);
    let mut completed: Vec<SwapStep> = Vec::new();

    for step in STEPS {
        match apply(engine, request, &backup_name, step).await {
            Ok(()) => completed.push(step),
            Err(cause) if step == SwapStep::RemoveOld => {
                warn!(
                    "{} Swap of {} complete, old container {} left behind: {:#}",
                    scope, request.target_name, request.old_id, cause
                );
                return Err(ReplaceError::Warning {
                    target: request.target_name.clone(),
                    cause,
                });
            }
            Err(cause) => {
                warn!(
                    "{} Failed to {} for {}, rolling back: {:#}",
                    scope,
                    step.describe(),
                    request.target_name,
                    cause
                );
                for prior in completed.iter().rev() {
                    compensate(engine, scope, request, *prior).await;
                }
                return Err(ReplaceError::RolledBack {
                    target: request.target_name.clone(),
                    step: step.describe(),
                    cause,
                });
            }
        }
    }

    info!(
        "{} Replaced {}: {} now serves as {}",
        scope, request.old_id, request.new_id, request.target_name
    );
    Ok(())
}

async fn apply(
    engine: &dyn ContainerEngine,
    request: &ReplaceRequest,
    backup_name: &str,
    step: SwapStep,
) -> Result<()> {
    match step {
        SwapStep::StopOld => {
            engine
                .stop_container(&request.old_id, request.stop_timeout)
                .await
        }
        SwapStep::RenameOldToBackup => {
            engine.rename_container(&request.old_id, backup_name).await
        }
        SwapStep::RenameNewToTarget => {
            engine
                .rename_container(&request.new_id, &request.target_name)
                .await
        }
        SwapStep::StartNew => engine.start_container(&request.new_id).await,
        SwapStep::RemoveOld => engine.remove_container(&request.old_id).await,
    }
}

/// Best-effort undo of one completed step. Failures are logged and
/// swallowed; there is nothing further to fall back to.
async fn compensate(
    engine: &dyn ContainerEngine,
    scope: &LogScope,
    request: &ReplaceRequest,
    step: SwapStep,
) {
    let outcome = match step {
        SwapStep::StopOld => engine.start_container(&request.old_id).await,
        SwapStep::RenameOldToBackup => {
            engine
                .rename_container(&request.old_id, &request.target_name)
                .await
        }
        SwapStep::RenameNewToTarget => {
            // The new container is disposed of entirely; renaming it back
            // would leave an orphan holding a name.
            if let Err(e) = engine
                .stop_container(&request.new_id, request.stop_timeout)
                .await
            {
                warn!("{} Compensation stop of {} failed: {:#}", scope, request.new_id, e);
            }
            engine.remove_container(&request.new_id).await
        }
        // Never compensated: StartNew only rolls back via the steps before
        // it, and RemoveOld failure is a warning.
        SwapStep::StartNew | SwapStep::RemoveOld => Ok(()),
    };
    if let Err(e) = outcome {
        warn!(
            "{} Compensation for '{}' failed: {:#}",
            scope,
            step.describe(),
            e
        );
    }
}

/// Temporary name for the old container while the target name is handed
/// over.
fn backup_name(target: &str) -> String {
    format!("{}-old-{}", target, Utc::now().timestamp())
}
