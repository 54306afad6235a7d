//! One full update pass: discover, check, apply.
//!
//! Phase 1 is read-only and runs staleness checks in bounded parallel;
//! workers send their outcomes over a channel to a single collector so no
//! shared candidate list exists. Phase 2 mutates the engine and is strictly
//! sequential: never more than one swap in flight, which bounds engine load
//! and keeps rollback reasoning tractable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::eligibility;
use crate::engine::ContainerEngine;
use crate::logging::LogScope;
use crate::pull_cache::{PullCache, PullError};
use crate::replace::{self, ReplaceRequest};
use crate::self_update::{self, SelfIdentity};
use crate::types::ContainerRecord;

/// Maximum concurrent staleness checks in Phase 1.
const CHECK_CONCURRENCY: usize = 5;

/// Marker for cooperative cancellation, distinct from operational failures.
#[derive(Debug, Error)]
#[error("update cycle cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDisposition {
    Completed,
    /// A self-update helper was started; the process must terminate so the
    /// helper can take over.
    SelfUpdateHandOff,
}

/// Side-effect counters for one cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub total: usize,
    pub fresh: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub disposition: CycleDisposition,
}

impl CycleReport {
    fn new(total: usize) -> Self {
        Self {
            total,
            fresh: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            disposition: CycleDisposition::Completed,
        }
    }
}

/// An eligible container whose pulled image id differs from its running
/// image id, paired with its logging context.
struct UpdateCandidate {
    container: ContainerRecord,
    scope: LogScope,
}

enum CheckOutcome {
    Stale(UpdateCandidate),
    Fresh,
    Failed,
    Cancelled,
}

/// Run one discovery → check → apply pass.
pub async fn run_cycle(
    token: &CancellationToken,
    config: &Config,
    engine: Arc<dyn ContainerEngine>,
    identity: &SelfIdentity,
) -> Result<CycleReport> {
    let scope = LogScope::new_cycle();
    info!(
        "{} Starting update cycle (dry_run={})",
        scope, config.dry_run
    );

    // Discovery failure is fatal to the cycle; everything later is not.
    let containers = engine
        .list_running()
        .await
        .context("Discovering running containers")?;
    let mut report = CycleReport::new(containers.len());

    let candidates = check_phase(token, config, &engine, &scope, containers, &mut report).await?;

    if config.dry_run {
        info!(
            "{} Dry run: cycle stops before any mutation ({} containers seen)",
            scope, report.total
        );
        return Ok(report);
    }

    apply_phase(token, config, &engine, identity, candidates, &mut report).await?;

    info!(
        "{} Cycle finished: total={} fresh={} updated={} skipped={} failed={}",
        scope, report.total, report.fresh, report.updated, report.skipped, report.failed
    );
    Ok(report)
}

/// Phase 1: eligibility plus bounded-parallel staleness checks. Returns the
/// candidates in collector-arrival order, which is non-deterministic across
/// runs.
async fn check_phase(
    token: &CancellationToken,
    config: &Config,
    engine: &Arc<dyn ContainerEngine>,
    scope: &LogScope,
    containers: Vec<ContainerRecord>,
    report: &mut CycleReport,
) -> Result<Vec<UpdateCandidate>> {
    let cache = Arc::new(PullCache::new());
    let limiter = Arc::new(Semaphore::new(CHECK_CONCURRENCY));
    let (outcome_tx, mut outcome_rx) = mpsc::channel(containers.len().max(1));

    for container in containers {
        if token.is_cancelled() {
            return Err(Cancelled.into());
        }

        let decision = eligibility::decide(&container, config);
        if !decision.eligible {
            debug!("{} Skipping {}: {}", scope, container.name, decision.reason);
            report.skipped += 1;
            continue;
        }
        if config.dry_run {
            // No pull is issued, so staleness stays undetermined.
            info!(
                "{} Dry run: would check {} ({}) for updates",
                scope, container.name, container.image_ref
            );
            report.skipped += 1;
            continue;
        }

        let engine = Arc::clone(engine);
        let cache = Arc::clone(&cache);
        let limiter = Arc::clone(&limiter);
        let token = token.clone();
        let tx = outcome_tx.clone();
        let container_scope = scope
            .with_container(&container.name, container.friendly_name())
            .with_image(&container.image_ref);
        tokio::spawn(async move {
            let Ok(_permit) = limiter.acquire_owned().await else {
                return;
            };
            let outcome = check_container(&token, &engine, &cache, &container_scope, container).await;
            let _ = tx.send(outcome).await;
        });
    }
    drop(outcome_tx);

    let mut candidates = Vec::new();
    while let Some(outcome) = outcome_rx.recv().await {
        match outcome {
            CheckOutcome::Stale(candidate) => candidates.push(candidate),
            CheckOutcome::Fresh => report.fresh += 1,
            CheckOutcome::Failed => report.failed += 1,
            CheckOutcome::Cancelled => {}
        }
    }

    if token.is_cancelled() {
        return Err(Cancelled.into());
    }
    Ok(candidates)
}

async fn check_container(
    token: &CancellationToken,
    engine: &Arc<dyn ContainerEngine>,
    cache: &PullCache,
    scope: &LogScope,
    container: ContainerRecord,
) -> CheckOutcome {
    if token.is_cancelled() {
        return CheckOutcome::Cancelled;
    }

    let reference = container.image_ref.clone();
    let (pulled, cached) = cache
        .get_or_fetch(token, &reference, || engine.pull_image(&reference))
        .await;
    match pulled {
        Ok(image) if image.id != container.image_id => {
            info!(
                "{} New image available: {} -> {}",
                scope, container.image_id, image.id
            );
            CheckOutcome::Stale(UpdateCandidate {
                container,
                scope: scope.clone(),
            })
        }
        Ok(_) => {
            debug!("{} Image up to date (cached pull: {})", scope, cached);
            CheckOutcome::Fresh
        }
        Err(PullError::Cancelled) => CheckOutcome::Cancelled,
        Err(e) => {
            warn!("{} Staleness check failed: {}", scope, e);
            CheckOutcome::Failed
        }
    }
}

/// Phase 2: apply replacements one at a time, diverting the agent's own
/// container to the self-update path.
async fn apply_phase(
    token: &CancellationToken,
    config: &Config,
    engine: &Arc<dyn ContainerEngine>,
    identity: &SelfIdentity,
    candidates: Vec<UpdateCandidate>,
    report: &mut CycleReport,
) -> Result<()> {
    let pending = candidates.len();
    for (index, candidate) in candidates.into_iter().enumerate() {
        if token.is_cancelled() {
            return Err(Cancelled.into());
        }
        let scope = &candidate.scope;

        // Discovery returns shallow records to keep listing cheap; the
        // replacement must run on a full one.
        let full = match engine.inspect(&candidate.container.id).await {
            Ok(full) => full,
            Err(e) => {
                warn!("{} Inspect failed; skipping: {:#}", scope, e);
                report.failed += 1;
                continue;
            }
        };
        let Some(recreate) = full.recreate.clone() else {
            warn!("{} Inspect returned no recreate config; skipping", scope);
            report.failed += 1;
            continue;
        };

        if self_update::is_self(&full.id, identity) {
            match self_update::trigger(engine.as_ref(), scope, &full, &full.image_ref).await {
                Ok(_) => {
                    // Remaining candidates are abandoned; the updated agent
                    // picks them up on its next cycle.
                    report.skipped += pending - index - 1;
                    report.updated += 1;
                    report.disposition = CycleDisposition::SelfUpdateHandOff;
                    return Ok(());
                }
                Err(e) => {
                    error!("{} Self-update trigger failed: {:#}", scope, e);
                    report.failed += 1;
                    continue;
                }
            }
        }

        let staging_name = format!("{}-fresh-{}", full.name, Utc::now().timestamp_millis());
        let new_id = match engine
            .create_container(&staging_name, &full.image_ref, &recreate)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!("{} Creating replacement failed; skipping: {:#}", scope, e);
                report.failed += 1;
                continue;
            }
        };

        let request = ReplaceRequest {
            old_id: full.id.clone(),
            new_id,
            target_name: full.name.clone(),
            stop_timeout: Duration::from_secs(config.stop_timeout),
        };
        match replace::replace(engine.as_ref(), scope, &request).await {
            Ok(()) => report.updated += 1,
            Err(e) if e.is_warning() => {
                warn!("{} {}", scope, e);
                report.updated += 1;
            }
            Err(e) => {
                error!("{} {}", scope, e);
                report.failed += 1;
            }
        }
    }
    Ok(())
}
