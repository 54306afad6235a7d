//! Dangling-image sweep.
//!
//! Reclaims disk from images orphaned by updates: anything with no
//! repository tags and older than the configured minimum age is removed.
//! Per-image removal failures are logged and the sweep continues.

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};

use crate::config::Config;
use crate::engine::ContainerEngine;

pub async fn run_cleanup(engine: &dyn ContainerEngine, config: &Config) -> Result<()> {
    let images = engine
        .list_dangling_images()
        .await
        .context("Listing dangling images")?;

    let cutoff = Utc::now().timestamp() - (config.cleanup_min_age as i64) * 3600;
    let mut removed = 0usize;
    let mut kept = 0usize;
    for image in images {
        if !image.is_dangling() {
            kept += 1;
            continue;
        }
        // Unknown creation time: keep, the sweep errs towards caution.
        let old_enough = matches!(image.created, Some(created) if created <= cutoff);
        if !old_enough {
            debug!("Keeping dangling image {} (too young or undated)", image.id);
            kept += 1;
            continue;
        }
        match engine.remove_image(&image.id).await {
            Ok(()) => {
                let shown = crate::types::friendly_name(&image.labels);
                if shown.is_empty() {
                    info!("Removed dangling image {} ({} bytes)", image.id, image.size);
                } else {
                    info!(
                        "Removed dangling image {} ({}, {} bytes)",
                        image.id, shown, image.size
                    );
                }
                removed += 1;
            }
            Err(e) => {
                warn!("Could not remove image {}: {:#}", image.id, e);
                kept += 1;
            }
        }
    }

    info!("Cleanup finished: removed={} kept={}", removed, kept);
    Ok(())
}
