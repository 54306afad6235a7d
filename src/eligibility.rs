//! Decides whether a running container may be touched by an update cycle.
//!
//! Purely a function of the container's labels and image reference plus the
//! configured allow/deny patterns. First matching rule wins: opt-out label,
//! then deny patterns, then the allow list.

use crate::config::Config;
use crate::types::{ContainerRecord, UpdateDecision};

/// Label value that opts a container out of updates.
const OPT_OUT_VALUE: &str = "false";

/// Match an image reference against a single pattern.
///
/// Supported forms: `*` (match-all), exact equality, trailing-`*` prefix
/// match and leading-`*` suffix match. Anything else (mid-string or
/// double-edged wildcards) falls through to a literal comparison.
pub fn pattern_matches(pattern: &str, reference: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        if !prefix.contains('*') {
            return reference.starts_with(prefix);
        }
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        if !suffix.contains('*') {
            return reference.ends_with(suffix);
        }
    }
    pattern == reference
}

/// Apply the configured rules to one container.
pub fn decide(container: &ContainerRecord, config: &Config) -> UpdateDecision {
    if let Some(value) = container.labels.get(&config.update_label) {
        if value == OPT_OUT_VALUE {
            return UpdateDecision::reject(format!(
                "label {}={} opts container out",
                config.update_label, OPT_OUT_VALUE
            ));
        }
    }

    let reference = container.image_ref.as_str();
    for pattern in &config.deny_images {
        if pattern_matches(pattern, reference) {
            return UpdateDecision::reject(format!(
                "image {} matches deny pattern {}",
                reference, pattern
            ));
        }
    }

    if !config.allow_images.is_empty() {
        let allowed = config
            .allow_images
            .iter()
            .any(|pattern| pattern_matches(pattern, reference));
        if !allowed {
            return UpdateDecision::reject(format!(
                "image {} matches no allow pattern",
                reference
            ));
        }
    }

    UpdateDecision::accept("eligible for update")
}
