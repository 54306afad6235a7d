//! Explicit logging context threaded through the engine.
//!
//! Every operation receives a [`LogScope`] value instead of mutating any
//! global state, so log content stays deterministic under test. The scope
//! renders as a bracketed prefix: `[cycle=ab12cd container=web]`.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of the random cycle-correlation id.
const CYCLE_ID_LEN: usize = 6;

#[derive(Debug, Clone, Default)]
pub struct LogScope {
    cycle_id: String,
    container: Option<String>,
    image: Option<String>,
}

impl LogScope {
    /// Scope for one cycle, carrying a short random correlation id.
    pub fn new_cycle() -> Self {
        let cycle_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CYCLE_ID_LEN)
            .map(char::from)
            .collect();
        Self {
            cycle_id: cycle_id.to_lowercase(),
            container: None,
            image: None,
        }
    }

    #[cfg(test)]
    pub fn fixed(cycle_id: &str) -> Self {
        Self {
            cycle_id: cycle_id.into(),
            container: None,
            image: None,
        }
    }

    #[cfg(test)]
    pub fn cycle_id(&self) -> &str {
        &self.cycle_id
    }

    /// Derived scope naming a container. Prefers the friendly name when one
    /// is present, falling back to the engine name.
    pub fn with_container(&self, name: &str, friendly: &str) -> Self {
        let shown = if friendly.is_empty() { name } else { friendly };
        Self {
            cycle_id: self.cycle_id.clone(),
            container: Some(shown.to_string()),
            image: self.image.clone(),
        }
    }

    pub fn with_image(&self, image: &str) -> Self {
        Self {
            cycle_id: self.cycle_id.clone(),
            container: self.container.clone(),
            image: Some(image.to_string()),
        }
    }
}

impl fmt::Display for LogScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[cycle={}", self.cycle_id)?;
        if let Some(container) = &self.container {
            write!(f, " container={}", container)?;
        }
        if let Some(image) = &self.image {
            write!(f, " image={}", image)?;
        }
        write!(f, "]")
    }
}
