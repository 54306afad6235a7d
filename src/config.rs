use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Label a container sets to `"false"` to opt out of updates.
pub const DEFAULT_UPDATE_LABEL: &str = "com.harborbuddy.autoupdate";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub enable_updates: bool,
    pub enable_cleanup: bool,
    /// Run a single cycle and exit instead of looping.
    pub run_once: bool,
    /// Seconds between cycles. Mutually exclusive with `schedule_time`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_interval: Option<u64>,
    /// Daily wall-clock time ("HH:MM") to run a cycle at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_time: Option<String>,
    /// IANA zone name the schedule time is interpreted in.
    pub timezone: String,
    pub dry_run: bool,
    /// Image-reference patterns a container must match to be updated.
    /// Empty means everything is allowed.
    pub allow_images: Vec<String>,
    /// Image-reference patterns that are never updated. Deny beats allow.
    pub deny_images: Vec<String>,
    /// Name of the per-container opt-out label.
    pub update_label: String,
    /// Seconds to wait for a graceful container stop.
    pub stop_timeout: u64,
    /// Minimum age in hours before a dangling image is removed.
    pub cleanup_min_age: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_updates: true,
            enable_cleanup: false,
            run_once: false,
            check_interval: None,
            schedule_time: None,
            timezone: "UTC".into(),
            dry_run: false,
            allow_images: Vec::new(),
            deny_images: Vec::new(),
            update_label: DEFAULT_UPDATE_LABEL.into(),
            stop_timeout: 30,
            cleanup_min_age: 72,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("harborbuddy.toml"))
            .merge(Json::file("harborbuddy.json"))
            .merge(Env::prefixed("HARBORBUDDY_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Startup-time checks. Anything rejected here is fatal before the first
    /// cycle runs.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.check_interval.is_some() && self.schedule_time.is_some() {
            anyhow::bail!("check_interval and schedule_time are mutually exclusive");
        }
        if self.check_interval == Some(0) {
            anyhow::bail!("check_interval must be at least one second");
        }
        if let Some(spec) = &self.schedule_time {
            chrono::NaiveTime::parse_from_str(spec, "%H:%M")
                .map_err(|e| anyhow::anyhow!("Invalid schedule_time {:?}: {}", spec, e))?;
        }
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("Invalid timezone {:?}: {}", self.timezone, e))?;
        Ok(())
    }
}
