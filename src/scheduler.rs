//! Drives update cycles forever, on a fixed interval or once per day at a
//! wall-clock time in an IANA timezone.
//!
//! The mode is fixed at startup; signals can only request shutdown or
//! toggle log verbosity, never change the mode. Cycle errors are logged and
//! the loop continues — only startup validation (bad timezone or schedule
//! string) is fatal, before any cycle runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::cleanup;
use crate::config::Config;
use crate::cycle::{self, Cancelled, CycleDisposition};
use crate::engine::ContainerEngine;
use crate::self_update::SelfIdentity;

/// Interval used when no cadence is configured.
const DEFAULT_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Run a single tick and exit.
    Once,
    /// Updates disabled: only the cleanup sweep runs, on the interval
    /// cadence.
    CleanupOnly(Duration),
    /// A tick every fixed interval, the first one immediately.
    IntervalLoop(Duration),
    /// A tick once per day at `time` in `tz`.
    DailyScheduleLoop { time: NaiveTime, tz: Tz },
}

impl Mode {
    pub fn from_config(config: &Config) -> Result<Self> {
        let interval =
            Duration::from_secs(config.check_interval.unwrap_or(DEFAULT_INTERVAL_SECS));
        if config.run_once {
            return Ok(Mode::Once);
        }
        if !config.enable_updates {
            if !config.enable_cleanup {
                anyhow::bail!("both updates and cleanup are disabled; nothing to schedule");
            }
            return Ok(Mode::CleanupOnly(interval));
        }
        if let Some(spec) = &config.schedule_time {
            let time = NaiveTime::parse_from_str(spec, "%H:%M")
                .with_context(|| format!("Parsing schedule_time {:?}", spec))?;
            let tz: Tz = config
                .timezone
                .parse()
                .map_err(|e| anyhow::anyhow!("Parsing timezone {:?}: {}", config.timezone, e))?;
            return Ok(Mode::DailyScheduleLoop { time, tz });
        }
        Ok(Mode::IntervalLoop(interval))
    }
}

/// Why the scheduler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    /// Shutdown was requested via the cancellation token.
    Cancelled,
    /// A once-mode run completed.
    Finished,
    /// A self-update helper took over; the process must exit now.
    SelfUpdateHandOff,
}

enum Tick {
    Continue,
    HandOff,
}

pub async fn run(
    token: &CancellationToken,
    config: &Config,
    engine: Arc<dyn ContainerEngine>,
    identity: &SelfIdentity,
) -> Result<SchedulerExit> {
    let mode = Mode::from_config(config)?;
    info!("Scheduler mode: {:?}", mode);

    match mode {
        Mode::Once => match tick(token, config, &engine, identity, true).await {
            Tick::HandOff => Ok(SchedulerExit::SelfUpdateHandOff),
            Tick::Continue => Ok(SchedulerExit::Finished),
        },
        Mode::CleanupOnly(interval) => {
            interval_loop(token, config, &engine, identity, interval, false).await
        }
        Mode::IntervalLoop(interval) => {
            interval_loop(token, config, &engine, identity, interval, true).await
        }
        Mode::DailyScheduleLoop { time, tz } => {
            daily_loop(token, config, &engine, identity, time, tz).await
        }
    }
}

async fn interval_loop(
    token: &CancellationToken,
    config: &Config,
    engine: &Arc<dyn ContainerEngine>,
    identity: &SelfIdentity,
    interval: Duration,
    updates: bool,
) -> Result<SchedulerExit> {
    let mut timer = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(SchedulerExit::Cancelled),
            _ = timer.tick() => {}
        }
        if let Tick::HandOff = tick(token, config, engine, identity, updates).await {
            return Ok(SchedulerExit::SelfUpdateHandOff);
        }
    }
}

async fn daily_loop(
    token: &CancellationToken,
    config: &Config,
    engine: &Arc<dyn ContainerEngine>,
    identity: &SelfIdentity,
    time: NaiveTime,
    tz: Tz,
) -> Result<SchedulerExit> {
    loop {
        if token.is_cancelled() {
            return Ok(SchedulerExit::Cancelled);
        }
        let now = Utc::now().with_timezone(&tz);
        let next = next_run(now, time, tz);
        let wait = (next - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        info!("Next scheduled run at {}", next);
        tokio::select! {
            _ = token.cancelled() => return Ok(SchedulerExit::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
        if let Tick::HandOff = tick(token, config, engine, identity, true).await {
            return Ok(SchedulerExit::SelfUpdateHandOff);
        }
    }
}

/// One scheduler tick: an update cycle (unless updates are disabled for
/// this mode) followed by the cleanup sweep when enabled. Cycle errors are
/// logged, never propagated.
async fn tick(
    token: &CancellationToken,
    config: &Config,
    engine: &Arc<dyn ContainerEngine>,
    identity: &SelfIdentity,
    updates: bool,
) -> Tick {
    if updates && config.enable_updates {
        match cycle::run_cycle(token, config, Arc::clone(engine), identity).await {
            Ok(report) if report.disposition == CycleDisposition::SelfUpdateHandOff => {
                return Tick::HandOff;
            }
            Ok(_) => {}
            Err(e) if e.is::<Cancelled>() => info!("Update cycle cancelled"),
            Err(e) => error!("Update cycle failed: {:#}", e),
        }
    }
    if config.enable_cleanup && !token.is_cancelled() {
        if let Err(e) = cleanup::run_cleanup(engine.as_ref(), config).await {
            error!("Image cleanup failed: {:#}", e);
        }
    }
    Tick::Continue
}

/// Next occurrence of `time` in `tz` strictly after `now`. If the
/// wall-clock time today is not after `now`, the target is tomorrow.
pub fn next_run(now: DateTime<Tz>, time: NaiveTime, tz: Tz) -> DateTime<Tz> {
    let today = now.date_naive();
    let candidate = resolve_local(today, time, tz);
    if candidate > now {
        candidate
    } else {
        resolve_local(
            today.checked_add_days(Days::new(1)).unwrap_or(today),
            time,
            tz,
        )
    }
}

/// Construct a wall-clock instant with an explicit DST policy: an
/// ambiguous local time (fall-back) resolves to the earlier of the two
/// valid instants; a skipped local time (spring-forward) shifts forward
/// minute-by-minute to the first local time that exists.
fn resolve_local(date: NaiveDate, time: NaiveTime, tz: Tz) -> DateTime<Tz> {
    let mut naive = date.and_time(time);
    loop {
        match tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => return dt,
            LocalResult::Ambiguous(earlier, _) => return earlier,
            LocalResult::None => naive += chrono::Duration::minutes(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Offset;

    use super::*;
    use crate::test_support::MockEngine;

    fn new_york() -> Tz {
        "America/New_York".parse().unwrap()
    }

    fn at(tz: Tz, y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        tz.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn hhmm(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M").unwrap()
    }

    #[test]
    fn later_today_stays_today() {
        let tz = new_york();
        let now = at(tz, 2024, 6, 1, 10, 0);
        let next = next_run(now, hhmm("15:30"), tz);
        assert_eq!(next, at(tz, 2024, 6, 1, 15, 30));
    }

    #[test]
    fn passed_time_moves_to_tomorrow() {
        let tz = new_york();
        let now = at(tz, 2024, 6, 1, 10, 0);
        let next = next_run(now, hhmm("09:00"), tz);
        assert_eq!(next, at(tz, 2024, 6, 2, 9, 0));
    }

    #[test]
    fn exact_now_moves_to_tomorrow() {
        let tz = new_york();
        let now = at(tz, 2024, 6, 1, 9, 0);
        let next = next_run(now, hhmm("09:00"), tz);
        assert_eq!(next, at(tz, 2024, 6, 2, 9, 0));
        assert!(next > now);
    }

    #[test]
    fn year_rollover() {
        let tz = new_york();
        let now = at(tz, 2024, 12, 31, 23, 0);
        let next = next_run(now, hhmm("10:00"), tz);
        assert_eq!(next, at(tz, 2025, 1, 1, 10, 0));
    }

    #[test]
    fn leap_day() {
        let tz = new_york();
        let now = at(tz, 2024, 2, 28, 23, 0);
        let next = next_run(now, hhmm("12:00"), tz);
        assert_eq!(next, at(tz, 2024, 2, 29, 12, 0));
    }

    #[test]
    fn spring_forward_shifts_to_first_valid_instant() {
        // 2024-03-10 in New York: 02:00 EST jumps to 03:00 EDT, so 02:30
        // does not exist and resolves forward to 03:00.
        let tz = new_york();
        let now = at(tz, 2024, 3, 10, 1, 0);
        let next = next_run(now, hhmm("02:30"), tz);
        assert_eq!(next, at(tz, 2024, 3, 10, 3, 0));
    }

    #[test]
    fn fall_back_resolves_to_earlier_offset() {
        // 2024-11-03 in New York: 01:30 happens twice. Policy picks the
        // first pass (EDT, UTC-4).
        let tz = new_york();
        let now = at(tz, 2024, 11, 3, 0, 0);
        let next = next_run(now, hhmm("01:30"), tz);
        assert_eq!(next.offset().fix().local_minus_utc(), -4 * 3600);
        assert!(next > now);
    }

    #[test]
    fn next_run_is_always_strictly_after_now() {
        // Lord Howe ends DST on 2024-04-07 with a 30-minute fall-back;
        // 03:00 that day is unambiguous while 01:45 is not.
        let tz: Tz = "Australia/Lord_Howe".parse().unwrap();
        let now = at(tz, 2024, 4, 7, 3, 0);
        for spec in ["00:00", "01:45", "02:00", "23:59"] {
            let next = next_run(now, hhmm(spec), tz);
            assert!(next > now, "{} produced {}", spec, next);
        }
    }

    #[test]
    fn mode_selection_follows_config() {
        let cfg = Config::default();
        assert_eq!(
            Mode::from_config(&cfg).unwrap(),
            Mode::IntervalLoop(Duration::from_secs(300))
        );

        let cfg = Config {
            run_once: true,
            ..Config::default()
        };
        assert_eq!(Mode::from_config(&cfg).unwrap(), Mode::Once);

        let cfg = Config {
            enable_updates: false,
            enable_cleanup: true,
            check_interval: Some(60),
            ..Config::default()
        };
        assert_eq!(
            Mode::from_config(&cfg).unwrap(),
            Mode::CleanupOnly(Duration::from_secs(60))
        );

        let cfg = Config {
            schedule_time: Some("04:00".into()),
            timezone: "Europe/Oslo".into(),
            ..Config::default()
        };
        match Mode::from_config(&cfg).unwrap() {
            Mode::DailyScheduleLoop { time, tz } => {
                assert_eq!(time, hhmm("04:00"));
                assert_eq!(tz, "Europe/Oslo".parse::<Tz>().unwrap());
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn nothing_enabled_is_a_startup_error() {
        let cfg = Config {
            enable_updates: false,
            enable_cleanup: false,
            ..Config::default()
        };
        assert!(Mode::from_config(&cfg).is_err());
    }

    #[test]
    fn bad_timezone_is_fatal_before_any_cycle() {
        let cfg = Config {
            schedule_time: Some("04:00".into()),
            timezone: "Atlantis/Lost".into(),
            ..Config::default()
        };
        assert!(Mode::from_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn once_mode_runs_a_single_cycle() {
        let engine = Arc::new(MockEngine::new());
        let config = Config {
            run_once: true,
            ..Config::default()
        };
        let token = CancellationToken::new();
        let identity = SelfIdentity::default();

        let exit = run(&token, &config, Arc::clone(&engine) as _, &identity)
            .await
            .expect("scheduler");
        assert_eq!(exit, SchedulerExit::Finished);
        assert_eq!(engine.calls(), vec!["list"]);
    }

    #[tokio::test]
    async fn cleanup_only_mode_never_lists_containers() {
        let engine = Arc::new(MockEngine::new());
        let config = Config {
            run_once: true,
            enable_updates: false,
            enable_cleanup: true,
            ..Config::default()
        };
        let token = CancellationToken::new();
        let identity = SelfIdentity::default();

        let exit = run(&token, &config, Arc::clone(&engine) as _, &identity)
            .await
            .expect("scheduler");
        assert_eq!(exit, SchedulerExit::Finished);
        assert_eq!(engine.calls(), vec!["list_dangling"]);
    }

    #[tokio::test]
    async fn interval_loop_stops_on_cancellation() {
        let engine = Arc::new(MockEngine::new());
        let config = Config {
            check_interval: Some(1),
            ..Config::default()
        };
        let token = CancellationToken::new();

        let handle = {
            let token = token.clone();
            let engine = Arc::clone(&engine) as Arc<dyn ContainerEngine>;
            let config = config.clone();
            tokio::spawn(async move {
                run(&token, &config, engine, &SelfIdentity::default()).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let exit = handle.await.unwrap().expect("scheduler");
        assert_eq!(exit, SchedulerExit::Cancelled);
        // The first tick fires immediately.
        assert!(engine.calls().iter().any(|c| c == "list"));
    }
}
