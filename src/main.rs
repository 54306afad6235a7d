//! HarborBuddy daemon entry point.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, LevelFilter};
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

mod cleanup;
mod config;
mod cycle;
mod eligibility;
mod engine;
mod logging;
mod pull_cache;
mod replace;
mod scheduler;
mod self_update;
#[cfg(test)]
mod test_support;
mod types;

use config::Config;
use engine::{ContainerEngine, DockerEngine};
use scheduler::SchedulerExit;
use self_update::SelfIdentity;

#[tokio::main]
async fn main() -> ExitCode {
    // The logger itself passes everything up to debug; the global max level
    // gates what is emitted so SIGUSR1 can widen it at runtime.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    log::set_max_level(LevelFilter::Info);

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        None => run_agent().await,
        Some("updater") => run_updater_mode(&args[2..]).await,
        Some("help" | "--help" | "-h") => {
            print_usage(&args[0]);
            ExitCode::SUCCESS
        }
        Some(other) => {
            eprintln!("unknown command: {}", other);
            print_usage(&args[0]);
            ExitCode::from(2)
        }
    }
}

async fn run_agent() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Starting HarborBuddy with config: {:?}", config);

    let engine: Arc<dyn ContainerEngine> = match DockerEngine::connect() {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("Engine connection failed: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let identity = SelfIdentity::capture();
    let token = CancellationToken::new();
    spawn_signal_handlers(token.clone());

    match scheduler::run(&token, &config, engine, &identity).await {
        Ok(SchedulerExit::SelfUpdateHandOff) => {
            // The helper is waiting for this container to stop; exiting now
            // frees our name for the replacement.
            info!("Self-update helper is running, terminating to hand over");
            ExitCode::SUCCESS
        }
        Ok(_) => {
            info!("Shutdown complete.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Scheduler failed to start: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Updater mode, invoked inside the short-lived helper container with the
/// old agent's container id and the new image reference.
async fn run_updater_mode(args: &[String]) -> ExitCode {
    let (Some(target_id), Some(new_image)) = (args.first(), args.get(1)) else {
        eprintln!("updater requires <container-id> <image>");
        return ExitCode::from(2);
    };
    info!("Updater mode: replacing {} with {}", target_id, new_image);

    let engine = match DockerEngine::connect() {
        Ok(engine) => engine,
        Err(e) => {
            error!("Engine connection failed: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    match self_update::run_updater(&engine, target_id, new_image).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Self-update failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    // Shutdown: Ctrl+C or SIGTERM cancel the token; the scheduler and any
    // in-flight cycle notice at their next check point.
    tokio::spawn(async move {
        let mut term = match signal::unix::signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("Unable to listen for SIGTERM: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
            _ = term.recv() => info!("Received SIGTERM, shutting down..."),
        }
        token.cancel();
    });

    // SIGUSR1 toggles verbosity. Signals never change the scheduler mode.
    tokio::spawn(async {
        let mut usr1 = match signal::unix::signal(SignalKind::user_defined1()) {
            Ok(usr1) => usr1,
            Err(e) => {
                error!("Unable to listen for SIGUSR1: {}", e);
                return;
            }
        };
        let mut debug = false;
        while usr1.recv().await.is_some() {
            debug = !debug;
            let level = if debug {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            };
            log::set_max_level(level);
            info!("Log level switched to {}", level);
        }
    });
}

fn print_usage(exe: &str) {
    eprintln!("Usage: {} [command]", exe);
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  (none)                     Run the update agent");
    eprintln!("  updater <id> <image>       Internal: finish a self-update from a helper container");
    eprintln!("  help                       Show this message");
}
