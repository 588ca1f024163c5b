//! Watches a product list and reacts to changes until the run time elapses or Ctrl-C.
//!
//! Configuration comes from the environment (or a `.env` file):
//! `MONITOR_URL`, `MONITOR_RUN_SECS`, `POLL_BASE_INTERVAL_SECS`, `POLL_MAX_INTERVAL_SECS`,
//! `POLL_MAX_PER_SECOND` and `POLL_REQUEST_TIMEOUT_SECS`.
use adaptive_poller::adaptive_polling::{
    PollerSettings,
    dispatcher::{Event, EventKind},
    engine::PollEngine,
};

use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

const ENV_MONITOR_URL: &str = "MONITOR_URL";
const ENV_MONITOR_RUN_SECS: &str = "MONITOR_RUN_SECS";
const ENV_BASE_INTERVAL_SECS: &str = "POLL_BASE_INTERVAL_SECS";
const ENV_MAX_INTERVAL_SECS: &str = "POLL_MAX_INTERVAL_SECS";
const ENV_MAX_PER_SECOND: &str = "POLL_MAX_PER_SECOND";
const ENV_REQUEST_TIMEOUT_SECS: &str = "POLL_REQUEST_TIMEOUT_SECS";

const DEFAULT_URL: &str = "https://jsonplaceholder.typicode.com/posts";
const DEFAULT_RUN_SECS: u64 = 30;

/// The product whose stock the alert handler watches.
const WATCHED_OWNER_ID: i64 = 1;

/// Parses an optional env var, warning about values that do not parse.
fn parse_env_var<T: FromStr>(var_name: &str) -> Option<T>
where
    <T as FromStr>::Err: std::fmt::Debug,
{
    let val_str = env::var(var_name).ok()?;
    match val_str.parse::<T>() {
        Ok(val) => Some(val),
        Err(e) => {
            warn!(
                "Failed to parse env var '{}' (value: '{}'). Error: {:?}. Using the default.",
                var_name, val_str, e
            );
            None
        }
    }
}

fn get_env_var<T: FromStr>(var_name: &str, default_value: T) -> T
where
    <T as FromStr>::Err: std::fmt::Debug,
{
    parse_env_var(var_name).unwrap_or(default_value)
}

fn show_products(event: &Event) -> Result<(), adaptive_poller::Error> {
    let count = event
        .payload()
        .and_then(|payload| payload.as_array())
        .map_or(0, Vec::len);
    println!("[UI] Showing {count} updated products.");
    Ok(())
}

fn stock_alert(event: &Event) -> Result<(), adaptive_poller::Error> {
    let products = event
        .payload()
        .and_then(|payload| payload.as_array())
        .ok_or("payload is not a product list")?;
    let critical = products
        .iter()
        .take(1)
        .any(|item| item.get("userId").and_then(|id| id.as_i64()) == Some(WATCHED_OWNER_ID));
    if critical {
        println!("[ALERT] Check inventory of the first product: stock is critical.");
    }
    Ok(())
}

fn log_failure(event: &Event) -> Result<(), adaptive_poller::Error> {
    println!("[LOG] Event recorded: {event}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let default_log_filter = "info,adaptive_poller=info";
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| default_log_filter.to_string()))
        .init();

    if dotenvy::dotenv().is_ok() {
        info!(".env file loaded successfully.");
    } else {
        info!("No .env file found. Proceeding with environment variables or defaults.");
    }

    let defaults = PollerSettings::default();
    let settings = PollerSettings::builder()
        .base_interval_secs(get_env_var(
            ENV_BASE_INTERVAL_SECS,
            defaults.base_interval_secs(),
        ))
        .max_interval_secs(get_env_var(
            ENV_MAX_INTERVAL_SECS,
            defaults.max_interval_secs(),
        ))
        .maybe_max_per_second(parse_env_var(ENV_MAX_PER_SECOND))
        .request_timeout_secs(get_env_var(
            ENV_REQUEST_TIMEOUT_SECS,
            defaults.request_timeout_secs(),
        ))
        .build();
    let url = env::var(ENV_MONITOR_URL).unwrap_or_else(|_| DEFAULT_URL.to_string());
    let run_for = Duration::from_secs(get_env_var(ENV_MONITOR_RUN_SECS, DEFAULT_RUN_SECS));

    info!(target: "config_final", ?settings, %url, "Monitor configuration loaded.");

    let monitor = PollEngine::reqwest(url, settings)?;
    monitor.subscribe(EventKind::DataUpdated, show_products);
    monitor.subscribe(EventKind::DataUpdated, stock_alert);
    for kind in EventKind::ALL.into_iter().filter(EventKind::is_error) {
        monitor.subscribe(kind, log_failure);
    }

    monitor.start();
    tokio::select! {
        _ = tokio::time::sleep(run_for) => info!("Run time elapsed."),
        _ = tokio::signal::ctrl_c() => info!("Interrupted."),
    }

    monitor.stop().await?;
    let status = monitor.status();
    info!(
        cycles = status.cycles,
        last_interval_secs = status.current_interval.as_secs_f64(),
        "Monitor stopped cleanly."
    );
    Ok(())
}
