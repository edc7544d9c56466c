mod db;
mod device;
mod device_sync;
mod relay;
mod scheduler;
mod sensor;
mod sensor_loop;
mod settings;
mod shutdown;

#[cfg(feature = "bme280")]
mod bme280;

#[cfg(not(any(feature = "sim", feature = "bme280")))]
compile_error!("enable the `sim` or `bme280` feature to select an environment sensor");

use anyhow::{bail, Context, Result};
use std::future::Future;
use std::{env, sync::Arc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use relay::{parse_relay_pins, RelayBoard};
use settings::SettingsStore;
use shutdown::{termination_signal, Shutdown};

const DEFAULT_DB_URL: &str = "sqlite:vivarium_ctrl.db";
const DEFAULT_SETTINGS_PATH: &str = "settings.json";
const DEFAULT_LOG_FILTER: &str = "vivarium_ctrl=info";

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env_or("DB_URL", DEFAULT_DB_URL);
    let settings_path = env_or("SETTINGS_PATH", DEFAULT_SETTINGS_PATH);
    let relay_pins = parse_relay_pins(&env::var("RELAY_PINS").unwrap_or_default())?;
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = match env::var("RELAY_ACTIVE_LOW") {
        Ok(v) => parse_flag("RELAY_ACTIVE_LOW", &v)?,
        Err(_) => true,
    };

    // ── Settings ────────────────────────────────────────────────────
    let settings = Arc::new(SettingsStore::load(&settings_path)?);

    // ── State store ─────────────────────────────────────────────────
    {
        let db = Db::connect(&db_url).await?;
        db.migrate().await?;
        db.init_runtime_state(std::process::id()).await?;
        info!(db = %db_url, pid = std::process::id(), "state store ready");
    }

    // ── Hardware ────────────────────────────────────────────────────
    let relays = RelayBoard::new(&relay_pins, active_low)?;
    let sensor = open_sensor()?;

    // ── Shutdown on SIGTERM / SIGINT ────────────────────────────────
    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                received = termination_signal() => match received {
                    Ok(signal) => info!(signal, "termination signal received, shutting down"),
                    Err(e) => error!("failed to listen for termination signals: {e}"),
                },
                () = shutdown.wait() => return,
            }
            shutdown.request_shutdown();
        });
    }

    // ── Control loops (one store handle each) ───────────────────────
    // Every handle is opened before any loop starts so a connect failure
    // cannot cancel a running device sync loop before its power-down.
    let sensor_db = Db::connect(&db_url).await?;
    let sync_db = Db::connect(&db_url).await?;
    let scheduler_db = Db::connect(&db_url).await?;

    let mut loops: JoinSet<LoopOutcome> = JoinSet::new();
    loops.spawn(named(
        "sensor loop",
        sensor_loop::run(sensor_db, sensor, Arc::clone(&settings), shutdown.clone()),
    ));

    let sync_settings = Arc::clone(&settings);
    let sync_shutdown = shutdown.clone();
    loops.spawn(named("device sync loop", async move {
        let mut relays = relays;
        device_sync::run(sync_db, &mut relays, sync_settings, sync_shutdown).await
    }));

    loops.spawn(named(
        "scheduler",
        scheduler::run(scheduler_db, Arc::clone(&settings), shutdown.clone()),
    ));

    info!("controller running");

    supervise(loops, &shutdown).await?;
    info!("shutdown complete");
    Ok(())
}

type LoopOutcome = (&'static str, Result<()>);

/// Wait for every loop to return. Any loop failing takes the whole
/// controller down so no loop keeps acting on state the others have stopped
/// maintaining.
async fn supervise(mut loops: JoinSet<LoopOutcome>, shutdown: &Shutdown) -> Result<()> {
    let mut failed = false;
    while let Some(joined) = loops.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((name, Err(e))) => {
                error!(control_loop = name, "control loop failed: {e:#}");
                failed = true;
                if shutdown.request_shutdown() {
                    warn!("stopping remaining control loops");
                }
            }
            Err(e) => {
                error!("control loop task aborted: {e}");
                failed = true;
                shutdown.request_shutdown();
            }
        }
    }

    if failed {
        bail!("controller stopped after a control loop failure");
    }
    Ok(())
}

/// Tag a loop's result with its name for reporting.
async fn named<F>(name: &'static str, run: F) -> LoopOutcome
where
    F: Future<Output = Result<()>>,
{
    (name, run.await)
}

#[cfg(feature = "bme280")]
fn open_sensor() -> Result<bme280::Bme280> {
    let addr = match env::var("BME280_ADDR") {
        Ok(v) => parse_i2c_addr(&v)?,
        Err(_) => bme280::DEFAULT_ADDR,
    };
    bme280::Bme280::new(addr)
}

#[cfg(all(feature = "sim", not(feature = "bme280")))]
fn open_sensor() -> Result<sensor::SimulatedSensor> {
    // 600 s gives a fast day/night cycle for development.
    let period: f64 = match env::var("SIM_DIURNAL_PERIOD_S") {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("invalid SIM_DIURNAL_PERIOD_S: {v:?}"))?,
        Err(_) => 86_400.0,
    };
    warn!("no BME280 configured, readings are simulated");
    Ok(sensor::SimulatedSensor::new(period))
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{key}: expected true or false, got {other:?}"),
    }
}

/// Accepts `0x76`, `0X77`, or plain decimal.
#[cfg_attr(not(feature = "bme280"), allow(dead_code))]
fn parse_i2c_addr(value: &str) -> Result<u16> {
    let v = value.trim();
    let addr = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => v.parse(),
    }
    .with_context(|| format!("invalid I2C address: {value:?}"))?;

    if addr > 0x7F {
        bail!("I2C address 0x{addr:x} is out of the 7-bit range");
    }
    Ok(addr)
}

// ===========================================================================
// Tests
// ===========================================================================
