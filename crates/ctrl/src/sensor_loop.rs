//! Sensor/actuation loop: reads the environment, decides the desired state
//! of the heat mat, pump, and fan, records a reading, and prunes old ones.
//!
//! Only desired state is written here. Relays are driven by the device sync
//! loop, and the light belongs to the scheduler.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::db::{Db, SensorReading};
use crate::device::{on_off, Device};
use crate::sensor::EnvironmentSensor;
use crate::settings::{Settings, SettingsStore};
use crate::shutdown::Shutdown;

const SECS_PER_DAY: f64 = 86_400.0;

/// Run the loop until shutdown. A sensor or store error ends the loop.
pub async fn run<S: EnvironmentSensor>(
    db: Db,
    mut sensor: S,
    settings: Arc<SettingsStore>,
    shutdown: Shutdown,
) -> Result<()> {
    info!("sensor loop started");

    while !shutdown.is_shutdown() {
        let started = Instant::now();
        let cfg = settings.current().await;

        let reading = cycle(&db, &mut sensor, &cfg, chrono::Utc::now().timestamp()).await?;
        debug!(
            temperature = reading.temperature,
            humidity = reading.humidity,
            status = %reading.comment,
            "sensor reading recorded"
        );

        match next_deadline(started, cycle_interval(&cfg)) {
            Some(deadline) => {
                shutdown.sleep_until(deadline).await;
            }
            None => shutdown.wait().await,
        }
    }

    info!("sensor loop stopped");
    Ok(())
}

/// One read/decide/record pass. `now_ts` is the reading timestamp in unix
/// seconds.
pub(crate) async fn cycle<S: EnvironmentSensor>(
    db: &Db,
    sensor: &mut S,
    cfg: &Settings,
    now_ts: i64,
) -> Result<SensorReading> {
    let env = sensor.read().context("sensor read failed")?;
    let temperature = round2(env.temperature);
    let humidity = round2(env.humidity);

    let heat_mat = regulate(
        db,
        Device::HeatMat,
        cfg.heat_mat_auto,
        temperature <= cfg.low_temperature,
        temperature,
    )
    .await?;
    let fan = regulate(
        db,
        Device::Fan,
        cfg.fan_auto,
        temperature >= cfg.high_temperature,
        temperature,
    )
    .await?;
    let pump = regulate(
        db,
        Device::Pump,
        cfg.pump_auto,
        humidity <= cfg.low_humidity,
        humidity,
    )
    .await?;
    // Owned by the scheduler; only reported here.
    let light = db.device_state(Device::Light).await?;

    let reading = SensorReading {
        ts: now_ts,
        temperature,
        humidity,
        comment: status_comment(heat_mat, pump, fan, light),
    };
    db.insert_reading(&reading).await?;

    let pruned = db
        .delete_readings_before(retention_cutoff(now_ts, cfg.days_to_keep))
        .await?;
    if pruned > 0 {
        debug!(pruned, days_to_keep = cfg.days_to_keep, "old readings pruned");
    }

    Ok(reading)
}

/// Apply a single-threshold rule to one device. When `auto` is off the
/// stored state is left alone. Returns the device's state after the rule.
async fn regulate(db: &Db, device: Device, auto: bool, due_on: bool, value: f64) -> Result<bool> {
    let current = db.device_state(device).await?;
    if !auto || current == due_on {
        return Ok(current);
    }

    db.set_device_state(device, due_on).await?;
    info!(%device, on = due_on, value, "desired state changed");
    Ok(due_on)
}

pub(crate) fn status_comment(heat_mat: bool, pump: bool, fan: bool, light: bool) -> String {
    format!(
        "{}: {}, {}: {}, {}: {}, {}: {}",
        Device::HeatMat.label(),
        on_off(heat_mat),
        Device::Pump.label(),
        on_off(pump),
        Device::Fan.label(),
        on_off(fan),
        Device::Light.label(),
        on_off(light),
    )
}

/// Oldest timestamp kept for a `days_to_keep` horizon.
pub(crate) fn retention_cutoff(now_ts: i64, days_to_keep: f64) -> i64 {
    now_ts - (days_to_keep * SECS_PER_DAY) as i64
}

/// Time from one cycle start to the next. Saturates rather than wrapping to
/// zero for values too large to represent.
fn cycle_interval(cfg: &Settings) -> Duration {
    Duration::try_from_secs_f64(cfg.update_frequency.max(0.0)).unwrap_or(Duration::MAX)
}

/// Start of the next cycle, or `None` if it lies beyond what the clock can
/// represent.
fn next_deadline(started: Instant, interval: Duration) -> Option<Instant> {
    started.checked_add(interval)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::tests::memory_db;
    use crate::sensor::Environment;
    use crate::settings::tests::valid_settings;
    use std::collections::VecDeque;

    const NOW: i64 = 1_700_000_000;

    /// Returns queued readings in order, repeating the last one; fails once
    /// the queue holds an error marker (`None`).
    pub(crate) struct ScriptedSensor {
        queue: VecDeque<Option<Environment>>,
        last: Option<Environment>,
    }

    impl ScriptedSensor {
        pub(crate) fn fixed(temperature: f64, humidity: f64) -> Self {
            Self::script([Some(Environment {
                temperature,
                humidity,
            })])
        }

        pub(crate) fn failing() -> Self {
            Self::script([None])
        }

        pub(crate) fn script(items: impl IntoIterator<Item = Option<Environment>>) -> Self {
            Self {
                queue: items.into_iter().collect(),
                last: None,
            }
        }
    }

    impl EnvironmentSensor for ScriptedSensor {
        fn read(&mut self) -> Result<Environment> {
            match self.queue.pop_front() {
                Some(Some(env)) => {
                    self.last = Some(env);
                    Ok(env)
                }
                Some(None) => anyhow::bail!("i2c bus error"),
                None => self.last.context("script exhausted"),
            }
        }
    }

    async fn states(db: &Db) -> (bool, bool, bool, bool) {
        (
            db.device_state(Device::HeatMat).await.unwrap(),
            db.device_state(Device::Pump).await.unwrap(),
            db.device_state(Device::Fan).await.unwrap(),
            db.device_state(Device::Light).await.unwrap(),
        )
    }

    // -- End-to-end cycle ----------------------------------------------------

    #[tokio::test]
    async fn cold_reading_turns_heat_mat_on() {
        let db = memory_db().await;
        let mut sensor = ScriptedSensor::fixed(17.0, 50.0);

        let reading = cycle(&db, &mut sensor, &valid_settings(), NOW).await.unwrap();

        assert_eq!(states(&db).await, (true, false, false, false));
        assert_eq!(reading.comment, "Heat Mat: On, Pump: Off, Fan: Off, Light: Off");

        let stored = db.readings_since(0).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], reading);
        assert_eq!(stored[0].temperature, 17.0);
        assert_eq!(stored[0].humidity, 50.0);
    }

    #[tokio::test]
    async fn readings_are_rounded_to_two_places() {
        let db = memory_db().await;
        let mut sensor = ScriptedSensor::fixed(23.45678, 61.2349);
        let reading = cycle(&db, &mut sensor, &valid_settings(), NOW).await.unwrap();
        assert_eq!(reading.temperature, 23.46);
        assert_eq!(reading.humidity, 61.23);
    }

    // -- Heat mat ------------------------------------------------------------

    #[tokio::test]
    async fn heat_mat_on_at_exact_threshold() {
        let db = memory_db().await;
        cycle(&db, &mut ScriptedSensor::fixed(18.0, 50.0), &valid_settings(), NOW)
            .await
            .unwrap();
        assert!(db.device_state(Device::HeatMat).await.unwrap());
    }

    #[tokio::test]
    async fn heat_mat_off_just_above_threshold() {
        let db = memory_db().await;
        db.set_device_state(Device::HeatMat, true).await.unwrap();
        cycle(&db, &mut ScriptedSensor::fixed(18.01, 50.0), &valid_settings(), NOW)
            .await
            .unwrap();
        assert!(!db.device_state(Device::HeatMat).await.unwrap());
    }

    #[tokio::test]
    async fn repeated_cycles_are_idempotent() {
        let db = memory_db().await;
        let cfg = valid_settings();
        let mut sensor = ScriptedSensor::fixed(17.0, 50.0);
        for i in 0..3 {
            cycle(&db, &mut sensor, &cfg, NOW + i).await.unwrap();
            assert!(db.device_state(Device::HeatMat).await.unwrap());
        }
    }

    #[tokio::test]
    async fn manual_state_kept_when_auto_disabled() {
        let db = memory_db().await;
        db.set_device_state(Device::HeatMat, true).await.unwrap();
        let cfg = Settings {
            heat_mat_auto: false,
            ..valid_settings()
        };
        cycle(&db, &mut ScriptedSensor::fixed(30.0, 50.0), &cfg, NOW)
            .await
            .unwrap();
        assert!(db.device_state(Device::HeatMat).await.unwrap());
    }

    // -- Fan -----------------------------------------------------------------

    #[tokio::test]
    async fn fan_on_at_exact_high_threshold() {
        let db = memory_db().await;
        cycle(&db, &mut ScriptedSensor::fixed(28.0, 50.0), &valid_settings(), NOW)
            .await
            .unwrap();
        assert_eq!(states(&db).await, (false, false, true, false));
    }

    #[tokio::test]
    async fn fan_off_below_high_threshold() {
        let db = memory_db().await;
        db.set_device_state(Device::Fan, true).await.unwrap();
        cycle(&db, &mut ScriptedSensor::fixed(27.99, 50.0), &valid_settings(), NOW)
            .await
            .unwrap();
        assert!(!db.device_state(Device::Fan).await.unwrap());
    }

    // -- Pump ----------------------------------------------------------------

    #[tokio::test]
    async fn pump_on_at_exact_low_humidity() {
        let db = memory_db().await;
        cycle(&db, &mut ScriptedSensor::fixed(22.0, 40.0), &valid_settings(), NOW)
            .await
            .unwrap();
        assert_eq!(states(&db).await, (false, true, false, false));
    }

    #[tokio::test]
    async fn pump_off_above_low_humidity() {
        let db = memory_db().await;
        db.set_device_state(Device::Pump, true).await.unwrap();
        cycle(&db, &mut ScriptedSensor::fixed(22.0, 40.01), &valid_settings(), NOW)
            .await
            .unwrap();
        assert!(!db.device_state(Device::Pump).await.unwrap());
    }

    // -- Light ---------------------------------------------------------------

    #[tokio::test]
    async fn light_is_reported_but_never_changed() {
        let db = memory_db().await;
        db.set_device_state(Device::Light, true).await.unwrap();
        let reading = cycle(&db, &mut ScriptedSensor::fixed(22.0, 50.0), &valid_settings(), NOW)
            .await
            .unwrap();
        assert!(db.device_state(Device::Light).await.unwrap());
        assert_eq!(reading.comment, "Heat Mat: Off, Pump: Off, Fan: Off, Light: On");
    }

    // -- Retention -----------------------------------------------------------

    #[tokio::test]
    async fn cycle_prunes_readings_past_retention() {
        let db = memory_db().await;
        let day = 86_400;
        for ts in [NOW - 10 * day, NOW - 2 * day] {
            db.insert_reading(&SensorReading {
                ts,
                temperature: 20.0,
                humidity: 50.0,
                comment: String::new(),
            })
            .await
            .unwrap();
        }

        cycle(&db, &mut ScriptedSensor::fixed(22.0, 50.0), &valid_settings(), NOW)
            .await
            .unwrap();

        let ts: Vec<i64> = db
            .readings_since(0)
            .await
            .unwrap()
            .iter()
            .map(|r| r.ts)
            .collect();
        assert_eq!(ts, [NOW - 2 * day, NOW]);
    }

    #[test]
    fn retention_cutoff_handles_fractional_days() {
        assert_eq!(retention_cutoff(NOW, 5.0), NOW - 432_000);
        assert_eq!(retention_cutoff(NOW, 0.5), NOW - 43_200);
    }

    // -- Failure policy ------------------------------------------------------

    #[tokio::test]
    async fn sensor_failure_is_propagated_without_writes() {
        let db = memory_db().await;
        let err = cycle(&db, &mut ScriptedSensor::failing(), &valid_settings(), NOW)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("sensor read failed"));
        assert!(db.readings_since(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_sensor_failure() {
        let db = memory_db().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(test_store(&dir));
        let sensor = ScriptedSensor::script([
            Some(Environment {
                temperature: 22.0,
                humidity: 50.0,
            }),
            None,
        ]);

        // update-frequency is tiny so the second cycle runs at once.
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run(db.clone(), sensor, settings, Shutdown::new()),
        )
        .await
        .expect("loop should end on its own");

        assert!(result.is_err());
        assert_eq!(db.readings_since(0).await.unwrap().len(), 1);
    }

    // -- Shutdown ------------------------------------------------------------

    #[tokio::test]
    async fn run_returns_promptly_on_shutdown() {
        let db = memory_db().await;
        let dir = tempfile::tempdir().unwrap();
        let json = crate::settings::tests::VALID_JSON
            .replace(r#""update-frequency": 60"#, r#""update-frequency": 3600"#);
        std::fs::write(dir.path().join("settings.json"), json).unwrap();
        let settings = Arc::new(SettingsStore::load(dir.path().join("settings.json")).unwrap());

        let shutdown = Shutdown::new();
        let handle = tokio::spawn(run(
            db.clone(),
            ScriptedSensor::fixed(22.0, 50.0),
            settings,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.request_shutdown();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop well before its hour-long interval")
            .unwrap()
            .unwrap();
        assert_eq!(db.readings_since(0).await.unwrap().len(), 1);
    }

    /// Settings store with a very short update interval.
    pub(crate) fn test_store(dir: &tempfile::TempDir) -> SettingsStore {
        let json = crate::settings::tests::VALID_JSON
            .replace(r#""update-frequency": 60"#, r#""update-frequency": 0.01"#);
        let path = dir.path().join("settings.json");
        std::fs::write(&path, json).unwrap();
        SettingsStore::load(path).unwrap()
    }

    #[test]
    fn cycle_interval_follows_update_frequency() {
        let cfg = Settings {
            update_frequency: 2.5,
            ..valid_settings()
        };
        assert_eq!(cycle_interval(&cfg), Duration::from_millis(2500));
    }

    #[test]
    fn oversized_update_frequency_never_spins() {
        let cfg = Settings {
            update_frequency: 1e20,
            ..valid_settings()
        };
        assert_eq!(cycle_interval(&cfg), Duration::MAX);
    }

    #[test]
    fn unreachable_deadline_does_not_overflow() {
        let now = Instant::now();
        assert_eq!(next_deadline(now, Duration::ZERO), Some(now));
        assert!(next_deadline(now, Duration::from_secs_f64(1e19)).is_none());
        assert!(next_deadline(now, Duration::MAX).is_none());
    }

    #[tokio::test]
    async fn run_with_unreachable_deadline_waits_for_shutdown() {
        let db = memory_db().await;
        let cfg = Settings {
            update_frequency: 1e19,
            ..valid_settings()
        };
        // Skips validation so the loop's own overflow handling is reached.
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(test_store(&dir));
        settings.replace(cfg).await;

        let shutdown = Shutdown::new();
        let handle = tokio::spawn(run(
            db.clone(),
            ScriptedSensor::fixed(22.0, 50.0),
            settings,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.request_shutdown();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop on shutdown")
            .unwrap()
            .unwrap();
        assert_eq!(db.readings_since(0).await.unwrap().len(), 1);
    }
}
