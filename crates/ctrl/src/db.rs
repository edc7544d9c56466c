use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

use crate::device::Device;

/// How long a handle waits on another handle's write lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A dedicated handle onto the state store. Each control loop opens its own;
/// handles are never shared across loops.
#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SensorReading {
    /// Unix seconds.
    pub ts: i64,
    pub temperature: f64,
    pub humidity: f64,
    #[sqlx(rename = "comments")]
    pub comment: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Set externally to request a settings reload; cleared once serviced.
    ReloadSettings,
    /// Id of the controller process owning the store.
    Pid,
}

impl Flag {
    pub fn as_str(self) -> &'static str {
        match self {
            Flag::ReloadSettings => "reload_settings",
            Flag::Pid => "pid",
        }
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/vivarium/vivarium_ctrl.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    /// Reset runtime state for a fresh controller process: every device off,
    /// no pending reload, `pid` recorded as the owner.
    pub async fn init_runtime_state(&self, pid: u32) -> Result<()> {
        let mut tx = self.pool.begin().await.context("init_runtime_state: begin failed")?;

        for device in Device::ALL {
            sqlx::query(
                r#"
                INSERT INTO device_states (device, state) VALUES (?, 0)
                ON CONFLICT(device) DO UPDATE SET state = 0
                "#,
            )
            .bind(device.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("init_runtime_state: reset {device} failed"))?;
        }

        for (flag, value) in [(Flag::ReloadSettings, 0_i64), (Flag::Pid, i64::from(pid))] {
            sqlx::query(
                r#"
                INSERT INTO flags (flag, state) VALUES (?, ?)
                ON CONFLICT(flag) DO UPDATE SET state = excluded.state
                "#,
            )
            .bind(flag.as_str())
            .bind(value)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("init_runtime_state: set {} failed", flag.as_str()))?;
        }

        tx.commit().await.context("init_runtime_state: commit failed")?;
        Ok(())
    }

    // ----------------------------
    // Device states
    // ----------------------------

    pub async fn device_state(&self, device: Device) -> Result<bool> {
        let state: Option<bool> =
            sqlx::query_scalar("SELECT state FROM device_states WHERE device = ?")
                .bind(device.as_str())
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("device_state failed for {device}"))?;

        state.with_context(|| format!("no device_states row for {device}"))
    }

    /// Desired state of every device, in `Device::ALL` order. Rows with
    /// unrecognised device names are skipped; a missing device is an error.
    pub async fn device_states(&self) -> Result<Vec<(Device, bool)>> {
        let rows: Vec<(String, bool)> = sqlx::query_as("SELECT device, state FROM device_states")
            .fetch_all(&self.pool)
            .await
            .context("device_states failed")?;

        let mut states: Vec<(Device, bool)> = rows
            .into_iter()
            .filter_map(|(name, on)| match name.parse::<Device>() {
                Ok(device) => Some((device, on)),
                Err(_) => {
                    tracing::warn!(device = %name, "ignoring unknown device_states row");
                    None
                }
            })
            .collect();
        states.sort_by_key(|(device, _)| Device::ALL.iter().position(|d| d == device));

        for device in Device::ALL {
            if !states.iter().any(|(d, _)| *d == device) {
                bail!("no device_states row for {device}");
            }
        }
        Ok(states)
    }

    pub async fn set_device_state(&self, device: Device, on: bool) -> Result<()> {
        let result = sqlx::query("UPDATE device_states SET state = ? WHERE device = ?")
            .bind(on)
            .bind(device.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("set_device_state failed for {device}"))?;

        anyhow::ensure!(
            result.rows_affected() == 1,
            "no device_states row for {device}"
        );
        Ok(())
    }

    // ----------------------------
    // Sensor readings
    // ----------------------------

    pub async fn insert_reading(&self, r: &SensorReading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_readings (ts, temperature, humidity, comments)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(r.ts)
        .bind(r.temperature)
        .bind(r.humidity)
        .bind(&r.comment)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    /// Delete readings strictly older than `cutoff_ts`. Returns rows removed.
    pub async fn delete_readings_before(&self, cutoff_ts: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sensor_readings WHERE ts < ?")
            .bind(cutoff_ts)
            .execute(&self.pool)
            .await
            .context("delete_readings_before failed")?;
        Ok(result.rows_affected())
    }

    /// Readings at or after `since_ts`, oldest first.
    #[cfg(test)]
    pub async fn readings_since(&self, since_ts: i64) -> Result<Vec<SensorReading>> {
        sqlx::query_as(
            r#"
            SELECT ts, temperature, humidity, comments
            FROM sensor_readings
            WHERE ts >= ?
            ORDER BY ts, id
            "#,
        )
        .bind(since_ts)
        .fetch_all(&self.pool)
        .await
        .context("readings_since failed")
    }

    // ----------------------------
    // Flags
    // ----------------------------

    pub async fn flag(&self, flag: Flag) -> Result<i64> {
        let state: Option<i64> = sqlx::query_scalar("SELECT state FROM flags WHERE flag = ?")
            .bind(flag.as_str())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("flag failed for {}", flag.as_str()))?;

        state.with_context(|| format!("no flags row for {}", flag.as_str()))
    }

    pub async fn set_flag(&self, flag: Flag, value: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO flags (flag, state) VALUES (?, ?)
            ON CONFLICT(flag) DO UPDATE SET state = excluded.state
            "#,
        )
        .bind(flag.as_str())
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("set_flag failed for {}", flag.as_str()))?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
