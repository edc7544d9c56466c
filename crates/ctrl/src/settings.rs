//! Settings document loading, validation, and hot reload.
//!
//! The document is written by the configuration UI (JSON) or by hand
//! (TOML). Loops take an `Arc<Settings>` snapshot at the start of each
//! cycle; `reload` builds a complete replacement before swapping it in.

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Longest accepted gap between sensor reads: one day.
pub const MAX_UPDATE_FREQUENCY_S: f64 = 86_400.0;

// ---------------------------------------------------------------------------
// Document structure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    pub heat_mat_auto: bool,
    pub pump_auto: bool,
    pub fan_auto: bool,
    pub light_auto: bool,

    pub low_temperature: f64,
    pub high_temperature: f64,
    pub low_humidity: f64,

    #[serde(deserialize_with = "time_of_day")]
    pub light_on_time: NaiveTime,
    #[serde(deserialize_with = "time_of_day")]
    pub light_off_time: NaiveTime,

    /// Seconds between sensor reads.
    pub update_frequency: f64,
    /// Retention horizon for sensor readings.
    pub days_to_keep: f64,
}

/// Parse an `H:MM` / `HH:MM` string into a time of day.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    let (h, m) = s
        .trim()
        .split_once(':')
        .with_context(|| format!("time '{s}' is not in HH:MM form"))?;
    let hour: u32 = h
        .parse()
        .with_context(|| format!("invalid hour in time '{s}'"))?;
    let minute: u32 = m
        .parse()
        .with_context(|| format!("invalid minute in time '{s}'"))?;
    NaiveTime::from_hms_opt(hour, minute, 0)
        .with_context(|| format!("time '{s}' is out of range (00:00-23:59)"))
}

fn time_of_day<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_time_of_day(&s).map_err(|e| serde::de::Error::custom(format!("{e:#}")))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Validate the document. Returns `Ok(())` or an error describing every
    /// violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let numbers = [
            ("low-temperature", self.low_temperature),
            ("high-temperature", self.high_temperature),
            ("low-humidity", self.low_humidity),
            ("update-frequency", self.update_frequency),
            ("days-to-keep", self.days_to_keep),
        ];
        for (key, value) in numbers {
            if !value.is_finite() {
                errors.push(format!("{key} must be a finite number, got {value}"));
            }
        }

        if self.low_temperature >= self.high_temperature {
            errors.push(format!(
                "low-temperature ({}) must be less than high-temperature ({})",
                self.low_temperature, self.high_temperature
            ));
        }

        if !(0.0..=100.0).contains(&self.low_humidity) {
            errors.push(format!(
                "low-humidity {} out of range [0, 100]",
                self.low_humidity
            ));
        }

        if self.update_frequency.is_nan() || self.update_frequency <= 0.0 {
            errors.push(format!(
                "update-frequency must be positive, got {}",
                self.update_frequency
            ));
        } else if self.update_frequency > MAX_UPDATE_FREQUENCY_S {
            errors.push(format!(
                "update-frequency {} exceeds the maximum of {MAX_UPDATE_FREQUENCY_S} seconds",
                self.update_frequency
            ));
        }

        if self.days_to_keep.is_nan() || self.days_to_keep <= 0.0 {
            errors.push(format!(
                "days-to-keep must be positive, got {}",
                self.days_to_keep
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse a settings document. `.toml` files are TOML; everything else is
/// treated as JSON.
pub fn parse(path: &Path, contents: &str) -> Result<Settings> {
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(contents).context("invalid TOML settings document")
    } else {
        serde_json::from_str(contents).context("invalid JSON settings document")
    }
}

/// Read, parse, and validate a settings file.
pub fn load(path: &Path) -> Result<Settings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings: {}", path.display()))?;
    let settings =
        parse(path, &contents).with_context(|| format!("failed to parse settings: {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("invalid settings: {}", path.display()))?;
    Ok(settings)
}

// ---------------------------------------------------------------------------
// Shared store
// ---------------------------------------------------------------------------

/// The process's single in-memory settings document.
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Arc<Settings>>,
}

impl SettingsStore {
    /// Load the initial document. Fails if it is missing or invalid.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = load(&path)?;
        tracing::info!(path = %path.display(), "settings loaded");
        tracing::debug!(?settings, "settings document");
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(settings)),
        })
    }

    /// Snapshot of the current document.
    pub async fn current(&self) -> Arc<Settings> {
        Arc::clone(&*self.current.read().await)
    }

    /// Re-read the document from disk. On error the previous document stays
    /// in effect.
    pub async fn reload(&self) -> Result<()> {
        let settings = load(&self.path)?;
        tracing::debug!(?settings, "settings document");
        *self.current.write().await = Arc::new(settings);
        tracing::info!(path = %self.path.display(), "settings reloaded");
        Ok(())
    }

    /// Swap in a document without reading or validating it.
    #[cfg(test)]
    pub(crate) async fn replace(&self, settings: Settings) {
        *self.current.write().await = Arc::new(settings);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
