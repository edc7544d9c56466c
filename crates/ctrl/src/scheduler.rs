//! Lighting scheduler: switches the light's desired state on and off
//! according to the time-of-day window in the settings.
//!
//! ## On-window
//!
//! ```text
//! on < off     on ──────── off              due on inside [on, off]
//! on >= off    ── off      on ──            due on for t >= on or t <= off
//! ```
//!
//! The scheduler is the only writer of the light's desired state. The relay
//! itself is driven by the device sync loop.

use anyhow::Result;
use chrono::{Local, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::db::Db;
use crate::device::Device;
use crate::settings::{Settings, SettingsStore};
use crate::shutdown::Shutdown;

/// How often the schedule is evaluated. Lighting changes are minute-grained.
pub const SCHEDULER_INTERVAL: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the scheduler until shutdown. A store error ends the loop.
pub async fn run(db: Db, settings: Arc<SettingsStore>, shutdown: Shutdown) -> Result<()> {
    info!(tick_sec = SCHEDULER_INTERVAL.as_secs(), "scheduler started");

    while !shutdown.is_shutdown() {
        let cfg = settings.current().await;
        apply_schedule(&db, &cfg, Local::now().time()).await?;
        shutdown.interruptible_sleep(SCHEDULER_INTERVAL).await;
    }

    info!("scheduler stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Schedule evaluation
// ---------------------------------------------------------------------------

/// Whether the light should be on at `now` for an `[on, off]` window. Both
/// ends are inclusive; `on >= off` means the window crosses midnight.
pub fn light_due_on(on: NaiveTime, off: NaiveTime, now: NaiveTime) -> bool {
    if on < off {
        on <= now && now <= off
    } else {
        now >= on || now <= off
    }
}

/// Bring the light's desired state in line with the schedule at `now`.
/// Returns the new state if it was changed, `None` otherwise (including when
/// `light-auto` is off).
pub(crate) async fn apply_schedule(db: &Db, cfg: &Settings, now: NaiveTime) -> Result<Option<bool>> {
    if !cfg.light_auto {
        return Ok(None);
    }

    let due_on = light_due_on(cfg.light_on_time, cfg.light_off_time, now);
    if db.device_state(Device::Light).await? == due_on {
        return Ok(None);
    }

    db.set_device_state(Device::Light, due_on).await?;
    info!(
        on = due_on,
        at = %now.format("%H:%M"),
        window = %format_args!(
            "{}-{}",
            cfg.light_on_time.format("%H:%M"),
            cfg.light_off_time.format("%H:%M")
        ),
        "scheduler: light switched"
    );
    Ok(Some(due_on))
}

// ===========================================================================
// Tests
// ===========================================================================
