//! Device sync loop: pushes stored desired states to the relays and services
//! settings reload requests. On exit every relay is switched off.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::db::{Db, Flag};
use crate::relay::RelayBoard;
use crate::settings::SettingsStore;
use crate::shutdown::Shutdown;

/// How often desired states are applied and the reload flag is checked.
pub const DEVICE_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Run the loop until shutdown or a store error, then power everything down.
pub async fn run(
    db: Db,
    relays: &mut RelayBoard,
    settings: Arc<SettingsStore>,
    shutdown: Shutdown,
) -> Result<()> {
    info!(
        interval_ms = DEVICE_SYNC_INTERVAL.as_millis() as u64,
        "device sync loop started"
    );

    let result = sync_until_shutdown(&db, relays, &settings, &shutdown).await;

    // Fail-safe: nothing is left running unattended, whatever the last
    // desired state was.
    relays.all_off();
    info!("device sync loop stopped, all devices have been turned off");

    result
}

async fn sync_until_shutdown(
    db: &Db,
    relays: &mut RelayBoard,
    settings: &SettingsStore,
    shutdown: &Shutdown,
) -> Result<()> {
    while !shutdown.is_shutdown() {
        sync_devices(db, relays).await?;
        service_reload_flag(db, settings).await?;
        shutdown.interruptible_sleep(DEVICE_SYNC_INTERVAL).await;
    }
    Ok(())
}

/// Write every desired state that differs from what the relay last applied.
/// Returns the number of relays changed.
pub(crate) async fn sync_devices(db: &Db, relays: &mut RelayBoard) -> Result<usize> {
    let mut changed = 0;
    for (device, desired) in db.device_states().await? {
        if relays.is_on(device) != desired {
            relays.set(device, desired);
            changed += 1;
        }
    }
    Ok(changed)
}

/// Reload settings if the reload flag is set, then clear it. A document that
/// fails to load leaves the previous settings in effect.
pub(crate) async fn service_reload_flag(db: &Db, settings: &SettingsStore) -> Result<bool> {
    if db.flag(Flag::ReloadSettings).await? == 0 {
        return Ok(false);
    }

    match settings.reload().await {
        Ok(()) => {}
        Err(e) => {
            error!("settings reload failed, keeping previous settings: {e:#}");
            warn!("fix the settings document and request another reload");
        }
    }
    db.set_flag(Flag::ReloadSettings, 0).await?;
    Ok(true)
}

// ===========================================================================
// Tests
// ===========================================================================
