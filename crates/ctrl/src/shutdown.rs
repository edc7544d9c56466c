//! Process-wide shutdown latch shared by every control loop.
//!
//! The latch starts unset and, once set, is never cleared. Every loop
//! sleeps through [`Shutdown::interruptible_sleep`] (or
//! [`Shutdown::sleep_until`]) so that a shutdown request wakes it at once.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Set the latch and wake every sleeper. Returns `true` only for the
    /// call that actually set it.
    pub fn request_shutdown(&self) -> bool {
        self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// Sleep for `duration`, returning early if shutdown is requested.
    /// Returns `true` if the latch is set on return.
    pub async fn interruptible_sleep(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration).await
    }

    /// Sleep until `deadline`, returning early if shutdown is requested. A
    /// deadline in the past returns immediately.
    pub async fn sleep_until(&self, deadline: Instant) -> bool {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => self.is_shutdown(),
            _ = rx.wait_for(|stopped| *stopped) => true,
        }
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for SIGTERM or SIGINT and return its name.
#[cfg(unix)]
pub async fn termination_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = term.recv() => Ok("SIGTERM"),
        _ = int.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
pub async fn termination_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

// ===========================================================================
// Tests
// ===========================================================================
