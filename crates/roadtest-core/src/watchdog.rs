//! Connection watchdog: bounds the wait for a device to attach.
//!
//! A run that launches an app on a device has no upper bound on how long the
//! device-side harness may take to dial back to the event server; the
//! watchdog supplies one. It is a single one-shot timer per run, not a
//! polling loop: the primary path races the server's connection-state watch
//! against the timer and resolves the moment the device attaches; if the
//! timer expires first, one final check of the connection predicate is
//! trusted (an attach that happened before the watch was subscribed still
//! counts).

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::server::EventServer;

/// Errors produced by the connection watchdog.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WatchdogError {
    /// No device attached within the configured interval.
    #[error("no device connected within {0:?}")]
    Timeout(Duration),
}

impl WatchdogError {
    /// The configured interval that elapsed, for diagnostics.
    pub fn configured_timeout(&self) -> Duration {
        match self {
            WatchdogError::Timeout(d) => *d,
        }
    }
}

/// One-shot watchdog guarding the wait for device attachment.
pub struct ConnectionWatchdog;

impl ConnectionWatchdog {
    /// Wait until a device attaches to `server`, or `timeout` elapses.
    ///
    /// Resolves immediately if a device is already attached. Uses exactly
    /// one timer regardless of how long the wait is.
    ///
    /// # Errors
    ///
    /// - [`WatchdogError::Timeout`] carrying the configured duration
    pub async fn wait(server: &EventServer, timeout: Duration) -> Result<(), WatchdogError> {
        let mut connected = server.connected_watch();
        if *connected.borrow_and_update() {
            return Ok(());
        }

        debug!(?timeout, "watchdog armed");

        let expiry = tokio::time::sleep(timeout);
        tokio::pin!(expiry);
        let mut watch_live = true;

        loop {
            tokio::select! {
                _ = &mut expiry => {
                    // Final check-point: trust the predicate even if the
                    // attach raced the watch subscription.
                    return if server.is_device_connected() {
                        Ok(())
                    } else {
                        Err(WatchdogError::Timeout(timeout))
                    };
                }
                changed = connected.changed(), if watch_live => match changed {
                    Ok(()) => {
                        if *connected.borrow() {
                            debug!("device attached before watchdog expiry");
                            return Ok(());
                        }
                    }
                    // Server went away; fall back to waiting out the timer.
                    Err(_) => watch_live = false,
                }
            }
        }
    }
}
