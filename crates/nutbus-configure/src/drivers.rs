//! Driver unit lifecycle
//!
//! Start/stop requests coalesce into two pending sets that a periodic
//! reconcile pass swaps out and applies: stop+disable the leavers,
//! regenerate the global NUT configuration, restart+enable the joiners,
//! then reload the NUT server unit. A failure on one unit never aborts
//! the batch.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{error, info};

/// Reconcile cadence.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

const NUT_SERVER_UNIT: &str = "nut-server";
const NUT_CONFIG_HELPER: &str = "nutbus-nutconfig";

fn unit_for(asset: &str) -> String {
    format!("nut-driver@{asset}")
}

/// Coalescing driver lifecycle manager.
pub struct DriverLifecycle {
    pending_start: Mutex<BTreeSet<String>>,
    pending_stop: Mutex<BTreeSet<String>>,
}

impl DriverLifecycle {
    pub fn new() -> Self {
        Self {
            pending_start: Mutex::new(BTreeSet::new()),
            pending_stop: Mutex::new(BTreeSet::new()),
        }
    }

    /// Queue the asset's driver unit for restart+enable.
    pub fn schedule_start(&self, asset: &str) {
        info!(asset, "scheduling driver start");
        self.pending_start.lock().insert(unit_for(asset));
    }

    /// Queue the asset's driver unit for stop+disable.
    pub fn schedule_stop(&self, asset: &str) {
        info!(asset, "scheduling driver stop");
        self.pending_stop.lock().insert(unit_for(asset));
    }

    /// Apply the pending sets. Public for tests; the run loop calls it on
    /// its own cadence.
    pub async fn reconcile(&self) {
        let stop: Vec<String> = std::mem::take(&mut *self.pending_stop.lock())
            .into_iter()
            .collect();
        let start: Vec<String> = std::mem::take(&mut *self.pending_start.lock())
            .into_iter()
            .collect();

        if stop.is_empty() && start.is_empty() {
            return;
        }

        systemctl("disable", &stop).await;
        systemctl("stop", &stop).await;

        update_nut_config().await;

        systemctl("restart", &start).await;
        systemctl("enable", &start).await;

        systemctl("reload-or-restart", &[NUT_SERVER_UNIT.to_string()]).await;
    }

    /// Periodic reconcile loop; exits when the shutdown flag flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RECONCILE_INTERVAL) => self.reconcile().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // flush whatever is still queued before exiting
                        self.reconcile().await;
                        return;
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> (usize, usize) {
        (self.pending_start.lock().len(), self.pending_stop.lock().len())
    }
}

impl Default for DriverLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one systemctl operation over a unit batch, logging the unit list
/// and exit code.
async fn systemctl(operation: &str, units: &[String]) {
    if units.is_empty() {
        return;
    }
    let result = Command::new("sudo")
        .arg("systemctl")
        .arg(operation)
        .args(units)
        .output()
        .await;

    match result {
        Ok(output) => {
            let code = output.status.code().unwrap_or(-1);
            if output.status.success() {
                info!(operation, code, units = ?units, "systemctl finished");
            } else {
                error!(operation, code, units = ?units, "systemctl failed");
            }
        }
        Err(err) => {
            error!(operation, error = %err, units = ?units, "cannot run systemctl");
        }
    }
}

/// Regenerate the global NUT configuration through the external helper.
async fn update_nut_config() {
    let result = Command::new("sudo").arg(NUT_CONFIG_HELPER).output().await;
    match result {
        Ok(output) if output.status.success() => {
            info!(helper = NUT_CONFIG_HELPER, "NUT configuration regenerated");
        }
        Ok(output) => {
            error!(
                helper = NUT_CONFIG_HELPER,
                code = output.status.code().unwrap_or(-1),
                "NUT configuration helper failed"
            );
        }
        Err(err) => {
            error!(helper = NUT_CONFIG_HELPER, error = %err, "cannot run NUT configuration helper");
        }
    }
}
