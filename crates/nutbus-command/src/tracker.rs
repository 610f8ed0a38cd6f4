//! Command job tracking
//!
//! The worker owns the command-path NUT session. Submissions translate
//! one logical request into instant commands whose tracking IDs form the
//! job's pending set; a bounded-cadence poll drains the set, AND-ing
//! each outcome into the job's success flag. The aggregated result goes
//! out once the set is empty. A lost session raises the abort signal;
//! partial jobs are not persisted.

use nutbus_client::{NutClient, NutError, TrackingId, TrackingResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Tracking poll cadence.
pub const POLL_PERIOD: Duration = Duration::from_millis(500);

/// One `(asset, command, argument?)` entry of a logical request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandItem {
    pub asset: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument: Option<String>,
}

/// One in-flight logical request.
#[derive(Debug)]
struct Job {
    correlation_id: String,
    pending: BTreeSet<TrackingId>,
    success: bool,
}

/// Pure completion accounting over the job list.
#[derive(Debug, Default)]
struct JobBook {
    jobs: Vec<Job>,
}

impl JobBook {
    fn add(&mut self, correlation_id: String, pending: BTreeSet<TrackingId>, success: bool) {
        self.jobs.push(Job {
            correlation_id,
            pending,
            success,
        });
    }

    /// All tracking IDs still pending, across jobs.
    fn pending_ids(&self) -> Vec<TrackingId> {
        self.jobs
            .iter()
            .flat_map(|job| job.pending.iter().cloned())
            .collect()
    }

    /// Account one tracking completion. Returns the finished job's
    /// `(correlation_id, success)` when its pending set drained.
    fn complete(&mut self, id: &TrackingId, result: bool) -> Option<(String, bool)> {
        let index = self.jobs.iter().position(|job| job.pending.contains(id))?;
        let job = &mut self.jobs[index];
        job.pending.remove(id);
        job.success &= result;
        if job.pending.is_empty() {
            let job = self.jobs.remove(index);
            Some((job.correlation_id, job.success))
        } else {
            None
        }
    }
}

enum Request {
    Submit {
        correlation_id: String,
        commands: Vec<CommandItem>,
    },
    ListCommands {
        asset: String,
        reply: oneshot::Sender<Result<Vec<String>, String>>,
    },
}

/// Handle to the command worker.
#[derive(Clone)]
pub struct CommandTracker {
    tx: mpsc::Sender<Request>,
}

impl CommandTracker {
    /// Spawn the worker over an authenticated NUT session.
    ///
    /// Completions arrive on `completion_tx` as `(correlation_id,
    /// success)`. When the session drops, `abort_tx` flips and the
    /// worker stops; the supervising process is expected to exit.
    pub fn spawn(
        nut: NutClient,
        completion_tx: mpsc::UnboundedSender<(String, bool)>,
        abort_tx: watch::Sender<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(worker(nut, rx, completion_tx, abort_tx));
        Self { tx }
    }

    pub async fn submit(
        &self,
        correlation_id: String,
        commands: Vec<CommandItem>,
    ) -> Result<(), crate::CommandError> {
        self.tx
            .send(Request::Submit {
                correlation_id,
                commands,
            })
            .await
            .map_err(|_| crate::CommandError::TrackerGone)
    }

    /// Instant commands a device supports (NUT `LIST CMD`).
    pub async fn list_commands(&self, asset: String) -> Result<Vec<String>, String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request::ListCommands {
                asset,
                reply: reply_tx,
            })
            .await
            .map_err(|_| "tracker is shut down".to_string())?;
        reply_rx.await.map_err(|_| "tracker is shut down".to_string())?
    }
}

async fn worker(
    mut nut: NutClient,
    mut rx: mpsc::Receiver<Request>,
    completion_tx: mpsc::UnboundedSender<(String, bool)>,
    abort_tx: watch::Sender<bool>,
) {
    let mut book = JobBook::default();
    let mut ticker = tokio::time::interval(POLL_PERIOD);

    loop {
        tokio::select! {
            request = rx.recv() => {
                match request {
                    Some(Request::Submit { correlation_id, commands }) => {
                        submit(&mut nut, &mut book, &completion_tx, correlation_id, commands).await;
                    }
                    Some(Request::ListCommands { asset, reply }) => {
                        let result = nut
                            .list_commands(&asset)
                            .await
                            .map_err(|err| err.to_string());
                        let _ = reply.send(result);
                    }
                    None => {
                        debug!("command tracker handle dropped, worker stops");
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if poll_pending(&mut nut, &mut book, &completion_tx).await.is_err() {
                    error!("NUT command session lost, signalling abort");
                    let _ = abort_tx.send(true);
                    return;
                }
            }
        }
    }
}

/// Issue the instant commands of one request and register the job.
async fn submit(
    nut: &mut NutClient,
    book: &mut JobBook,
    completion_tx: &mpsc::UnboundedSender<(String, bool)>,
    correlation_id: String,
    commands: Vec<CommandItem>,
) {
    let mut pending = BTreeSet::new();
    let mut success = true;

    for item in &commands {
        match nut
            .send_instant_command(&item.asset, &item.command, item.argument.as_deref())
            .await
        {
            Ok(id) => {
                info!(
                    asset = %item.asset,
                    command = %item.command,
                    tracking = %id,
                    "instant command issued"
                );
                pending.insert(id);
            }
            Err(err) => {
                warn!(
                    asset = %item.asset,
                    command = %item.command,
                    error = %err,
                    "instant command failed to issue"
                );
                success = false;
            }
        }
    }

    if pending.is_empty() {
        // nothing to track; the result is already known
        let _ = completion_tx.send((correlation_id, success));
    } else {
        book.add(correlation_id, pending, success);
    }
}

/// Poll every pending tracking ID once. `Err` means the session is gone.
async fn poll_pending(
    nut: &mut NutClient,
    book: &mut JobBook,
    completion_tx: &mpsc::UnboundedSender<(String, bool)>,
) -> Result<(), NutError> {
    for id in book.pending_ids() {
        let outcome = match nut.poll_tracking(&id).await {
            Ok(TrackingResult::Pending) => continue,
            Ok(TrackingResult::Success) => true,
            Ok(TrackingResult::Failure) => false,
            Err(NutError::Communication(reason)) => {
                return Err(NutError::Communication(reason));
            }
            Err(err) => {
                warn!(tracking = %id, error = %err, "tracking poll failed");
                false
            }
        };
        if let Some((correlation_id, success)) = book.complete(&id, outcome) {
            info!(%correlation_id, success, "command job finished");
            let _ = completion_tx.send((correlation_id, success));
        }
    }
    Ok(())
}
