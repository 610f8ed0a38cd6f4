//! Command bus connector
//!
//! Answers the power-command mailbox: PERFORM_COMMANDS submits a job to
//! the tracker and replies once the aggregated result is in;
//! GET_COMMANDS lists the instant commands a device supports.

use crate::tracker::{CommandItem, CommandTracker};
use futures::StreamExt;
use nutbus_proto::{bus::decode_json, subject, BusClient};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Inbound request on the power-command mailbox.
#[derive(Debug, Deserialize)]
#[serde(tag = "action")]
pub enum CommandRequest {
    #[serde(rename = "PERFORM_COMMANDS")]
    Perform {
        correlation_id: String,
        commands: Vec<CommandItem>,
    },
    #[serde(rename = "GET_COMMANDS")]
    Get {
        correlation_id: String,
        asset: String,
    },
}

/// Reply for a performed job.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandReply {
    pub correlation_id: String,
    pub success: bool,
}

/// Reply for a command listing.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandListReply {
    pub correlation_id: String,
    pub asset: String,
    pub commands: Vec<String>,
}

pub struct CommandConnector {
    bus: BusClient,
    tracker: CommandTracker,
}

impl CommandConnector {
    pub fn new(bus: BusClient, tracker: CommandTracker) -> Self {
        Self { bus, tracker }
    }

    /// Serve the mailbox until shutdown. Completions arriving from the
    /// tracker are matched to their stored reply subject.
    pub async fn run(
        self,
        mut completion_rx: mpsc::UnboundedReceiver<(String, bool)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut requests = match self.bus.subscribe(subject::POWER_COMMANDS).await {
            Ok(subscriber) => subscriber,
            Err(err) => {
                error!(error = %err, "cannot subscribe to the command mailbox");
                return;
            }
        };
        info!("command connector ready");

        // correlation id -> reply subject of the pending request
        let mut pending_replies: HashMap<String, String> = HashMap::new();

        loop {
            tokio::select! {
                message = requests.next() => {
                    let Some(message) = message else {
                        warn!("command mailbox subscription ended");
                        return;
                    };
                    let request: CommandRequest = match decode_json(&message.payload) {
                        Ok(request) => request,
                        Err(err) => {
                            error!(error = %err, "malformed command request dropped");
                            continue;
                        }
                    };
                    match request {
                        CommandRequest::Perform { correlation_id, commands } => {
                            debug!(%correlation_id, count = commands.len(), "command request received");
                            if let Some(reply) = &message.reply {
                                pending_replies.insert(correlation_id.clone(), reply.to_string());
                            }
                            if let Err(err) = self.tracker.submit(correlation_id.clone(), commands).await {
                                error!(%correlation_id, error = %err, "cannot submit command job");
                                self.reply(&mut pending_replies, &correlation_id, false).await;
                            }
                        }
                        CommandRequest::Get { correlation_id, asset } => {
                            let commands = self
                                .tracker
                                .list_commands(asset.clone())
                                .await
                                .unwrap_or_default();
                            let reply = CommandListReply { correlation_id, asset, commands };
                            if let Err(err) = self.bus.respond_json(&message, &reply).await {
                                error!(error = %err, "cannot answer GET_COMMANDS");
                            }
                        }
                    }
                }
                completion = completion_rx.recv() => {
                    let Some((correlation_id, success)) = completion else {
                        warn!("command tracker completion channel closed");
                        return;
                    };
                    self.reply(&mut pending_replies, &correlation_id, success).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("command connector stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn reply(
        &self,
        pending_replies: &mut HashMap<String, String>,
        correlation_id: &str,
        success: bool,
    ) {
        let Some(reply_subject) = pending_replies.remove(correlation_id) else {
            warn!(%correlation_id, "completion for an unknown correlation id");
            return;
        };
        let reply = CommandReply {
            correlation_id: correlation_id.to_string(),
            success,
        };
        if let Err(err) = self.bus.publish_json(reply_subject, &reply).await {
            error!(%correlation_id, error = %err, "cannot send command reply");
        }
    }
}
