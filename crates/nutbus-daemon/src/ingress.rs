//! Bus event ingress
//!
//! Feeds the snapshot writer: initial hydration through the asset
//! mailboxes, then the asset and licensing streams. Commits notify the
//! autoconfiguration scheduler.

use futures::StreamExt;
use nutbus_proto::bus::{decode_json, REQUEST_TIMEOUT};
use nutbus_proto::{subject, AssetMessage, BusClient, MetricMessage};
use nutbus_state::Writer;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MONITORED_SUBTYPES: [&str; 6] = ["ups", "epdu", "sts", "ats", "sensor", "sensorgpio"];

/// Query the asset service for the initial device set. Has to run after
/// the stream subscriptions so no asset created in between is missed.
pub async fn hydrate(bus: &BusClient, writer: &mut Writer) {
    debug!("requesting initial assets");

    let uuid = Uuid::new_v4().to_string();
    let mut frames = vec!["GET".to_string(), uuid.clone()];
    frames.extend(MONITORED_SUBTYPES.iter().map(|s| s.to_string()));

    let reply = match bus
        .request_frames(subject::ASSET_MAILBOX_ASSETS, &frames, REQUEST_TIMEOUT)
        .await
    {
        Ok(reply) => reply,
        Err(err) => {
            error!(error = %err, "initial ASSETS request failed");
            return;
        }
    };
    if reply.first() != Some(&uuid) {
        error!("mismatched response to the ASSETS request");
        return;
    }
    if reply.get(1).map(String::as_str) != Some("OK") {
        error!(status = ?reply.get(1), "ASSETS request rejected");
        return;
    }

    let names = &reply[2..];
    debug!(count = names.len(), "requesting asset details");
    let mut changed = false;
    let mut missed = 0usize;

    for name in names {
        let uuid = Uuid::new_v4().to_string();
        let frames = vec!["GET".to_string(), uuid.clone(), name.clone()];
        let reply = match bus
            .request_frames(subject::ASSET_MAILBOX_DETAIL, &frames, REQUEST_TIMEOUT)
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                warn!(asset = %name, error = %err, "ASSET_DETAIL request failed");
                missed += 1;
                continue;
            }
        };
        if reply.first() != Some(&uuid) {
            warn!(asset = %name, "mismatched response to an ASSET_DETAIL request");
            missed += 1;
            continue;
        }
        let Some(body) = reply.get(1) else {
            warn!(asset = %name, "ASSET_DETAIL reply misses the asset body");
            missed += 1;
            continue;
        };
        match serde_json::from_str::<AssetMessage>(body) {
            Ok(message) => {
                if writer.state().update_from_asset(&message) {
                    changed = true;
                }
            }
            Err(err) => {
                warn!(asset = %name, error = %err, "ASSET_DETAIL reply is not an asset");
                missed += 1;
            }
        }
    }
    if missed > 0 {
        warn!(missed, "missed ASSET_DETAIL responses");
    }

    if changed {
        writer.commit();
    }
    info!(
        devices = writer.state().all_power_devices().len(),
        sensors = writer.state().sensors().len(),
        "initial assets request complete"
    );
}

/// Consume the asset and licensing streams until shutdown. Every commit
/// pings `catalog_changed`.
pub async fn run(
    bus: BusClient,
    mut writer: Writer,
    catalog_changed: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut assets = match bus.subscribe(subject::ASSET_EVENTS).await {
        Ok(subscriber) => subscriber,
        Err(err) => {
            error!(error = %err, "cannot subscribe to the asset stream");
            return;
        }
    };
    let mut licensing = match bus.subscribe(subject::LICENSING_EVENTS).await {
        Ok(subscriber) => subscriber,
        Err(err) => {
            error!(error = %err, "cannot subscribe to the licensing stream");
            return;
        }
    };

    hydrate(&bus, &mut writer).await;
    let _ = catalog_changed.try_send(());

    loop {
        tokio::select! {
            message = assets.next() => {
                let Some(message) = message else {
                    warn!("asset stream ended");
                    return;
                };
                match decode_json::<AssetMessage>(&message.payload) {
                    Ok(event) => {
                        if writer.state().update_from_asset(&event) {
                            writer.commit();
                            let _ = catalog_changed.try_send(());
                        }
                    }
                    Err(err) => error!(error = %err, "malformed asset event dropped"),
                }
            }
            message = licensing.next() => {
                let Some(message) = message else {
                    warn!("licensing stream ended");
                    return;
                };
                match decode_json::<MetricMessage>(&message.payload) {
                    Ok(metric) => {
                        if writer.state().update_from_licensing(&metric) {
                            writer.commit();
                            let _ = catalog_changed.try_send(());
                        }
                    }
                    Err(err) => error!(error = %err, "malformed licensing metric dropped"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("event ingress stopping");
                    return;
                }
            }
        }
    }
}
