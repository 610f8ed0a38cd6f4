//! Long-lived daemon tasks
//!
//! Each subsystem is one task with a polling cadence, a control
//! receiver (CONFIGURE/POLLING/$TERM) and the global shutdown flag.
//! Transient errors are logged and retried on the next cycle; nothing
//! here aborts the main loop.

use crate::autoconfig::{Autoconfig, CredentialEvent, RescanPolicy};
use crate::control::{parse_command, ActorCommand, CONTROL_SUBJECT};
use futures::StreamExt;
use nutbus_client::NutClient;
use nutbus_configure::ConfigurationManager;
use nutbus_monitor::alert::AlertEngine;
use nutbus_monitor::sensors::Sensors;
use nutbus_monitor::NutAgent;
use nutbus_proto::bus::{decode_frames, decode_json};
use nutbus_proto::{subject, BusClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Listen on the control mailbox and fan commands out to the
/// subsystems. `$TERM` flips the shutdown flag.
pub async fn run_control(
    bus: BusClient,
    control_tx: broadcast::Sender<ActorCommand>,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut messages = match bus.subscribe(CONTROL_SUBJECT).await {
        Ok(subscriber) => subscriber,
        Err(err) => {
            error!(error = %err, "cannot subscribe to the control mailbox");
            return;
        }
    };

    loop {
        tokio::select! {
            message = messages.next() => {
                let Some(message) = message else { return };
                let frames = match decode_frames(&message.payload) {
                    Ok(frames) => frames,
                    Err(err) => {
                        error!(error = %err, "malformed control message dropped");
                        continue;
                    }
                };
                match parse_command(&frames) {
                    Some(ActorCommand::Term) => {
                        let _ = shutdown_tx.send(true);
                        return;
                    }
                    Some(command) => {
                        let _ = control_tx.send(command);
                    }
                    None => {}
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Device polling loop: metrics and inventory on the polling cadence.
pub async fn run_device_poll(
    mut agent: NutAgent,
    bus: BusClient,
    mut control: broadcast::Receiver<ActorCommand>,
    mut shutdown: watch::Receiver<bool>,
    polling_secs: u64,
) {
    let mut polling = Duration::from_secs(polling_secs);
    agent.set_ttl(polling_secs * 2);
    info!("device polling engine started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(polling) => {
                debug!("periodic device polling");
                agent.update_device_list();
                match NutClient::connect_local().await {
                    Ok(mut nut) => agent.on_poll(&mut nut, &bus).await,
                    Err(err) => warn!(error = %err, "cannot reach NUT daemon, retrying next cycle"),
                }
            }
            command = control.recv() => match command {
                Ok(ActorCommand::Configure(path)) => {
                    if let Err(err) = agent.load_mapping(&path) {
                        error!(path = %path.display(), error = %err, "mapping load failed");
                    }
                }
                Ok(ActorCommand::Polling(secs)) => {
                    polling = Duration::from_secs(secs);
                    agent.set_ttl(secs * 2);
                }
                Ok(ActorCommand::Term) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("device polling engine stopping");
                    return;
                }
            }
        }
    }
}

/// Alert scanning loop: rule definitions and alert events.
pub async fn run_alert_poll(
    mut engine: AlertEngine,
    bus: BusClient,
    mut control: broadcast::Receiver<ActorCommand>,
    mut shutdown: watch::Receiver<bool>,
    polling_secs: u64,
) {
    let mut polling = Duration::from_secs(polling_secs);
    engine.set_polling_secs(polling_secs);
    info!("alert scanner started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(polling) => {
                debug!("periodic alert polling");
                engine.update_device_list();
                match NutClient::connect_local().await {
                    Ok(mut nut) => {
                        if let Err(err) = engine.on_poll(&mut nut, &bus).await {
                            warn!(error = %err, "alert cycle failed");
                        }
                    }
                    Err(err) => warn!(error = %err, "cannot reach NUT daemon, retrying next cycle"),
                }
            }
            command = control.recv() => match command {
                Ok(ActorCommand::Polling(secs)) => {
                    polling = Duration::from_secs(secs);
                    engine.set_polling_secs(secs);
                }
                Ok(ActorCommand::Configure(_)) => {}
                Ok(ActorCommand::Term) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("alert scanner stopping");
                    return;
                }
            }
        }
    }
}

/// Sensor polling loop: topology refresh, measurements, inventory.
pub async fn run_sensor_poll(
    mut sensors: Sensors,
    bus: BusClient,
    mut control: broadcast::Receiver<ActorCommand>,
    mut shutdown: watch::Receiver<bool>,
    polling_secs: u64,
) {
    let mut polling = Duration::from_secs(polling_secs);
    sensors.set_polling_secs(polling_secs);
    info!("sensor polling engine started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(polling) => {
                debug!("periodic sensor polling");
                match NutClient::connect_local().await {
                    Ok(mut nut) => {
                        sensors.update_sensor_list(&mut nut, &bus).await;
                        sensors.update_from_nut(&mut nut).await;
                        sensors.advertise_inventory(&bus).await;
                        sensors.publish(&bus).await;
                    }
                    Err(err) => warn!(error = %err, "cannot reach NUT daemon, retrying next cycle"),
                }
            }
            command = control.recv() => match command {
                Ok(ActorCommand::Configure(path)) => {
                    if let Err(err) = sensors.load_mapping(&path) {
                        error!(path = %path.display(), error = %err, "sensor mapping load failed");
                    }
                }
                Ok(ActorCommand::Polling(secs)) => {
                    polling = Duration::from_secs(secs);
                    sensors.set_polling_secs(secs);
                }
                Ok(ActorCommand::Term) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("sensor polling engine stopping");
                    return;
                }
            }
        }
    }
}

/// Autoconfiguration loop: wakes on catalog changes, credential events
/// or the per-state timeout.
#[allow(clippy::too_many_arguments)]
pub async fn run_autoconfig(
    bus: BusClient,
    mut autoconfig: Autoconfig,
    manager: Arc<ConfigurationManager>,
    policy: RescanPolicy,
    mut catalog_changed: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut credential_events = match bus.subscribe(subject::CREDENTIAL_EVENTS).await {
        Ok(subscriber) => subscriber,
        Err(err) => {
            error!(error = %err, "cannot subscribe to credential events");
            return;
        }
    };

    autoconfig.refresh_credentials(&bus).await;
    if policy.on_start {
        autoconfig.rescan_all();
    }
    info!("autoconfiguration scheduler started");

    loop {
        let wait = autoconfig.timeout();
        tokio::select! {
            _ = async {
                match wait {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    // nothing scheduled; sleep until an event arrives
                    None => std::future::pending::<()>().await,
                }
            } => {
                debug!("periodic autoconfiguration pass");
                autoconfig.on_poll(&manager).await;
            }
            changed = catalog_changed.recv() => {
                if changed.is_none() {
                    return;
                }
                let known = manager
                    .repository()
                    .known_assets()
                    .unwrap_or_default();
                autoconfig.on_update(&known);
            }
            message = credential_events.next() => {
                let Some(message) = message else {
                    warn!("credential event stream ended");
                    return;
                };
                match decode_json::<CredentialEvent>(&message.payload) {
                    Ok(event) => {
                        autoconfig
                            .on_credential_event(&bus, &manager, &event, policy)
                            .await;
                    }
                    Err(err) => error!(error = %err, "malformed credential event dropped"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("autoconfiguration scheduler stopping");
                    return;
                }
            }
        }
    }
}
