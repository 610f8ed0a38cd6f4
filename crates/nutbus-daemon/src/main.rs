//! nutbus daemon entry point
//!
//! Wires the subsystems together: bus connections, snapshot state,
//! configuration pipeline, polling engines and the command tracker.
//! Only two failures are fatal: the startup bus connection and the
//! command-path NUT session.

mod autoconfig;
mod config;
mod control;
mod ingress;
mod tasks;

use autoconfig::{Autoconfig, RescanPolicy};
use clap::Parser;
use config::DaemonConfig;
use control::ActorCommand;
use nutbus_client::NutClient;
use nutbus_command::{CommandConnector, CommandTracker};
use nutbus_configure::drivers::DriverLifecycle;
use nutbus_configure::manager::{ConfigurationManager, ManagerOptions};
use nutbus_configure::repository::ConfigRepository;
use nutbus_configure::scan::Scanner;
use nutbus_configure::store::CandidateStore;
use nutbus_monitor::alert::AlertEngine;
use nutbus_monitor::sensors::Sensors;
use nutbus_monitor::NutAgent;
use nutbus_proto::BusClient;
use nutbus_state::StateManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "nutbus-daemon")]
#[command(about = "Bridges NUT-managed power devices to the message bus")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose log output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };

    let default_level = if args.verbose || config.log.verbose {
        "nutbus=debug"
    } else {
        "nutbus=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
    if let Some(path) = &args.config {
        info!(path = %path.display(), "loaded configuration file");
    }

    // global shutdown flag, flipped by ctrl-c, $TERM or a fatal abort
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (control_tx, _) = broadcast::channel::<ActorCommand>(16);

    // bus connection (fatal when unreachable at startup)
    let bus = BusClient::connect(&config.bus.url, &config.bus.agent_name).await?;

    // command-path NUT session (fatal when it cannot be established)
    let mut command_nut = NutClient::connect(&config.nut.host, nutbus_client::client::DEFAULT_PORT)
        .await
        .map_err(|err| anyhow::anyhow!("command-path NUT session failed: {err}"))?;
    if !config.nut.username.is_empty() {
        command_nut
            .authenticate(&config.nut.username, &config.nut.password)
            .await
            .map_err(|err| anyhow::anyhow!("command-path NUT login failed: {err}"))?;
    }

    // snapshot state: one writer (ingress), one reader per engine
    let state = StateManager::new();
    let writer = state.writer();

    // configuration pipeline
    let drivers = Arc::new(DriverLifecycle::new());
    let manager = Arc::new(ConfigurationManager::new(
        CandidateStore::open(&config.configuration.candidate_store_directory)?,
        ConfigRepository::new(&config.configuration.nut_repository_directory),
        drivers.clone(),
        Scanner::new(config.configuration.thread_pool_scanner_size),
        ManagerOptions {
            automatic_priority_sort: config.preferences.automatic_priority_sort,
            prefer_dmf_for_snmp: config.preferences.prefer_dmf_for_snmp,
            scan_dummy_ups: config.preferences.scan_dummy_ups,
            scan_timeout_secs: nutbus_configure::scan::SCAN_TIMEOUT_SECS,
            polling_interval_secs: config.nut.polling_interval,
        },
    ));

    let polling = config.nut.polling_interval;
    let mut agent = NutAgent::new(state.reader());
    let mut sensors = Sensors::new(state.reader());
    if config.configuration.mapping_file.exists() {
        if let Err(err) = agent.load_mapping(&config.configuration.mapping_file) {
            error!(error = %err, "device mapping load failed");
        }
        if let Err(err) = sensors.load_mapping(&config.configuration.mapping_file) {
            error!(error = %err, "sensor mapping load failed");
        }
    }
    let alerts = AlertEngine::new(state.reader());
    let autoconfig = Autoconfig::new(state.reader());

    // command tracker over its own NUT session; a lost session flips
    // the shutdown flag so the supervisor restarts us
    let (completion_tx, completion_rx) = mpsc::unbounded_channel();
    let tracker = CommandTracker::spawn(command_nut, completion_tx, shutdown_tx.clone());
    let connector = CommandConnector::new(bus.clone(), tracker);

    let (catalog_changed_tx, catalog_changed_rx) = mpsc::channel(8);

    info!("nutbus starting");

    let mut workers = tokio::task::JoinSet::new();
    workers.spawn(tasks::run_control(
        bus.clone(),
        control_tx.clone(),
        shutdown_tx.clone(),
        shutdown_rx.clone(),
    ));
    workers.spawn(ingress::run(
        bus.clone(),
        writer,
        catalog_changed_tx,
        shutdown_rx.clone(),
    ));
    workers.spawn(tasks::run_autoconfig(
        bus.clone(),
        autoconfig,
        manager.clone(),
        RescanPolicy {
            on_start: config.rescan_policy.on_start,
            on_create: config.rescan_policy.on_security_wallet_create,
            on_update: config.rescan_policy.on_security_wallet_update,
            on_delete: config.rescan_policy.on_security_wallet_delete,
        },
        catalog_changed_rx,
        shutdown_rx.clone(),
    ));
    {
        let drivers = drivers.clone();
        let shutdown = shutdown_rx.clone();
        workers.spawn(async move { drivers.run(shutdown).await });
    }
    workers.spawn(tasks::run_device_poll(
        agent,
        bus.clone(),
        control_tx.subscribe(),
        shutdown_rx.clone(),
        polling,
    ));
    workers.spawn(tasks::run_alert_poll(
        alerts,
        bus.clone(),
        control_tx.subscribe(),
        shutdown_rx.clone(),
        polling,
    ));
    workers.spawn(tasks::run_sensor_poll(
        sensors,
        bus.clone(),
        control_tx.subscribe(),
        shutdown_rx.clone(),
        polling,
    ));
    workers.spawn(connector.run(completion_rx, shutdown_rx.clone()));

    info!("nutbus started");

    // wait for ctrl-c or an internal shutdown ($TERM, command abort)
    let mut shutdown_wait = shutdown_rx.clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
        _ = shutdown_wait.changed() => {
            info!("shutdown requested");
        }
    }

    // give the tasks a moment to drain, then stop waiting
    let drain = async {
        while workers.join_next().await.is_some() {}
    };
    if tokio::time::timeout(std::time::Duration::from_secs(10), drain)
        .await
        .is_err()
    {
        error!("some tasks did not stop in time");
    }

    info!("nutbus ended");
    Ok(())
}
