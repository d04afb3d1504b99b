pub mod channels;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod growatt;
pub mod mqtt;
pub mod options;
pub mod prelude;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::coordinator::Coordinator;
use crate::mqtt::Mqtt;
use crate::prelude::*;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Long running pieces that need an orderly stop
pub struct Components {
    pub coordinator: Coordinator,
    pub mqtt: Arc<Mqtt>,
}

impl Components {
    /// Coordinator first so its summary covers everything received, then
    /// MQTT so the offline marker goes out last.
    pub fn stop(&self) {
        info!("Stopping all components...");
        self.coordinator.stop();
        self.mqtt.stop();
    }
}

/// Sets up env_logger; `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str) {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if let Err(e) = result {
        eprintln!("logging already initialised: {}", e);
    }
}

/// Opens the inverter, starts all tasks and runs until `shutdown` fires.
///
/// Failing to open the serial line here is the only fatal I/O error; once
/// running, the poller reconnects on its own.
pub async fn app(shutdown: broadcast::Sender<()>, config: ConfigWrapper) -> Result<()> {
    let mut shutdown_rx = shutdown.subscribe();

    info!("growatt-bridge {} starting", CARGO_PKG_VERSION);

    let inverter = config.inverter();
    let events = LogSink::shared("growatt_bridge");

    info!("Initializing channels...");
    let channels = Channels::new();

    info!("Initializing components...");

    info!("  Opening inverter at {}...", inverter.address());
    let mut transport = ModbusRtu::new(SerialSettings::from(&inverter), events.clone());
    transport
        .open()
        .await
        .map_err(|e| file_error!("unable to connect to inverter: {}", e))?;

    let (tx, rx) = poller::handoff();
    let mut poller = Poller::new(transport, PollSettings::from(&inverter), tx, events);

    if inverter.timesync_on_start() && poller.check_clock().await.is_none() {
        warn!("initial time check on inverter failed, continuing");
    }

    info!("  Creating MQTT client...");
    let coordinator = Coordinator::new(channels.clone());
    let mqtt = Arc::new(Mqtt::new(
        config.clone(),
        channels.clone(),
        coordinator.shared_stats.clone(),
    ));
    let mqtt_clone = mqtt.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt_clone.start().await {
            error!("MQTT task failed: {}", e);
        }
    });

    info!("  Creating Coordinator...");
    let coordinator_clone = coordinator.clone();
    let coordinator_handle = tokio::spawn(async move {
        if let Err(e) = coordinator_clone.start(rx).await {
            error!("Coordinator task failed: {}", e);
        }
    });

    info!("  Starting Poller...");
    let poller_handle = spawn_poller(poller, shutdown.clone());

    info!("Waiting for shutdown signal...");
    let _ = shutdown_rx.recv().await;
    info!("Shutdown signal received, stopping components...");

    // poller closes the serial line and drops the handoff, which ends the coordinator
    if let Err(e) = poller_handle.await {
        error!("Error waiting for poller task: {}", e);
    }
    if let Err(e) = coordinator_handle.await {
        error!("Error waiting for coordinator task: {}", e);
    }

    let components = Components { coordinator, mqtt };
    components.stop();

    match tokio::time::timeout(Duration::from_secs(10), mqtt_handle).await {
        Ok(Err(e)) => error!("Error waiting for MQTT task: {}", e),
        Err(_) => warn!("MQTT task did not stop in time"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}

/// Runs the poller until `shutdown` fires. If it stops on its own, a
/// shutdown is broadcast so the rest of the app winds down with it.
pub fn spawn_poller<T>(mut poller: Poller<T>, shutdown: broadcast::Sender<()>) -> JoinHandle<()>
where
    T: Transport + 'static,
{
    let poller_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        if let Err(e) = poller.run(poller_shutdown).await {
            error!("Poller task failed: {}", e);
            let _ = shutdown.send(());
        }
    })
}

/// Loads config, wires up signal handling and the optional runtime limit,
/// then runs `app`.
pub async fn run(options: Options) -> Result<()> {
    let config = ConfigWrapper::new(options.config_file.clone())?;
    init_logging(&config.loglevel());
    info!("Read configuration from {}", options.config_file);
    config.log_summary();

    let (shutdown_tx, _) = broadcast::channel(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl+c: {}", e);
        }
        info!("ctrl+c received");
        let _ = shutdown_tx_clone.send(());
    });

    if let Some(secs) = options.runtime {
        let shutdown_tx_clone = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!("runtime limit of {}s reached", secs);
            let _ = shutdown_tx_clone.send(());
        });
    }

    app(shutdown_tx, config).await
}
