use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kickr_bridge::{
    ble::BleManager,
    bridge::{BridgeAdapter, SessionDriver},
    config::{help_requested, USAGE},
    mqtt::{MqttConnection, MqttPublisher},
    session::{BleEvent, DeviceSession},
    BridgeConfig, BridgeError, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if help_requested(&args) {
        print!("{USAGE}");
        return Ok(());
    }

    let config = BridgeConfig::from_args(args)?;
    info!(
        "Starting kickr-bridge v{} for {}",
        kickr_bridge::VERSION,
        config.mac_address
    );

    let mut mqtt = MqttConnection::start(&config.mqtt, config.topics.subscriptions());
    let publisher = mqtt.publisher();

    let result = tokio::select! {
        result = run_bridge(&config, &publisher, &mut mqtt) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };

    if let Err(e) = mqtt.shutdown().await {
        warn!("Failed to disconnect from MQTT broker: {}", e);
    }

    if let Err(e) = &result {
        error!("Bridge stopped: {}", e);
    }
    result
}

/// Connect to the trainer and keep the session running, reconnecting a
/// bounded number of times
async fn run_bridge(
    config: &BridgeConfig,
    publisher: &MqttPublisher,
    mqtt: &mut MqttConnection,
) -> Result<()> {
    let ble = BleManager::new().await?;
    let adapter = BridgeAdapter::new(config.topics.clone(), config.device_name.clone());

    let initial_delay = Duration::from_millis(config.connection.retry_delay_ms);
    let mut delay = initial_delay;
    let mut attempts = 0;

    loop {
        let mut session = DeviceSession::new(config.mac_address.to_string());
        session.begin_connect()?;
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let err = match ble
            .connect(config.mac_address, &config.connection, events_tx)
            .await
        {
            Ok(connection) => {
                attempts = 0;
                delay = initial_delay;

                let stale = mqtt.discard_pending();
                if stale > 0 {
                    info!("Discarded {} command(s) received while disconnected", stale);
                }

                let driver = SessionDriver::new(&connection, publisher, &adapter, &config.timeouts);
                let outcome = driver.run(&mut session, &mut events, mqtt.inbound()).await;

                if let Err(e) = connection.disconnect().await {
                    warn!("Failed to disconnect from {}: {}", config.mac_address, e);
                }
                match outcome {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                }
            }
            Err(e) => match session.handle(BleEvent::ConnectFailed {
                reason: e.to_string(),
            }) {
                Err(failure) => failure,
                Ok(_) => e,
            },
        };

        if !err.is_connection_error() && !matches!(err, BridgeError::Timeout { .. }) {
            return Err(err);
        }

        if attempts >= config.connection.retry_attempts {
            error!(
                "Giving up on {} after {} reconnect attempt(s)",
                config.mac_address, attempts
            );
            return Err(err);
        }

        attempts += 1;
        warn!(
            "{}; reconnecting in {:?} (attempt {}/{})",
            err, delay, attempts, config.connection.retry_attempts
        );
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
}
