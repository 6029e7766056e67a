#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # kickr-bridge
//!
//! Bridges a Wahoo KICKR smart trainer (with KICKR Climb) to MQTT over
//! Bluetooth Low Energy.
//!
//! The trainer exposes the standard Fitness Machine Service (FTMS). Its
//! Indoor Bike Data notifications are decoded and republished as JSON on
//! per-metric topics. Resistance commands go through the FTMS control point;
//! incline commands go through a vendor-specific characteristic whose
//! encoding was recovered from sniffer captures.
//!
//! ## Data flow
//!
//! - BLE notification → [`telemetry::parse_indoor_bike_data`] → idle filter →
//!   `bike/<id>/speed`, `bike/<id>/cadence`, `bike/<id>/power`
//! - `bike/<id>/resistance` → request control (`0x00`) → set target
//!   resistance (`0x04`) → `bike/<id>/resistance/report`
//! - `bike/<id>/incline` → vendor incline write (`0x66`) →
//!   `bike/<id>/incline/report`
//!
//! [`session::DeviceSession`] holds all connection state and performs no I/O.
//! It is driven by [`bridge::SessionDriver`], which awaits every GATT write
//! acknowledgement before the next dependent write is issued.
//!
//! ## Quick Start
//!
//! ```no_run
//! use kickr_bridge::{
//!     ble::BleManager, bridge::{BridgeAdapter, SessionDriver},
//!     mqtt::MqttConnection, session::DeviceSession, BridgeConfig,
//! };
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::from_args(std::env::args().skip(1))?;
//!     let mut mqtt = MqttConnection::start(&config.mqtt, config.topics.subscriptions());
//!     let publisher = mqtt.publisher();
//!     let adapter = BridgeAdapter::new(config.topics.clone(), config.device_name.clone());
//!
//!     let ble = BleManager::new().await?;
//!     let (events_tx, mut events) = mpsc::unbounded_channel();
//!     let mut session = DeviceSession::new(config.mac_address.to_string());
//!     session.begin_connect()?;
//!     let connection = ble.connect(config.mac_address, &config.connection, events_tx).await?;
//!
//!     SessionDriver::new(&connection, &publisher, &adapter, &config.timeouts)
//!         .run(&mut session, &mut events, mqtt.inbound())
//!         .await?;
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Bluetooth Low Energy communication module
pub mod ble;
/// MQTT bridge adapter and session driver
pub mod bridge;
/// Command-line configuration
pub mod config;
/// Error types and handling
pub mod error;
/// MQTT client
pub mod mqtt;
/// FTMS control point and vendor incline encodings
pub mod protocol;
/// Device session state machine
pub mod session;
/// Indoor Bike Data decoding
pub mod telemetry;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use config::{BridgeConfig, MqttConfig, Topics};
pub use error::{BridgeError, Result};
pub use session::{BleEvent, DeviceSession, Report, SessionAction};
pub use types::{
    Channel, Command, ConnectionParams, Incline, SessionState, TelemetryRecord, TimeoutConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fitness Machine Service (0x1826)
pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Indoor Bike Data characteristic (0x2AD2), notify
pub const INDOOR_BIKE_DATA_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad2_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Control Point characteristic (0x2AD9), write + indicate
pub const FTMS_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);

/// Supported Resistance Level Range characteristic (0x2AD6), read
pub const RESISTANCE_LEVEL_RANGE_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad6_0000_1000_8000_0080_5f9b_34fb);

/// Supported Inclination Range characteristic (0x2AD5), read
pub const INCLINATION_RANGE_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad5_0000_1000_8000_0080_5f9b_34fb);

/// Wahoo incline control service
///
/// Not part of the Bluetooth SIG assigned numbers. The KICKR exposes it when
/// a KICKR Climb is attached.
pub const INCLINE_CONTROL_SERVICE_UUID: Uuid =
    Uuid::from_u128(0xa026_ee0b_0a7d_4ab3_97fa_f150_0f9f_eb8b);

/// Wahoo incline control characteristic
///
/// Accepts `[0x66, low, high]` writes; notifications must be enabled before
/// the KICKR Climb acts on them.
pub const INCLINE_CONTROL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xa026_e037_0a7d_4ab3_97fa_f150_0f9f_eb8b);
