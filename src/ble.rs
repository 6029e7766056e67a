use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::{collections::HashMap, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{BridgeError, Result},
    session::{BleEvent, DiscoveredService},
    types::ConnectionParams,
};

/// Interval between peripheral list checks while scanning
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// GATT operations the session driver needs from a connected device
#[async_trait]
pub trait GattClient: Send + Sync {
    /// Write with response to a characteristic
    ///
    /// # Errors
    ///
    /// Returns an error if the characteristic is unknown or the device
    /// rejects the write.
    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<()>;

    /// Enable notifications or indications on a characteristic
    ///
    /// # Errors
    ///
    /// Returns an error if the characteristic is unknown or the request fails.
    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Read the current value of a characteristic
    ///
    /// # Errors
    ///
    /// Returns an error if the characteristic is unknown or the read fails.
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;
}

/// BLE manager for KICKR trainers
pub struct BleManager {
    adapter: Adapter,
}

impl BleManager {
    /// Create a new BLE manager on the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Ble`] if the Bluetooth stack cannot be initialized,
    /// or [`BridgeError::ConnectionFailed`] if no adapter is available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::ConnectionFailed("no Bluetooth adapter available".into()))?;

        Ok(Self { adapter })
    }

    /// Scan until the peripheral with `address` is seen
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceNotFound`] if the device is not seen
    /// within the scan timeout, or [`BridgeError::Ble`] if scanning fails.
    pub async fn find_device(
        &self,
        address: BDAddr,
        params: &ConnectionParams,
    ) -> Result<Peripheral> {
        info!("Scanning for KICKR {}...", address);

        self.adapter.start_scan(ScanFilter::default()).await?;

        let found = timeout(Duration::from_millis(params.scan_timeout_ms), async {
            loop {
                let peripherals = self.adapter.peripherals().await?;
                if let Some(peripheral) = peripherals.into_iter().find(|p| p.address() == address)
                {
                    return Ok::<_, BridgeError>(peripheral);
                }
                tokio::time::sleep(SCAN_POLL_INTERVAL).await;
            }
        })
        .await;

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        match found {
            Ok(peripheral) => {
                let peripheral = peripheral?;
                if let Ok(Some(properties)) = peripheral.properties().await {
                    info!(
                        "Found {} ({}), RSSI {:?}",
                        properties.local_name.as_deref().unwrap_or("unnamed device"),
                        address,
                        properties.rssi
                    );
                }
                Ok(peripheral)
            }
            Err(_) => Err(BridgeError::DeviceNotFound {
                address: address.to_string(),
            }),
        }
    }

    /// Connect to the trainer and resolve its services
    ///
    /// On success `events` receives [`BleEvent::Connected`] followed by
    /// [`BleEvent::ServicesResolved`]; afterwards it carries every
    /// notification as [`BleEvent::CharacteristicUpdated`] and a final
    /// [`BleEvent::Disconnected`] when the link drops.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceNotFound`] if the device cannot be found,
    /// [`BridgeError::Timeout`] if connection times out,
    /// [`BridgeError::ConnectionFailed`] if connection fails,
    /// or [`BridgeError::Ble`] if service discovery fails.
    pub async fn connect(
        &self,
        address: BDAddr,
        params: &ConnectionParams,
        events: mpsc::UnboundedSender<BleEvent>,
    ) -> Result<KickrConnection> {
        let peripheral = self.find_device(address, params).await?;

        info!("Connecting to device: {}", address);
        timeout(Duration::from_millis(params.timeout_ms), peripheral.connect())
            .await
            .map_err(|_| BridgeError::Timeout {
                timeout_ms: params.timeout_ms,
            })?
            .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?;
        // receivers only go away when the session is over
        let _ = events.send(BleEvent::Connected);

        peripheral.discover_services().await?;

        let services = peripheral.services();
        let mut characteristics = HashMap::new();
        let mut discovered = Vec::with_capacity(services.len());
        for service in &services {
            discovered.push(DiscoveredService {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            });
            for characteristic in &service.characteristics {
                characteristics.insert(characteristic.uuid, characteristic.clone());
            }
        }

        let notifications = peripheral.notifications().await?;
        let central_events = self.adapter.events().await?;

        let _ = events.send(BleEvent::ServicesResolved {
            services: discovered,
        });

        let tasks = vec![
            tokio::spawn(forward_notifications(notifications, events.clone())),
            tokio::spawn(watch_disconnect(central_events, peripheral.id(), events)),
        ];

        info!("Successfully connected to {}", address);

        Ok(KickrConnection {
            peripheral,
            characteristics,
            tasks,
        })
    }
}

/// Active connection to a KICKR trainer
pub struct KickrConnection {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
    tasks: Vec<JoinHandle<()>>,
}

impl KickrConnection {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .get(&uuid)
            .ok_or_else(|| BridgeError::Protocol(format!("characteristic {uuid} not discovered")))
    }

    /// Check if the device is still connected
    pub async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    /// Get device address
    #[must_use]
    pub fn address(&self) -> BDAddr {
        self.peripheral.address()
    }

    /// Stop event forwarding and disconnect from the device
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Ble`] if disconnection fails.
    pub async fn disconnect(self) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }
        if self.is_connected().await {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

impl Drop for KickrConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl GattClient for KickrConnection {
    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        debug!("Writing {:02X?} to {}", payload, characteristic.uuid);

        self.peripheral
            .write(characteristic, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.subscribe(characteristic).await?;
        info!("Notifications enabled for {}", characteristic.uuid);
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(characteristic).await?)
    }
}

/// Forward notifications as session events until the stream ends
async fn forward_notifications<S>(mut notifications: S, sender: mpsc::UnboundedSender<BleEvent>)
where
    S: futures::Stream<Item = btleplug::api::ValueNotification> + Unpin,
{
    while let Some(data) = notifications.next().await {
        let event = BleEvent::CharacteristicUpdated {
            uuid: data.uuid,
            value: data.value,
        };
        if sender.send(event).is_err() {
            return;
        }
    }

    debug!("Notification stream closed");
    let _ = sender.send(BleEvent::Disconnected);
}

/// Report a disconnect of `id` seen by the adapter
async fn watch_disconnect<S>(
    mut central_events: S,
    id: btleplug::platform::PeripheralId,
    sender: mpsc::UnboundedSender<BleEvent>,
) where
    S: futures::Stream<Item = CentralEvent> + Unpin,
{
    while let Some(event) = central_events.next().await {
        if matches!(&event, CentralEvent::DeviceDisconnected(peripheral) if *peripheral == id) {
            let _ = sender.send(BleEvent::Disconnected);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btleplug::api::ValueNotification;
    use futures::stream;

    #[tokio::test]
    async fn test_notifications_become_session_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifications = stream::iter(vec![
            ValueNotification {
                uuid: crate::INDOOR_BIKE_DATA_UUID,
                value: vec![0x44, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            },
            ValueNotification {
                uuid: crate::FTMS_CONTROL_POINT_UUID,
                value: vec![0x80, 0x00, 0x01],
            },
        ]);

        forward_notifications(notifications, tx).await;

        assert_eq!(
            rx.recv().await,
            Some(BleEvent::CharacteristicUpdated {
                uuid: crate::INDOOR_BIKE_DATA_UUID,
                value: vec![0x44, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            })
        );
        assert!(matches!(
            rx.recv().await,
            Some(BleEvent::CharacteristicUpdated { uuid, .. }) if uuid == crate::FTMS_CONTROL_POINT_UUID
        ));
        assert_eq!(rx.recv().await, Some(BleEvent::Disconnected));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_forwarding_stops_when_session_ends() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let notifications = stream::iter(vec![ValueNotification {
            uuid: crate::INDOOR_BIKE_DATA_UUID,
            value: vec![0x01, 0x00],
        }]);

        // returns instead of looping on a closed channel
        forward_notifications(notifications, tx).await;
    }
}
