//! Bluetooth LE transport for the RFduino sensor.
//!
//! # Service UUIDs
//!
//! - `00002220-0000-1000-8000-00805f9b34fb` - RFduino service
//! - `00002221-...` - receive characteristic (notify, sensor to host)
//! - `00002222-...` - send characteristic (write, host to sensor)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::error::LinkError;
use crate::link::transport::{SensorTransport, TransportEvent};
use crate::link::types::{Device, DeviceId};

/// RFduino service UUID
pub const SENSOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x00002220_0000_1000_8000_00805f9b34fb);

/// Notification characteristic carrying inbound frames
pub const RECEIVE_CHAR_UUID: Uuid = Uuid::from_u128(0x00002221_0000_1000_8000_00805f9b34fb);

/// Write characteristic for configuration commands
pub const SEND_CHAR_UUID: Uuid = Uuid::from_u128(0x00002222_0000_1000_8000_00805f9b34fb);

struct BleConnection {
    device_id: DeviceId,
    peripheral: Peripheral,
    receive_char: Characteristic,
    send_char: Characteristic,
    notify_task: Option<JoinHandle<()>>,
    watch_task: JoinHandle<()>,
}

/// `SensorTransport` backed by the host Bluetooth adapter.
pub struct BleTransport {
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<DeviceId, Peripheral>>>,
    connection: Mutex<Option<BleConnection>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<TransportEvent>,
    closing: Arc<AtomicBool>,
}

fn transport_error(err: btleplug::Error) -> LinkError {
    LinkError::Transport {
        reason: err.to_string(),
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BleTransport {
    /// Open the first Bluetooth adapter.
    pub async fn new() -> Result<Self, LinkError> {
        let manager = Manager::new().await.map_err(transport_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(transport_error)?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Transport {
                reason: "No Bluetooth adapter found".to_string(),
            })?;

        let (events, _) = broadcast::channel(16);
        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            connection: Mutex::new(None),
            scan_task: Mutex::new(None),
            events,
            closing: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn describe(peripheral: &Peripheral) -> Option<Device> {
        let properties = peripheral.properties().await.ok()??;
        if !properties.services.is_empty() && !properties.services.contains(&SENSOR_SERVICE_UUID) {
            return None;
        }
        Some(Device {
            id: DeviceId::new(peripheral.address().to_string()),
            name: properties
                .local_name
                .unwrap_or_else(|| "eyeDrops".to_string()),
            rssi: properties.rssi.unwrap_or(0),
        })
    }

    async fn find_peripheral(&self, device_id: &DeviceId) -> Result<Peripheral, LinkError> {
        if let Some(peripheral) = guard(&self.peripherals).get(device_id).cloned() {
            return Ok(peripheral);
        }
        self.adapter
            .peripherals()
            .await
            .map_err(transport_error)?
            .into_iter()
            .find(|peripheral| peripheral.address().to_string() == device_id.as_str())
            .ok_or_else(|| LinkError::NotFound {
                device_id: device_id.to_string(),
            })
    }

    fn connected(
        &self,
        device_id: &DeviceId,
    ) -> Result<(Peripheral, Characteristic, Characteristic), LinkError> {
        match guard(&self.connection).as_ref() {
            Some(conn) if &conn.device_id == device_id => Ok((
                conn.peripheral.clone(),
                conn.receive_char.clone(),
                conn.send_char.clone(),
            )),
            _ => Err(LinkError::NotConnected),
        }
    }

    /// Forward adapter disconnect events for the connected peripheral
    async fn spawn_watch(&self, device_id: DeviceId, peripheral: &Peripheral) -> Result<JoinHandle<()>, LinkError> {
        let mut central_events = self.adapter.events().await.map_err(transport_error)?;
        let peripheral_id = peripheral.id();
        let events = self.events.clone();
        let closing = Arc::clone(&self.closing);

        Ok(tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        if !closing.load(Ordering::SeqCst) {
                            let _ = events.send(TransportEvent::ConnectionLost {
                                device_id: device_id.clone(),
                                reason: "peripheral disconnected".to_string(),
                            });
                        }
                        break;
                    }
                }
            }
        }))
    }
}

#[async_trait]
impl SensorTransport for BleTransport {
    async fn start_scan(&self) -> Result<mpsc::Receiver<Device>, LinkError> {
        let filter = ScanFilter {
            services: vec![SENSOR_SERVICE_UUID],
        };
        let mut central_events = self.adapter.events().await.map_err(transport_error)?;
        self.adapter.start_scan(filter).await.map_err(transport_error)?;
        tracing::info!("Starting BLE scan for eyeDrops sensors...");

        let (tx, rx) = mpsc::channel(64);
        let adapter = self.adapter.clone();
        let found = Arc::clone(&self.peripherals);
        guard(&found).clear();

        let task = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                if let Some(device) = Self::describe(&peripheral).await {
                    guard(&found).insert(device.id.clone(), peripheral);
                    if tx.send(device).await.is_err() {
                        break;
                    }
                }
            }
        });

        if let Some(previous) = guard(&self.scan_task).replace(task) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        if let Some(task) = guard(&self.scan_task).take() {
            task.abort();
        }
        self.adapter.stop_scan().await.map_err(transport_error)
    }

    async fn connect(&self, device_id: &DeviceId) -> Result<Device, LinkError> {
        let peripheral = self.find_peripheral(device_id).await?;
        self.closing.store(false, Ordering::SeqCst);

        peripheral.connect().await.map_err(transport_error)?;
        peripheral
            .discover_services()
            .await
            .map_err(transport_error)?;

        let mut receive_char = None;
        let mut send_char = None;
        for characteristic in peripheral.characteristics() {
            match characteristic.uuid {
                uuid if uuid == RECEIVE_CHAR_UUID => receive_char = Some(characteristic),
                uuid if uuid == SEND_CHAR_UUID => send_char = Some(characteristic),
                _ => {}
            }
        }
        let (Some(receive_char), Some(send_char)) = (receive_char, send_char) else {
            let _ = peripheral.disconnect().await;
            return Err(LinkError::Transport {
                reason: "sensor characteristics not found".to_string(),
            });
        };

        let device = Self::describe(&peripheral).await.unwrap_or_else(|| Device {
            id: device_id.clone(),
            name: "eyeDrops".to_string(),
            rssi: 0,
        });
        let watch_task = self.spawn_watch(device_id.clone(), &peripheral).await?;

        let previous = guard(&self.connection).replace(BleConnection {
            device_id: device_id.clone(),
            peripheral,
            receive_char,
            send_char,
            notify_task: None,
            watch_task,
        });
        if let Some(previous) = previous {
            previous.watch_task.abort();
            if let Some(task) = previous.notify_task {
                task.abort();
            }
        }

        tracing::info!("Connected to {}", device_id);
        Ok(Device {
            id: device_id.clone(),
            ..device
        })
    }

    async fn subscribe(&self, device_id: &DeviceId) -> Result<mpsc::Receiver<Vec<u8>>, LinkError> {
        let (peripheral, receive_char, _) = self.connected(device_id)?;
        peripheral
            .subscribe(&receive_char)
            .await
            .map_err(transport_error)?;
        let mut notifications = peripheral.notifications().await.map_err(transport_error)?;

        let (tx, rx) = mpsc::channel(1_024);
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != RECEIVE_CHAR_UUID {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
        });

        if let Some(conn) = guard(&self.connection).as_mut() {
            if let Some(previous) = conn.notify_task.replace(task) {
                previous.abort();
            }
        }
        tracing::debug!("Subscribed to sensor notifications");
        Ok(rx)
    }

    async fn unsubscribe(&self, device_id: &DeviceId) -> Result<(), LinkError> {
        let (peripheral, receive_char, _) = self.connected(device_id)?;
        if let Some(conn) = guard(&self.connection).as_mut() {
            if let Some(task) = conn.notify_task.take() {
                task.abort();
            }
        }
        peripheral
            .unsubscribe(&receive_char)
            .await
            .map_err(transport_error)
    }

    async fn write(&self, device_id: &DeviceId, payload: &[u8]) -> Result<(), LinkError> {
        let (peripheral, _, send_char) = self.connected(device_id)?;
        peripheral
            .write(&send_char, payload, WriteType::WithResponse)
            .await
            .map_err(|err| LinkError::WriteRejected {
                reason: err.to_string(),
            })
    }

    async fn disconnect(&self, device_id: &DeviceId) -> Result<(), LinkError> {
        let connection = {
            let mut slot = guard(&self.connection);
            match slot.as_ref() {
                Some(conn) if &conn.device_id == device_id => slot.take(),
                _ => None,
            }
        };

        if let Some(conn) = connection {
            self.closing.store(true, Ordering::SeqCst);
            conn.watch_task.abort();
            if let Some(task) = conn.notify_task {
                task.abort();
            }
            conn.peripheral.disconnect().await.map_err(transport_error)?;
            tracing::info!("Disconnected from {}", device_id);
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
