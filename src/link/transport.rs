//! Radio backend abstraction for the device link.
//!
//! A transport moves raw frames; it knows nothing about link states,
//! reconnect policy or sample decoding. `DeviceLink` layers those on top.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::LinkError;
use crate::link::types::{Device, DeviceId};

/// Unsolicited notifications raised by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The peripheral dropped the connection without being asked to.
    ConnectionLost { device_id: DeviceId, reason: String },
}

/// Wireless backend for one sensor at a time.
///
/// Implementations must be cancel-safe: dropping any returned future
/// leaves the backend in a state where the same call can be retried.
#[async_trait]
pub trait SensorTransport: Send + Sync {
    /// Start advertising discovery. Devices arrive on the returned channel
    /// until `stop_scan` is called; duplicates are allowed.
    async fn start_scan(&self) -> Result<mpsc::Receiver<Device>, LinkError>;

    async fn stop_scan(&self) -> Result<(), LinkError>;

    /// Establish the connection and discover the sensor characteristics.
    async fn connect(&self, device_id: &DeviceId) -> Result<Device, LinkError>;

    /// Enable notifications; raw frames arrive on the returned channel,
    /// which closes when the connection ends.
    async fn subscribe(&self, device_id: &DeviceId) -> Result<mpsc::Receiver<Vec<u8>>, LinkError>;

    async fn unsubscribe(&self, device_id: &DeviceId) -> Result<(), LinkError>;

    /// Acknowledged write to the configuration characteristic.
    async fn write(&self, device_id: &DeviceId, payload: &[u8]) -> Result<(), LinkError>;

    async fn disconnect(&self, device_id: &DeviceId) -> Result<(), LinkError>;

    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
