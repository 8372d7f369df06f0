//! Value types shared by the device link and its consumers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque wireless address of a sensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Advertised sensor discovered by a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Signal strength in dBm
    pub rssi: i16,
}

/// Why the link left a connected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// `disconnect()` was called
    UserRequested,
    /// Connection dropped; reconnect attempts are running
    Transient,
    /// Reconnect attempts exhausted
    LinkLost,
}

/// Connection lifecycle of the device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Streaming,
    Disconnected(DisconnectReason),
}

impl LinkState {
    /// Connected or Streaming
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Streaming)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, LinkState::Disconnected(_))
    }
}

/// One timestamped reading from the sensor.
///
/// Timestamps are microseconds since link start and strictly increase
/// within one link session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp_us: u64,
    pub channels: Vec<i32>,
}

impl Sample {
    pub fn new(timestamp_us: u64, channels: Vec<i32>) -> Self {
        Self {
            timestamp_us,
            channels,
        }
    }

    /// Single-channel convenience constructor
    pub fn single(timestamp_us: u64, value: i32) -> Self {
        Self::new(timestamp_us, vec![value])
    }

    /// Reading for `channel`, if the frame carried it
    pub fn channel(&self, channel: usize) -> Option<i32> {
        self.channels.get(channel).copied()
    }
}
