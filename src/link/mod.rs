//! Device link: wireless connection to one blink sensor.
//!
//! - `transport`: radio backend trait (`SensorTransport`)
//! - `protocol`: frame codec for the sensor firmware
//! - `queue`: drop-oldest sample queue between pump and consumer
//! - `device_link`: connection state machine, pump and reconnect supervisor
//! - `simulated`: scripted in-process sensor for tests and the CLI
//! - `btle`: Bluetooth LE backend (feature `ble`)

pub mod backoff;
pub mod device_link;
pub mod protocol;
pub mod queue;
pub mod simulated;
pub mod transport;
pub mod types;

#[cfg(feature = "ble")]
pub mod btle;

pub use backoff::Backoff;
pub use device_link::{DeviceLink, DeviceScan, SampleSubscription};
pub use protocol::{ClockUnwrapper, Command, InboundMessage, ProtocolError, RfduinoCodec, WireCodec};
pub use queue::{QueueStats, SampleQueue};
pub use simulated::SimulatedTransport;
pub use transport::{SensorTransport, TransportEvent};
pub use types::{Device, DeviceId, DisconnectReason, LinkState, Sample};

#[cfg(feature = "ble")]
pub use btle::BleTransport;
