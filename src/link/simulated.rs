use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::LinkError;
use crate::link::protocol::RfduinoCodec;
use crate::link::transport::{SensorTransport, TransportEvent};
use crate::link::types::{Device, DeviceId};

const FRAME_BUFFER: usize = 4_096;

/// In-process sensor used for deterministic testing and CLI tooling.
///
/// The owner scripts the radio side: which devices advertise, which
/// frames arrive, when the connection drops, and whether writes or
/// connects fail. Every successful write is recorded.
pub struct SimulatedTransport {
    state: Mutex<SimState>,
    events: broadcast::Sender<TransportEvent>,
}

#[derive(Default)]
struct SimState {
    advertised: Vec<Device>,
    scan_tx: Option<mpsc::Sender<Device>>,
    connected: Option<DeviceId>,
    frames_tx: Option<mpsc::Sender<Vec<u8>>>,
    written: Vec<Vec<u8>>,
    reject_writes: bool,
    failing_connects: u32,
    hang_connects: bool,
    connect_count: u32,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(SimState::default()),
            events,
        }
    }

    /// Transport advertising a single device
    pub fn with_device(device: Device) -> Self {
        let transport = Self::new();
        transport.advertise(device);
        transport
    }

    /// Start advertising `device`; an active scan sees it immediately.
    pub fn advertise(&self, device: Device) {
        let mut state = self.lock();
        if let Some(tx) = &state.scan_tx {
            let _ = tx.try_send(device.clone());
        }
        state.advertised.retain(|known| known.id != device.id);
        state.advertised.push(device);
    }

    /// Stop advertising; later connects fail with NotFound.
    pub fn vanish(&self, device_id: &DeviceId) {
        self.lock().advertised.retain(|known| &known.id != device_id);
    }

    /// Deliver a raw notification frame. Returns false when nobody is
    /// subscribed or the frame buffer is full.
    pub fn push_frame(&self, frame: Vec<u8>) -> bool {
        match &self.lock().frames_tx {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Deliver one single-channel SensorData frame
    pub fn push_sample(&self, device_time_us: u32, value: i16) -> bool {
        self.push_frame(RfduinoCodec::sensor_frame(device_time_us, &[value]))
    }

    /// Deliver consecutive samples `period_us` apart; returns the next
    /// device time.
    pub fn push_samples(&self, start_us: u32, period_us: u32, values: &[i16]) -> u32 {
        let mut time = start_us;
        for value in values {
            self.push_sample(time, *value);
            time = time.wrapping_add(period_us);
        }
        time
    }

    /// Drop the connection as if the sensor walked out of range.
    pub fn drop_link(&self, reason: &str) {
        let device_id = {
            let mut state = self.lock();
            state.frames_tx = None;
            state.connected.take()
        };
        if let Some(device_id) = device_id {
            let _ = self.events.send(TransportEvent::ConnectionLost {
                device_id,
                reason: reason.to_string(),
            });
        }
    }

    pub fn set_reject_writes(&self, reject: bool) {
        self.lock().reject_writes = reject;
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// Make connects never complete (exercises the handshake timeout)
    pub fn set_hang_connects(&self, hang: bool) {
        self.lock().hang_connects = hang;
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connect_count
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected.is_some()
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().frames_tx.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_connected(&self, device_id: &DeviceId) -> Result<(), LinkError> {
        match &self.lock().connected {
            Some(connected) if connected == device_id => Ok(()),
            _ => Err(LinkError::NotConnected),
        }
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SensorTransport for SimulatedTransport {
    async fn start_scan(&self) -> Result<mpsc::Receiver<Device>, LinkError> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.lock();
        for device in &state.advertised {
            let _ = tx.try_send(device.clone());
        }
        state.scan_tx = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.lock().scan_tx = None;
        Ok(())
    }

    async fn connect(&self, device_id: &DeviceId) -> Result<Device, LinkError> {
        let hang = {
            let mut state = self.lock();
            state.connect_count += 1;
            state.hang_connects
        };
        if hang {
            futures::future::pending::<()>().await;
        }

        let mut state = self.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(LinkError::Transport {
                reason: "simulated connect failure".to_string(),
            });
        }
        let device = state
            .advertised
            .iter()
            .find(|device| &device.id == device_id)
            .cloned()
            .ok_or_else(|| LinkError::NotFound {
                device_id: device_id.to_string(),
            })?;
        state.connected = Some(device_id.clone());
        Ok(device)
    }

    async fn subscribe(&self, device_id: &DeviceId) -> Result<mpsc::Receiver<Vec<u8>>, LinkError> {
        self.require_connected(device_id)?;
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        self.lock().frames_tx = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, _device_id: &DeviceId) -> Result<(), LinkError> {
        self.lock().frames_tx = None;
        Ok(())
    }

    async fn write(&self, device_id: &DeviceId, payload: &[u8]) -> Result<(), LinkError> {
        self.require_connected(device_id)?;
        let mut state = self.lock();
        if state.reject_writes {
            return Err(LinkError::WriteRejected {
                reason: "simulated NAK".to_string(),
            });
        }
        state.written.push(payload.to_vec());
        Ok(())
    }

    async fn disconnect(&self, _device_id: &DeviceId) -> Result<(), LinkError> {
        let mut state = self.lock();
        state.connected = None;
        state.frames_tx = None;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
