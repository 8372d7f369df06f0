//! DeviceLink: connection lifecycle for one sensor.
//!
//! State lives behind a single mutex and every transition happens while
//! holding it, so observers never see a half-applied change. Long-running
//! work (scans, connects, the sample pump, reconnects) runs outside the
//! lock and re-checks an epoch counter before committing its result; any
//! user operation that takes over the link bumps the epoch, which turns
//! stale completions into no-ops.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::{LinkConfig, QueueConfig};
use crate::error::{log_link_error, ErrorCode, LinkError};
use crate::link::backoff::Backoff;
use crate::link::protocol::{ClockUnwrapper, Command, InboundMessage, RfduinoCodec, WireCodec};
use crate::link::queue::{QueueStats, SampleQueue};
use crate::link::transport::{SensorTransport, TransportEvent};
use crate::link::types::{Device, DeviceId, DisconnectReason, LinkState, Sample};
use crate::managers::{CoreEvent, EventBus};
use crate::profile::Profile;
use crate::telemetry::{self, DiagnosticError};

/// Handle to the device link. Clones share the same connection.
#[derive(Clone)]
pub struct DeviceLink {
    shared: Arc<LinkShared>,
}

struct LinkShared {
    transport: Arc<dyn SensorTransport>,
    codec: Arc<dyn WireCodec>,
    config: LinkConfig,
    high_water_mark: usize,
    events: EventBus,
    state_tx: watch::Sender<LinkState>,
    inner: Mutex<LinkInner>,
    supervisor_started: AtomicBool,
    shutdown: CancellationToken,
}

struct LinkInner {
    state: LinkState,
    epoch: u64,
    /// Device being connected to, or connected
    target: Option<DeviceId>,
    device: Option<Device>,
    last_known: Option<DeviceId>,
    /// Cancels the in-flight scan or connect
    pending: Option<CancellationToken>,
    /// Cancels the running reconnect sequence
    recovery: Option<CancellationToken>,
    stream: Option<StreamSlot>,
    next_stream_id: u64,
    active_profile: Option<Profile>,
    battery_level: Option<u8>,
}

struct StreamSlot {
    id: u64,
    queue: Arc<SampleQueue>,
    cancel: CancellationToken,
    /// Hands a fresh notification receiver to the pump after a reconnect
    handover: mpsc::UnboundedSender<mpsc::Receiver<Vec<u8>>>,
}

enum Recovery {
    Superseded { release: bool },
    Recovered(Option<Profile>),
    Retry,
}

impl DeviceLink {
    /// Link speaking the RFduino wire format
    pub fn new(
        transport: Arc<dyn SensorTransport>,
        config: LinkConfig,
        queue: QueueConfig,
        events: EventBus,
    ) -> Self {
        Self::with_codec(transport, Arc::new(RfduinoCodec), config, queue, events)
    }

    pub fn with_codec(
        transport: Arc<dyn SensorTransport>,
        codec: Arc<dyn WireCodec>,
        config: LinkConfig,
        queue: QueueConfig,
        events: EventBus,
    ) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Idle);
        Self {
            shared: Arc::new(LinkShared {
                transport,
                codec,
                config,
                high_water_mark: queue.high_water_mark,
                events,
                state_tx,
                inner: Mutex::new(LinkInner {
                    state: LinkState::Idle,
                    epoch: 0,
                    target: None,
                    device: None,
                    last_known: None,
                    pending: None,
                    recovery: None,
                    stream: None,
                    next_stream_id: 0,
                    active_profile: None,
                    battery_level: None,
                }),
                supervisor_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state_tx.borrow()
    }

    /// Watch channel carrying every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state_tx.subscribe()
    }

    pub fn current_device(&self) -> Option<Device> {
        self.shared.lock_inner_recover().device.clone()
    }

    pub fn last_known_device(&self) -> Option<DeviceId> {
        self.shared.lock_inner_recover().last_known.clone()
    }

    /// Seed the last-known device, e.g. from persisted preferences
    pub fn set_last_known_device(&self, device_id: Option<DeviceId>) {
        self.shared.lock_inner_recover().last_known = device_id;
    }

    /// Most recent battery report from the connected sensor
    pub fn battery_level(&self) -> Option<u8> {
        self.shared.lock_inner_recover().battery_level
    }

    pub fn active_profile(&self) -> Option<Profile> {
        self.shared.lock_inner_recover().active_profile.clone()
    }

    /// Enumerate advertising sensors.
    ///
    /// The returned stream yields each device once and ends after `timeout`
    /// (or the configured scan timeout), on `DeviceScan::cancel`, or when
    /// dropped. The link returns to Idle when the scan ends.
    pub async fn scan(&self, timeout: Option<Duration>) -> Result<DeviceScan, LinkError> {
        let shared = &self.shared;
        let (token, epoch) = {
            let mut inner = shared.lock_inner()?;
            if matches!(
                inner.state,
                LinkState::Connecting | LinkState::Connected | LinkState::Streaming
            ) {
                return Err(LinkError::AlreadyConnected);
            }
            if let Some(previous) = inner.pending.take() {
                previous.cancel();
            }
            cancel_recovery(&mut inner);
            shared.abandon_stream(&mut inner, Some(LinkError::LinkLost));
            inner.epoch += 1;
            inner.device = None;
            inner.target = None;
            let token = CancellationToken::new();
            inner.pending = Some(token.clone());
            shared.transition(&mut inner, LinkState::Scanning);
            (token, inner.epoch)
        };

        let devices = match shared.transport.start_scan().await {
            Ok(devices) => devices,
            Err(err) => {
                shared.settle_idle(epoch, LinkState::Scanning);
                log_link_error(&err, "scan");
                return Err(err);
            }
        };

        let timeout = timeout.unwrap_or_else(|| shared.config.scan_timeout());
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(run_scan(
            Arc::clone(shared),
            devices,
            tx,
            token.clone(),
            timeout,
            epoch,
        ));

        log::info!("[DeviceLink] Scanning for {:?}", timeout);
        Ok(DeviceScan {
            devices: ReceiverStream::new(rx),
            cancel: token,
        })
    }

    /// Connect to `device_id`, bounded by the configured handshake timeout.
    ///
    /// Allowed from Idle, Scanning and Disconnected. While Connecting,
    /// Connected or Streaming the call fails with `AlreadyConnected` and
    /// leaves the link untouched.
    pub async fn connect(&self, device_id: &DeviceId) -> Result<Device, LinkError> {
        self.ensure_supervisor();
        let shared = &self.shared;

        let (token, epoch) = {
            let mut inner = shared.lock_inner()?;
            if matches!(
                inner.state,
                LinkState::Connecting | LinkState::Connected | LinkState::Streaming
            ) {
                let err = LinkError::AlreadyConnected;
                log_link_error(&err, "connect");
                return Err(err);
            }
            if let Some(previous) = inner.pending.take() {
                previous.cancel();
            }
            cancel_recovery(&mut inner);
            shared.abandon_stream(&mut inner, Some(LinkError::LinkLost));
            inner.epoch += 1;
            inner.device = None;
            inner.target = Some(device_id.clone());
            let token = CancellationToken::new();
            inner.pending = Some(token.clone());
            shared.transition(&mut inner, LinkState::Connecting);
            (token, inner.epoch)
        };

        log::info!("[DeviceLink] Connecting to {}", device_id);
        let result = tokio::select! {
            _ = token.cancelled() => Err(LinkError::Cancelled),
            outcome = tokio::time::timeout(shared.config.connect_timeout(), shared.transport.connect(device_id)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(LinkError::Timeout {
                        timeout_ms: shared.config.connect_timeout_ms,
                    }),
                }
            }
        };

        let settled: Result<(Device, Option<Profile>), (LinkError, bool)> = {
            let mut inner = shared.lock_inner_recover();
            if inner.epoch != epoch {
                Err((LinkError::Cancelled, result.is_ok()))
            } else {
                inner.pending = None;
                match result {
                    Ok(device) => {
                        inner.device = Some(device.clone());
                        inner.last_known = Some(device_id.clone());
                        inner.battery_level = None;
                        shared.transition(&mut inner, LinkState::Connected);
                        Ok((device, inner.active_profile.clone()))
                    }
                    Err(err) => {
                        inner.target = None;
                        shared.transition(&mut inner, LinkState::Idle);
                        Err((err, false))
                    }
                }
            }
        };

        match settled {
            Ok((device, profile)) => {
                log::info!("[DeviceLink] Connected to {} ({})", device.name, device.id);
                if let Some(profile) = profile {
                    shared.send_profile(&device.id, &profile).await;
                }
                Ok(device)
            }
            Err((err, release)) => {
                if release {
                    if let Err(release_err) = shared.transport.disconnect(device_id).await {
                        log::warn!(
                            "[DeviceLink] Failed to release superseded connection: {}",
                            release_err
                        );
                    }
                }
                log_link_error(&err, "connect");
                Err(err)
            }
        }
    }

    /// Connect to the last successfully connected device
    pub async fn reconnect_last(&self) -> Result<Device, LinkError> {
        let device_id = self
            .last_known_device()
            .ok_or_else(|| LinkError::NotFound {
                device_id: "<no last known device>".to_string(),
            })?;
        self.connect(&device_id).await
    }

    /// Start sample delivery. Connected → Streaming.
    ///
    /// Only one subscription may be active; a second call fails with
    /// `AlreadyStreaming`. Dropping or cancelling the subscription returns
    /// the link to Connected.
    pub async fn subscribe(&self) -> Result<SampleSubscription, LinkError> {
        let shared = &self.shared;
        let (device_id, slot_id, queue, cancel, handover_rx) = {
            let mut inner = shared.lock_inner()?;
            match inner.state {
                LinkState::Connected => {}
                LinkState::Streaming => {
                    let err = LinkError::AlreadyStreaming;
                    log_link_error(&err, "subscribe");
                    return Err(err);
                }
                _ => return Err(LinkError::NotConnected),
            }
            let device_id = inner
                .device
                .as_ref()
                .map(|device| device.id.clone())
                .ok_or(LinkError::NotConnected)?;

            inner.next_stream_id += 1;
            let slot_id = inner.next_stream_id;
            let queue = Arc::new(SampleQueue::new(shared.high_water_mark));
            let cancel = CancellationToken::new();
            let (handover_tx, handover_rx) = mpsc::unbounded_channel();
            inner.stream = Some(StreamSlot {
                id: slot_id,
                queue: Arc::clone(&queue),
                cancel: cancel.clone(),
                handover: handover_tx,
            });
            shared.transition(&mut inner, LinkState::Streaming);
            (device_id, slot_id, queue, cancel, handover_rx)
        };

        let frames = match shared.transport.subscribe(&device_id).await {
            Ok(frames) => frames,
            Err(err) => {
                {
                    let mut inner = shared.lock_inner_recover();
                    if inner.stream.as_ref().map(|slot| slot.id) == Some(slot_id) {
                        inner.stream = None;
                        if inner.state == LinkState::Streaming {
                            shared.transition(&mut inner, LinkState::Connected);
                        }
                    }
                }
                queue.close(Some(err.clone()));
                log_link_error(&err, "subscribe");
                return Err(err);
            }
        };

        tokio::spawn(run_pump(
            Arc::clone(shared),
            device_id,
            slot_id,
            Arc::clone(&queue),
            cancel.clone(),
            frames,
            handover_rx,
        ));

        Ok(SampleSubscription { queue, cancel })
    }

    /// Stop sample delivery now. Streaming → Connected; no-op otherwise.
    pub async fn unsubscribe(&self) -> Result<(), LinkError> {
        let shared = &self.shared;
        let device_id = {
            let mut inner = shared.lock_inner()?;
            match inner.stream.take() {
                Some(slot) => {
                    slot.cancel.cancel();
                    slot.queue.close(None);
                    if inner.state == LinkState::Streaming {
                        shared.transition(&mut inner, LinkState::Connected);
                        inner.device.as_ref().map(|device| device.id.clone())
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(device_id) = device_id {
            if let Err(err) = shared.transport.unsubscribe(&device_id).await {
                log::warn!("[DeviceLink] Unsubscribe failed: {}", err);
            }
        }
        Ok(())
    }

    /// Write a raw configuration payload.
    pub async fn write_characteristic(&self, payload: &[u8]) -> Result<(), LinkError> {
        let device_id = {
            let inner = self.shared.lock_inner()?;
            if !inner.state.is_connected() {
                return Err(LinkError::NotConnected);
            }
            inner
                .device
                .as_ref()
                .map(|device| device.id.clone())
                .ok_or(LinkError::NotConnected)?
        };

        self.shared
            .transport
            .write(&device_id, payload)
            .await
            .inspect_err(|err| {
                log_link_error(err, "write_characteristic");
                if matches!(err, LinkError::WriteRejected { .. }) {
                    telemetry::hub().record_error(DiagnosticError::WriteRejected, err.message());
                }
            })
    }

    /// Encode and write a protocol command
    pub async fn send_command(&self, command: &Command) -> Result<(), LinkError> {
        let frame = self.shared.codec.encode(command);
        self.write_characteristic(&frame).await
    }

    /// Make `profile` the sensor's active parameter set.
    ///
    /// The profile is remembered and re-sent after every connect and every
    /// sensor reset. When no device is connected it is only remembered.
    pub async fn activate_profile(&self, profile: &Profile) -> Result<(), LinkError> {
        let connected = {
            let mut inner = self.shared.lock_inner()?;
            inner.active_profile = Some(profile.clone());
            inner.state.is_connected()
        };
        if connected {
            self.send_command(&profile.apply_command()).await?;
            log::info!("[DeviceLink] Activated profile '{}' on device", profile.name);
        }
        Ok(())
    }

    pub async fn request_battery_level(&self) -> Result<(), LinkError> {
        self.send_command(&Command::RequestBatteryLevel).await
    }

    /// Drop the connection. Always succeeds; repeated calls are no-ops
    /// apart from re-entering Disconnected(UserRequested).
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let device_id = {
            let mut inner = shared.lock_inner_recover();
            inner.epoch += 1;
            if let Some(pending) = inner.pending.take() {
                pending.cancel();
            }
            cancel_recovery(&mut inner);
            shared.abandon_stream(&mut inner, None);
            let device = inner.device.take();
            inner.battery_level = None;
            shared.transition(
                &mut inner,
                LinkState::Disconnected(DisconnectReason::UserRequested),
            );
            inner.target = None;
            device.map(|device| device.id)
        };

        if let Some(device_id) = device_id {
            match shared.transport.disconnect(&device_id).await {
                Ok(()) => log::info!("[DeviceLink] Disconnected from {}", device_id),
                Err(err) => log::warn!("[DeviceLink] Transport disconnect failed: {}", err),
            }
        }
    }

    /// External reset: Disconnected → Idle. Stops any reconnect attempts.
    pub fn reset(&self) -> Result<(), LinkError> {
        let shared = &self.shared;
        let mut inner = shared.lock_inner()?;
        if inner.state.is_disconnected() {
            inner.epoch += 1;
            cancel_recovery(&mut inner);
            shared.abandon_stream(&mut inner, Some(LinkError::LinkLost));
            inner.device = None;
            inner.target = None;
            shared.transition(&mut inner, LinkState::Idle);
        }
        Ok(())
    }

    /// Stop background tasks. The link is unusable for reconnects afterwards.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    fn ensure_supervisor(&self) {
        if self
            .shared
            .supervisor_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let weak = Arc::downgrade(&self.shared);
        let mut events = self.shared.transport.events();
        let shutdown = self.shared.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(TransportEvent::ConnectionLost { device_id, reason }) => {
                        let Some(shared) = weak.upgrade() else { break };
                        shared.recover(device_id, reason).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "link supervisor lagged behind transport events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("link supervisor stopped");
        });
    }
}

impl LinkShared {
    fn lock_inner(&self) -> Result<MutexGuard<'_, LinkInner>, LinkError> {
        self.inner.lock().map_err(|_| LinkError::StatePoisoned)
    }

    /// Paths that must always complete (disconnect, task cleanup) recover
    /// the guard from a poisoned lock.
    fn lock_inner_recover(&self) -> MutexGuard<'_, LinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut LinkInner, next: LinkState) {
        if inner.state == next {
            return;
        }
        let previous = std::mem::replace(&mut inner.state, next);
        log::info!("[DeviceLink] {:?} -> {:?}", previous, next);
        self.state_tx.send_replace(next);
        telemetry::hub().record_link_state(next);
        self.events.publish(CoreEvent::DeviceStateChanged {
            state: next,
            device_id: inner.target.clone(),
        });
    }

    /// Return to Idle if nothing superseded the operation that owns `epoch`.
    fn settle_idle(&self, epoch: u64, expected: LinkState) {
        let mut inner = self.lock_inner_recover();
        if inner.epoch == epoch && inner.state == expected {
            inner.pending = None;
            inner.target = None;
            self.transition(&mut inner, LinkState::Idle);
        }
    }

    fn abandon_stream(&self, inner: &mut LinkInner, reason: Option<LinkError>) {
        if let Some(slot) = inner.stream.take() {
            slot.cancel.cancel();
            slot.queue.close(reason);
        }
    }

    async fn send_profile(&self, device_id: &DeviceId, profile: &Profile) {
        let frame = self.codec.encode(&profile.apply_command());
        match self.transport.write(device_id, &frame).await {
            Ok(()) => log::info!("[DeviceLink] Sent profile '{}' to {}", profile.name, device_id),
            Err(err) => log_link_error(&err, "send_profile"),
        }
    }

    async fn restore_after_reset(&self, device_id: &DeviceId) {
        let ack = self.codec.encode(&Command::ResetAck);
        if let Err(err) = self.transport.write(device_id, &ack).await {
            log_link_error(&err, "reset_ack");
            return;
        }
        let profile = self.lock_inner_recover().active_profile.clone();
        if let Some(profile) = profile {
            self.send_profile(device_id, &profile).await;
        }
    }

    fn handle_frame(
        self: &Arc<Self>,
        device_id: &DeviceId,
        frame: &[u8],
        clock: &mut ClockUnwrapper,
        queue: &SampleQueue,
    ) {
        match self.codec.decode(frame) {
            Ok(InboundMessage::SensorData {
                device_time_us,
                channels,
            }) => queue.push(Sample::new(clock.unwrap(device_time_us), channels)),
            Ok(InboundMessage::BatteryLevel(level)) => {
                self.lock_inner_recover().battery_level = Some(level);
                self.events.publish(CoreEvent::BatteryLevel(level));
            }
            Ok(InboundMessage::Reset) => {
                log::info!("[DeviceLink] Sensor {} reset; restoring parameters", device_id);
                let shared = Arc::clone(self);
                let device_id = device_id.clone();
                tokio::spawn(async move {
                    shared.restore_after_reset(&device_id).await;
                });
            }
            Ok(InboundMessage::Error(code)) => {
                log::warn!("[DeviceLink] Sensor reported error 0x{:02X}", code);
                telemetry::hub().record_error(
                    DiagnosticError::FirmwareError,
                    format!("firmware error 0x{:02X}", code),
                );
            }
            Ok(InboundMessage::Debug(payload)) => {
                tracing::debug!(len = payload.len(), "sensor debug frame");
            }
            Ok(other) => {
                tracing::trace!(?other, "sensor status frame");
            }
            Err(err) => {
                log::warn!("[DeviceLink] Dropping malformed frame: {}", err);
                telemetry::hub().record_error(DiagnosticError::MalformedFrame, err.to_string());
            }
        }
    }

    async fn finish_stream(&self, device_id: &DeviceId, slot_id: u64, queue: &SampleQueue) {
        let unsubscribe = {
            let mut inner = self.lock_inner_recover();
            if inner.stream.as_ref().map(|slot| slot.id) == Some(slot_id) {
                inner.stream = None;
                if inner.state == LinkState::Streaming {
                    self.transition(&mut inner, LinkState::Connected);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        queue.close(None);

        if unsubscribe {
            if let Err(err) = self.transport.unsubscribe(device_id).await {
                log::warn!("[DeviceLink] Unsubscribe failed: {}", err);
            }
        }
    }

    /// Move to `next` on behalf of the reconnect run that owns `epoch`.
    fn advance_recovery(&self, epoch: u64, next: LinkState) -> bool {
        let mut inner = self.lock_inner_recover();
        if inner.epoch != epoch {
            return false;
        }
        self.transition(&mut inner, next);
        true
    }

    async fn try_reconnect(
        &self,
        device_id: &DeviceId,
        resubscribe: bool,
    ) -> Result<Option<mpsc::Receiver<Vec<u8>>>, LinkError> {
        match tokio::time::timeout(self.config.connect_timeout(), self.transport.connect(device_id))
            .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(LinkError::Timeout {
                    timeout_ms: self.config.connect_timeout_ms,
                })
            }
        }
        if resubscribe {
            self.transport.subscribe(device_id).await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Reconnect after an unsolicited drop, with exponential backoff.
    async fn recover(self: &Arc<Self>, device_id: DeviceId, reason: String) {
        let (epoch, resubscribe, token) = {
            let mut inner = self.lock_inner_recover();
            let current = inner
                .device
                .as_ref()
                .map(|device| device.id == device_id)
                .unwrap_or(false);
            if !current || !inner.state.is_connected() {
                return;
            }
            inner.epoch += 1;
            cancel_recovery(&mut inner);
            let token = CancellationToken::new();
            inner.recovery = Some(token.clone());
            let resubscribe = inner.stream.is_some();
            self.transition(
                &mut inner,
                LinkState::Disconnected(DisconnectReason::Transient),
            );
            (inner.epoch, resubscribe, token)
        };
        log::warn!(
            "[DeviceLink] Connection to {} lost ({}); reconnecting",
            device_id,
            reason
        );

        let backoff = Backoff::from_config(&self.config);
        let mut attempt = 0u32;
        while let Some(delay) = backoff.delay(attempt + 1) {
            attempt += 1;
            telemetry::hub().record_reconnect_attempt(attempt, delay.as_millis() as u64);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if !self.advance_recovery(epoch, LinkState::Connecting) {
                return;
            }

            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = token.cancelled() => return,
                outcome = self.try_reconnect(&device_id, resubscribe) => outcome,
            };
            let recovery = {
                let mut inner = self.lock_inner_recover();
                if inner.epoch != epoch {
                    Recovery::Superseded {
                        release: outcome.is_ok(),
                    }
                } else {
                    match outcome {
                        Ok(frames) => {
                            inner.recovery = None;
                            self.transition(&mut inner, LinkState::Connected);
                            if let Some(frames) = frames {
                                let handed = inner
                                    .stream
                                    .as_ref()
                                    .map(|slot| slot.handover.send(frames).is_ok())
                                    .unwrap_or(false);
                                if handed {
                                    self.transition(&mut inner, LinkState::Streaming);
                                }
                            }
                            Recovery::Recovered(inner.active_profile.clone())
                        }
                        Err(err) => {
                            log::warn!(
                                "[DeviceLink] Reconnect attempt {} failed: {}",
                                attempt,
                                err
                            );
                            self.transition(
                                &mut inner,
                                LinkState::Disconnected(DisconnectReason::Transient),
                            );
                            Recovery::Retry
                        }
                    }
                }
            };

            match recovery {
                Recovery::Superseded { release } => {
                    if release {
                        if let Err(err) = self.transport.disconnect(&device_id).await {
                            log::warn!(
                                "[DeviceLink] Failed to release superseded reconnect: {}",
                                err
                            );
                        }
                    }
                    return;
                }
                Recovery::Recovered(profile) => {
                    log::info!("[DeviceLink] Reconnected to {} after {} attempts", device_id, attempt);
                    if let Some(profile) = profile {
                        self.send_profile(&device_id, &profile).await;
                    }
                    return;
                }
                Recovery::Retry => {}
            }
        }

        let mut inner = self.lock_inner_recover();
        if inner.epoch == epoch {
            inner.recovery = None;
            self.transition(&mut inner, LinkState::Disconnected(DisconnectReason::LinkLost));
            inner.device = None;
            self.abandon_stream(&mut inner, Some(LinkError::LinkLost));
            log_link_error(&LinkError::LinkLost, "reconnect");
            telemetry::hub().record_error(DiagnosticError::LinkLost, device_id.to_string());
        }
    }
}

/// Stop a reconnect sequence; its pending sleep or handshake ends at once
/// so the supervisor can handle the next transport event.
fn cancel_recovery(inner: &mut LinkInner) {
    if let Some(token) = inner.recovery.take() {
        token.cancel();
    }
}

async fn run_scan(
    shared: Arc<LinkShared>,
    mut devices: mpsc::Receiver<Device>,
    tx: mpsc::Sender<Device>,
    token: CancellationToken,
    timeout: Duration,
    epoch: u64,
) {
    let mut seen = HashSet::new();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = &mut deadline => break,
            _ = tx.closed() => break,
            next = devices.recv() => match next {
                Some(device) => {
                    if seen.insert(device.id.clone()) {
                        tracing::debug!(device = %device.id, rssi = device.rssi, "device discovered");
                        if tx.send(device).await.is_err() {
                            break;
                        }
                    }
                }
                None => break,
            },
        }
    }

    if let Err(err) = shared.transport.stop_scan().await {
        log::warn!("[DeviceLink] Failed to stop scan: {}", err);
    }
    shared.settle_idle(epoch, LinkState::Scanning);
    log::info!("[DeviceLink] Scan finished, {} devices seen", seen.len());
}

async fn run_pump(
    shared: Arc<LinkShared>,
    device_id: DeviceId,
    slot_id: u64,
    queue: Arc<SampleQueue>,
    cancel: CancellationToken,
    mut frames: mpsc::Receiver<Vec<u8>>,
    mut handover: mpsc::UnboundedReceiver<mpsc::Receiver<Vec<u8>>>,
) {
    let mut clock = ClockUnwrapper::new();
    tracing::debug!(device = %device_id, "sample pump started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => shared.handle_frame(&device_id, &frame, &mut clock, &queue),
                None => {
                    tracing::debug!(device = %device_id, "notifications ended, awaiting reconnect");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = handover.recv() => match next {
                            Some(next) => {
                                frames = next;
                                clock.rebase();
                            }
                            None => break,
                        },
                    }
                }
            },
        }
    }

    shared.finish_stream(&device_id, slot_id, &queue).await;
    tracing::debug!(device = %device_id, stats = ?queue.stats(), "sample pump stopped");
}

/// Finite stream of discovered devices
pub struct DeviceScan {
    devices: ReceiverStream<Device>,
    cancel: CancellationToken,
}

impl DeviceScan {
    /// End the scan early
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for DeviceScan {
    type Item = Device;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Device>> {
        Pin::new(&mut self.devices).poll_next(cx)
    }
}

impl Drop for DeviceScan {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Consumer end of the sample queue.
///
/// Yields samples until cancelled, dropped, or the link stops streaming.
pub struct SampleSubscription {
    queue: Arc<SampleQueue>,
    cancel: CancellationToken,
}

impl SampleSubscription {
    pub async fn recv(&self) -> Option<Sample> {
        self.queue.recv().await
    }

    pub fn try_recv(&self) -> Option<Sample> {
        self.queue.try_recv()
    }

    /// Set when the stream ended because of a link failure
    pub fn close_reason(&self) -> Option<LinkError> {
        self.queue.close_reason()
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn into_stream(self) -> impl Stream<Item = Sample> + Send + 'static {
        futures::stream::unfold(self, |subscription| async move {
            let sample = subscription.recv().await?;
            Some((sample, subscription))
        })
    }
}

impl Drop for SampleSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "device_link_tests.rs"]
mod tests;
