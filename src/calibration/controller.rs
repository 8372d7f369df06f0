// CalibrationController: connect → collect → compute → commit lifecycle
//
// Phase changes happen under one mutex and are published on the event bus
// and a watch channel. Collection runs in a spawned task tagged with the
// session epoch; `start`, `cancel` and `reset` bump the epoch, so a stale
// task can never overwrite the phase of a newer session.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::calibration::phase::CalibrationPhase;
use crate::calibration::session::CalibrationSession;
use crate::config::CalibrationConfig;
use crate::error::{log_calibration_error, CalibrationError};
use crate::link::{Command, DeviceId, DeviceLink, SampleSubscription};
use crate::managers::{CoreEvent, EventBus};
use crate::profile::{Profile, ProfileStore};

/// Drives calibration sessions against the device link.
///
/// Session failures never surface as `Err`: they end in
/// `CalibrationPhase::Failed(reason)`, and callers inspect the phase. Only
/// caller preconditions (`start` while running, `commit` outside Ready)
/// return errors.
///
/// # Example
/// ```ignore
/// let controller = CalibrationController::new(link, store, config, events);
/// controller.start(&device_id)?;
/// // ... user blinks up and down while the phase advances ...
/// let profile = controller.commit("alice")?;
/// ```
#[derive(Clone)]
pub struct CalibrationController {
    shared: Arc<ControllerShared>,
}

struct ControllerShared {
    link: DeviceLink,
    store: Arc<ProfileStore>,
    config: CalibrationConfig,
    events: EventBus,
    phase_tx: watch::Sender<CalibrationPhase>,
    inner: Mutex<ControllerInner>,
}

struct ControllerInner {
    phase: CalibrationPhase,
    epoch: u64,
    cancel: Option<CancellationToken>,
    advance: Option<Arc<Notify>>,
}

impl CalibrationController {
    pub fn new(
        link: DeviceLink,
        store: Arc<ProfileStore>,
        config: CalibrationConfig,
        events: EventBus,
    ) -> Self {
        let (phase_tx, _) = watch::channel(CalibrationPhase::Idle);
        Self {
            shared: Arc::new(ControllerShared {
                link,
                store,
                config,
                events,
                phase_tx,
                inner: Mutex::new(ControllerInner {
                    phase: CalibrationPhase::Idle,
                    epoch: 0,
                    cancel: None,
                    advance: None,
                }),
            }),
        }
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.shared.phase_tx.borrow().clone()
    }

    /// Watch channel carrying every phase change
    pub fn subscribe_phase(&self) -> watch::Receiver<CalibrationPhase> {
        self.shared.phase_tx.subscribe()
    }

    /// Begin a session on `device_id`.
    ///
    /// Accepted from Idle, Ready and every terminal phase; any previous
    /// session data is discarded. The phase is AwaitingDevice when this
    /// returns. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// - `AlreadyInProgress` while a session is connecting or collecting
    pub fn start(&self, device_id: &DeviceId) -> Result<(), CalibrationError> {
        let shared = &self.shared;
        let (epoch, token, advance) = {
            let mut inner = shared.lock_inner();
            if inner.phase.is_running() {
                let err = CalibrationError::AlreadyInProgress;
                log_calibration_error(&err, "start");
                return Err(err);
            }
            inner.epoch += 1;
            let token = CancellationToken::new();
            let advance = Arc::new(Notify::new());
            inner.cancel = Some(token.clone());
            inner.advance = Some(Arc::clone(&advance));
            shared.transition(&mut inner, CalibrationPhase::AwaitingDevice);
            (inner.epoch, token, advance)
        };

        log::info!("[CalibrationController] Starting calibration on {}", device_id);
        tokio::spawn(run_session(
            Arc::clone(shared),
            device_id.clone(),
            epoch,
            token,
            advance,
        ));
        Ok(())
    }

    /// End the current collection stage early. Returns false when no
    /// stage is collecting.
    pub fn advance(&self) -> bool {
        let inner = self.shared.lock_inner();
        let collecting = matches!(
            inner.phase,
            CalibrationPhase::CollectingBaseline
                | CalibrationPhase::CollectingPositive { .. }
                | CalibrationPhase::CollectingNegative { .. }
        );
        match (&inner.advance, collecting) {
            (Some(advance), true) => {
                advance.notify_one();
                true
            }
            _ => false,
        }
    }

    /// Store the Ready profile under `name`. Ready → Committed.
    ///
    /// # Errors
    /// - `NotReady` outside the Ready phase
    /// - `ProfileRejected` when the store refuses the profile; the phase
    ///   stays Ready so the caller can retry
    pub fn commit(&self, name: &str) -> Result<Profile, CalibrationError> {
        let shared = &self.shared;
        let mut inner = shared.lock_inner();
        let CalibrationPhase::Ready(provisional) = &inner.phase else {
            let err = CalibrationError::NotReady;
            log_calibration_error(&err, "commit");
            return Err(err);
        };

        let profile = provisional.renamed(name);
        if let Err(store_err) = shared.store.upsert(profile.clone()) {
            let err = CalibrationError::profile_rejected(&store_err);
            log_calibration_error(&err, "commit");
            return Err(err);
        }

        inner.cancel = None;
        inner.advance = None;
        shared.transition(&mut inner, CalibrationPhase::Committed(profile.clone()));
        log::info!(
            "[CalibrationController] Committed profile '{}' (+{} / {} around {})",
            profile.name,
            profile.positive_threshold,
            profile.negative_threshold,
            profile.baseline
        );
        Ok(profile)
    }

    /// Abort the session. Always succeeds.
    ///
    /// From any non-terminal phase other than Idle: → Cancelled, then the
    /// link is unsubscribed and disconnected on a best-effort basis.
    /// Idle and terminal phases are left untouched.
    pub async fn cancel(&self) {
        let shared = &self.shared;
        {
            let mut inner = shared.lock_inner();
            if inner.phase == CalibrationPhase::Idle || inner.phase.is_terminal() {
                return;
            }
            inner.epoch += 1;
            if let Some(token) = inner.cancel.take() {
                token.cancel();
            }
            inner.advance = None;
            shared.transition(&mut inner, CalibrationPhase::Cancelled);
        }

        if let Err(err) = shared.link.unsubscribe().await {
            log::warn!("[CalibrationController] Unsubscribe during cancel failed: {}", err);
        }
        shared.link.disconnect().await;
        log::info!("[CalibrationController] Calibration cancelled");
    }

    /// Terminal phase → Idle
    pub fn reset(&self) {
        let shared = &self.shared;
        let mut inner = shared.lock_inner();
        if inner.phase.is_terminal() {
            inner.epoch += 1;
            inner.cancel = None;
            inner.advance = None;
            shared.transition(&mut inner, CalibrationPhase::Idle);
        }
    }
}

impl ControllerShared {
    /// Transitions must always complete, so a poisoned lock is recovered.
    fn lock_inner(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut ControllerInner, next: CalibrationPhase) {
        if inner.phase == next {
            return;
        }
        log::info!(
            "[CalibrationController] {} -> {}",
            inner.phase.name(),
            next.name()
        );
        inner.phase = next.clone();
        self.phase_tx.send_replace(next.clone());
        self.events.publish(CoreEvent::CalibrationStateChanged(next));
    }

    /// Apply `next` if the session that owns `epoch` is still current
    fn set_phase(&self, epoch: u64, next: CalibrationPhase) -> bool {
        let mut inner = self.lock_inner();
        if inner.epoch != epoch {
            return false;
        }
        self.transition(&mut inner, next);
        true
    }

    fn fail(&self, epoch: u64, err: CalibrationError) {
        let mut inner = self.lock_inner();
        if inner.epoch != epoch {
            return;
        }
        log_calibration_error(&err, "session");
        inner.cancel = None;
        inner.advance = None;
        self.transition(&mut inner, CalibrationPhase::Failed(err));
    }

    /// Connect if needed and take the link's sample subscription
    async fn open_stream(&self, device_id: &DeviceId) -> Result<SampleSubscription, CalibrationError> {
        let state = self.link.state();
        let on_target = self
            .link
            .current_device()
            .map(|device| &device.id == device_id)
            .unwrap_or(false);

        if !(state.is_connected() && on_target) {
            if state.is_connected() {
                self.link.disconnect().await;
            }
            self.link
                .connect(device_id)
                .await
                .map_err(|err| CalibrationError::device_unavailable(&err))?;
        }
        self.link
            .subscribe()
            .await
            .map_err(|err| CalibrationError::device_unavailable(&err))
    }

    /// Run one session. Once the sensor accepted calibration mode, it is
    /// told to leave it again on every exit path.
    async fn collect(
        &self,
        device_id: &DeviceId,
        epoch: u64,
        advance: &Notify,
    ) -> Result<Profile, CalibrationError> {
        let subscription = self.open_stream(device_id).await?;

        let in_calibration_mode = match self.link.send_command(&Command::StartCalibration).await {
            Ok(()) => true,
            Err(err) => {
                log::warn!("[CalibrationController] Device ignored calibration mode: {}", err);
                false
            }
        };

        let outcome = self.gather(&subscription, device_id, epoch, advance).await;

        if in_calibration_mode {
            if let Err(err) = self.link.send_command(&Command::StopCalibration).await {
                log::warn!("[CalibrationController] Failed to leave calibration mode: {}", err);
            }
        }
        outcome
    }

    async fn gather(
        &self,
        subscription: &SampleSubscription,
        device_id: &DeviceId,
        epoch: u64,
        advance: &Notify,
    ) -> Result<Profile, CalibrationError> {
        let mut link_state = self.link.subscribe_state();
        let mut session = CalibrationSession::new(device_id.clone(), self.config.clone());
        if !self.set_phase(epoch, session.phase()) {
            return Err(CalibrationError::Cancelled);
        }

        let stage_timeout = self.config.stage_timeout();
        while !session.is_complete() {
            let next_phase = tokio::select! {
                _ = advance.notified() => Some(session.advance()),
                changed = link_state.changed() => {
                    if changed.is_err() || link_state.borrow_and_update().is_disconnected() {
                        return Err(CalibrationError::LinkLost);
                    }
                    None
                }
                received = tokio::time::timeout(stage_timeout, subscription.recv()) => match received {
                    Ok(Some(sample)) => session.ingest(&sample),
                    Ok(None) => return Err(CalibrationError::LinkLost),
                    Err(_) => {
                        return Err(CalibrationError::Timeout {
                            stage: session.phase().name().to_string(),
                        })
                    }
                },
            };

            if let Some(phase) = next_phase {
                tracing::debug!(phase = phase.name(), "calibration stage advanced");
                if !self.set_phase(epoch, phase) {
                    return Err(CalibrationError::Cancelled);
                }
            }
        }

        tracing::debug!(provisional = ?session.provisional(), "computing thresholds");
        session.compute(device_id.as_str())
    }
}

async fn run_session(
    shared: Arc<ControllerShared>,
    device_id: DeviceId,
    epoch: u64,
    token: CancellationToken,
    advance: Arc<Notify>,
) {
    let outcome = tokio::select! {
        _ = token.cancelled() => return,
        outcome = shared.collect(&device_id, epoch, &advance) => outcome,
    };

    match outcome {
        Ok(profile) => {
            log::info!(
                "[CalibrationController] Thresholds ready: +{} / {} (baseline {})",
                profile.positive_threshold,
                profile.negative_threshold,
                profile.baseline
            );
            shared.set_phase(epoch, CalibrationPhase::Ready(profile));
        }
        Err(err) => shared.fail(epoch, err),
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
