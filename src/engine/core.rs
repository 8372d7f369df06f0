//! EngineHandle: owns and wires the eyedrops core.
//!
//! One handle per process, constructed at startup and torn down with
//! `shutdown()`. Collaborators (CLI, UI adapters) receive the handle and
//! reach every component through it; there are no ambient singletons
//! apart from the diagnostics hub.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::analysis::{BlinkClassifier, BlinkWatchdog};
use crate::calibration::CalibrationController;
use crate::config::{AppConfig, ClassifierConfig};
use crate::error::{log_link_error, EngineError};
use crate::link::{DeviceId, DeviceLink, SampleSubscription, SensorTransport};
use crate::managers::{CoreEvent, EventBus};
use crate::profile::{Profile, ProfileStore};
use crate::telemetry::{self, TelemetrySnapshot};

/// Default broadcast capacity of the core event bus
const EVENT_BUS_CAPACITY: usize = 256;

struct ClassifierTask {
    profile: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// EngineHandle orchestrates the device link, profile store, calibration
/// controller and the live classifier task.
pub struct EngineHandle {
    config: AppConfig,
    events: EventBus,
    link: DeviceLink,
    store: Arc<ProfileStore>,
    calibration: CalibrationController,
    classifier: Mutex<Option<ClassifierTask>>,
}

impl EngineHandle {
    /// Create an engine over `transport`.
    pub fn new(transport: Arc<dyn SensorTransport>, config: AppConfig) -> Self {
        if !telemetry::init(&config.telemetry) {
            log::debug!("[EngineHandle] Telemetry hub already initialized");
        }

        let events = EventBus::new(EVENT_BUS_CAPACITY);
        let link = DeviceLink::new(
            transport,
            config.link.clone(),
            config.queue.clone(),
            events.clone(),
        );
        let store = Arc::new(ProfileStore::with_events(events.clone()));
        let calibration = CalibrationController::new(
            link.clone(),
            Arc::clone(&store),
            config.calibration.clone(),
            events.clone(),
        );

        Self {
            config,
            events,
            link,
            store,
            calibration,
            classifier: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.store
    }

    pub fn calibration(&self) -> &CalibrationController {
        &self.calibration
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Event stream that never lags; for UI adapters.
    pub fn subscribe_events_unbounded(&self) -> mpsc::UnboundedReceiver<CoreEvent> {
        self.events.subscribe_unbounded()
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        telemetry::hub().snapshot()
    }

    // ========================================================================
    // CLASSIFICATION
    // ========================================================================

    /// Classify live samples against the named profile.
    ///
    /// Looks the profile up, activates it on the device, subscribes to the
    /// link and spawns the classifier task publishing `BlinkDetected` and
    /// `BlinkOverdue`. A running classifier is stopped first.
    pub async fn start_streaming(&self, profile_name: &str) -> Result<(), EngineError> {
        let mut slot = self.classifier.lock().await;
        if let Some(task) = slot.take() {
            self.stop_task(task).await;
        }

        let profile = self.store.require(profile_name)?;
        self.link.activate_profile(&profile).await?;
        let subscription = self.link.subscribe().await?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_classifier(
            subscription,
            profile.clone(),
            self.config.classifier.clone(),
            self.events.clone(),
            cancel.clone(),
        ));

        log::info!("[EngineHandle] Classifying with profile '{}'", profile.name);
        *slot = Some(ClassifierTask {
            profile: profile.name,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Stop the classifier task; the link returns to Connected.
    pub async fn stop_streaming(&self) {
        if let Some(task) = self.classifier.lock().await.take() {
            self.stop_task(task).await;
        }
    }

    /// Name of the profile the classifier is running with
    pub async fn streaming_profile(&self) -> Option<String> {
        self.classifier
            .lock()
            .await
            .as_ref()
            .filter(|task| !task.handle.is_finished())
            .map(|task| task.profile.clone())
    }

    async fn stop_task(&self, task: ClassifierTask) {
        task.cancel.cancel();
        if let Err(err) = task.handle.await {
            log::warn!("[EngineHandle] Classifier task ended abnormally: {}", err);
        }
        if let Err(err) = self.link.unsubscribe().await {
            log_link_error(&err, "stop_streaming");
        }
        log::info!("[EngineHandle] Stopped classifying with '{}'", task.profile);
    }

    // ========================================================================
    // CALIBRATION
    // ========================================================================

    /// Stop classification and begin a calibration session on `device_id`.
    pub async fn start_calibration(&self, device_id: &DeviceId) -> Result<(), EngineError> {
        self.stop_streaming().await;
        self.calibration.start(device_id)?;
        Ok(())
    }

    /// Commit the Ready calibration under `name`, optionally making it the
    /// device's active profile.
    pub async fn commit_calibration(&self, name: &str, activate: bool) -> Result<Profile, EngineError> {
        let profile = self.calibration.commit(name)?;
        if activate {
            self.link.activate_profile(&profile).await?;
        }
        Ok(profile)
    }

    /// Stop classification, cancel calibration, drop the connection and
    /// stop background link tasks.
    pub async fn shutdown(&self) {
        self.stop_streaming().await;
        self.calibration.cancel().await;
        self.link.disconnect().await;
        self.link.shutdown();
        log::info!("[EngineHandle] Shut down");
    }
}

async fn run_classifier(
    subscription: SampleSubscription,
    profile: Profile,
    config: ClassifierConfig,
    events: EventBus,
    cancel: CancellationToken,
) {
    let mut watchdog = BlinkWatchdog::from_config(&config);
    let mut classifier = BlinkClassifier::new(profile, &config);
    let mut blinks = 0u64;

    loop {
        let sample = tokio::select! {
            _ = cancel.cancelled() => break,
            sample = subscription.recv() => sample,
        };
        let Some(sample) = sample else { break };

        let blink = classifier.process(&sample);
        if let Some(event) = &blink {
            blinks += 1;
            tracing::debug!(
                timestamp_us = event.timestamp_us,
                polarity = ?event.polarity,
                confidence = event.confidence,
                "blink detected"
            );
            events.publish(CoreEvent::BlinkDetected(event.clone()));
        }
        if let Some(watchdog) = watchdog.as_mut() {
            if let Some(since_last_us) = watchdog.observe(sample.timestamp_us, blink.is_some()) {
                events.publish(CoreEvent::BlinkOverdue { since_last_us });
            }
        }
    }

    match subscription.close_reason() {
        Some(reason) => log::warn!(
            "[EngineHandle] Sample stream ended after {} blinks: {}",
            blinks,
            reason
        ),
        None => tracing::debug!(blinks, stats = ?subscription.stats(), "classifier stopped"),
    }
}

// ========================================================================
// TEST HELPERS
// ========================================================================
