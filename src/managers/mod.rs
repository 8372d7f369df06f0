// Managers Module
//
// Process-wide plumbing shared by the core components.
//
// - EventBus: publish/subscribe of CoreEvent notifications to UI
//   collaborators (device state, calibration phase, blinks, profiles)

pub mod event_bus;

pub use event_bus::{CoreEvent, EventBus};
