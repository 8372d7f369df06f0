//! Core telemetry event types describing link and queue diagnostics
//! exposed to the CLI and any attached observer.

use serde::{Deserialize, Serialize};

use crate::link::LinkState;

/// Diagnostic error codes surfaced via telemetry metrics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticError {
    MalformedFrame,
    FirmwareError,
    WriteRejected,
    LinkLost,
}

/// Metric events covering queue health, reconnects, and link lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MetricEvent {
    QueueOccupancy {
        percent: f32,
    },
    SamplesDropped {
        total: u64,
    },
    ReconnectAttempt {
        attempt: u32,
        delay_ms: u64,
    },
    LinkStateChanged {
        state: LinkState,
        timestamp_ms: u64,
    },
    Error {
        code: DiagnosticError,
        context: String,
    },
}
