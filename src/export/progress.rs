//! Progress events emitted by an export session.
//!
//! The stream is a single channel of JSON-shaped events: reporter ticks
//! and phase boundaries carry a `progress` percentage, per-task failures
//! carry only the error text. Consumers observe events in send order.

use std::fmt;

use serde::Serialize;

/// Event status on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Processing,
    Error,
}

/// One progress-stream event.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub status: Status,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl ProgressEvent {
    pub fn processing(result: impl Into<String>, progress: u8) -> Self {
        Self { status: Status::Processing, result: result.into(), progress: Some(progress) }
    }

    /// A per-task failure; carries no percentage.
    pub fn error(result: impl Into<String>) -> Self {
        Self { status: Status::Error, result: result.into(), progress: None }
    }
}

impl fmt::Display for ProgressEvent {
    /// Renders the exact wire form, one JSON object per event.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// Sending half of a progress stream.
pub type ProgressSender = flume::Sender<ProgressEvent>;

/// Receiving half; clone freely, flume channels are MPMC.
pub type ProgressReceiver = flume::Receiver<ProgressEvent>;

/// Creates a fresh progress stream.
///
/// Unbounded: the orchestrator must never stall on a slow consumer, and
/// the event rate is capped by the one-second reporter ticks.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    flume::unbounded()
}
