//! Control-plane event types.
//!
//! The engine never returns errors from the real-time thread; anything that
//! goes wrong mid-stream is reported out-of-band as an [`EngineEvent`] on the
//! broadcast channel returned by `AudioEngine::subscribe_events()`.

use serde::{Deserialize, Serialize};

/// Emitted when something notable happens on an open stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub kind: EngineEventKind,
}

/// What happened. Each variant is reported at most once per occurrence —
/// none of these are retried or repeated by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum EngineEventKind {
    /// Backend/hardware failure during operation. The stream has been
    /// force-closed and must be reopened; the engine does not auto-retry.
    StreamError { message: String },
    /// A user callback panicked during dispatch. The panic was caught at the
    /// dispatch boundary and converted to an immediate abort.
    CallbackFault { message: String },
    /// The stream left the running state.
    Stopped { reason: StopReason },
    /// The indirect-path capture ring overflowed; `dropped_samples` capture
    /// samples were discarded before the relay caught up.
    Overrun { dropped_samples: usize },
}

/// Why a running stream halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    /// `stop()` was called from the control thread.
    Requested,
    /// A callback returned `StopAfterBuffer`.
    CallbackStop,
    /// A callback returned `AbortImmediately` (or panicked).
    CallbackAbort,
    /// The backend reported a stream error.
    BackendError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_event_serializes_with_camel_case_tagging() {
        let event = EngineEvent {
            seq: 4,
            kind: EngineEventKind::Overrun {
                dropped_samples: 512,
            },
        };

        let json = serde_json::to_value(&event).expect("serialize engine event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["kind"]["type"], "overrun");
        assert_eq!(json["kind"]["droppedSamples"], 512);

        let round_trip: EngineEvent =
            serde_json::from_value(json).expect("deserialize engine event");
        assert_eq!(round_trip.seq, 4);
        assert_eq!(
            round_trip.kind,
            EngineEventKind::Overrun {
                dropped_samples: 512
            }
        );
    }

    #[test]
    fn stop_reason_serializes_lowercase_camel() {
        let json = serde_json::to_value(StopReason::CallbackAbort).expect("serialize");
        assert_eq!(json, "callbackAbort");
    }

    #[test]
    fn stream_error_event_round_trips() {
        let event = EngineEvent {
            seq: 0,
            kind: EngineEventKind::StreamError {
                message: "device disconnected".into(),
            },
        };
        let json = serde_json::to_string(&event).expect("serialize");
        let back: EngineEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.kind, event.kind);
    }
}
