// File: src/debug.rs
//
// Engine-side debugger boundary for the Rill VM.
// The actual debugger transport (JSON over WebSocket, request/response
// correlated by sequence number) is an external collaborator; the engine
// owns the attachment hook consulted by the Breakpoint/DebugCheckpoint
// instructions and the serializable state-change notification payloads.

use serde::{Deserialize, Serialize};

/// Debugger protocol version carried in the initialState notification.
/// An incompatible version terminates the session on the transport side.
pub const PROTOCOL_VERSION: u32 = 1;

/// State-change notifications the engine emits toward an attached debugger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StateNotification {
    /// Sent once on attach
    #[serde(rename_all = "camelCase")]
    InitialState { version: u32 },
    /// Sent whenever execution starts or stops
    #[serde(rename_all = "camelCase")]
    State { running: bool, cause: Option<String> },
}

impl StateNotification {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("notifications serialize")
    }
}

/// Host-side debugger attachment. The VM notifies unconditionally at
/// Breakpoint instructions and consults wants_break first at
/// DebugCheckpoint instructions.
pub trait Debugger: Send + Sync {
    /// Whether the debugger wants to stop at this bytecode offset
    fn wants_break(&self, offset: u32) -> bool;

    /// Deliver a state-change notification
    fn notify(&self, event: &StateNotification);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_json_shape() {
        let json = StateNotification::InitialState { version: PROTOCOL_VERSION }.to_json();
        assert_eq!(json, r#"{"type":"initialState","version":1}"#);
    }

    #[test]
    fn test_state_json_shape() {
        let json = StateNotification::State {
            running: false,
            cause: Some("breakpoint".to_string()),
        }
        .to_json();
        assert_eq!(json, r#"{"type":"state","running":false,"cause":"breakpoint"}"#);
    }

    #[test]
    fn test_round_trip() {
        let event = StateNotification::State { running: true, cause: None };
        let back: StateNotification = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(back, event);
    }
}
