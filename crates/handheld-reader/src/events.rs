//! Events published by a reader session.

use handheld_core::{BarcodeRead, BatteryStatus, ReaderMode, ReaderState, TagReading, TriggerState};
use serde::Serialize;

/// Everything a session subscriber can observe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ReaderEvent {
    StateChanged { from: ReaderState, to: ReaderState },

    /// The reader confirmed a mode change.
    ModeChanged(ReaderMode),

    /// Tags decoded from one inbound chunk, in arrival order.
    TagRead(Vec<TagReading>),

    BarcodeRead(BarcodeRead),
    BatteryUpdate(BatteryStatus),

    /// Trigger state reported by the reader. Never starts a scan by itself.
    TriggerChanged(TriggerState),

    /// The link dropped without being asked to. The session is gone.
    TransportDisconnected { reason: Option<String> },
}

impl ReaderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ReaderEvent::StateChanged { .. } => "state_changed",
            ReaderEvent::ModeChanged(_) => "mode_changed",
            ReaderEvent::TagRead(_) => "tag_read",
            ReaderEvent::BarcodeRead(_) => "barcode_read",
            ReaderEvent::BatteryUpdate(_) => "battery_update",
            ReaderEvent::TriggerChanged(_) => "trigger_changed",
            ReaderEvent::TransportDisconnected { .. } => "transport_disconnected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ReaderEvent::StateChanged {
            from: ReaderState::Connected,
            to: ReaderState::Scanning,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({
                "event": "state_changed",
                "data": { "from": "connected", "to": "scanning" }
            })
        );
        assert_eq!(event.name(), "state_changed");
    }

    #[test]
    fn test_disconnect_event_name() {
        let event = ReaderEvent::TransportDisconnected { reason: None };
        assert_eq!(event.name(), "transport_disconnected");
    }
}
