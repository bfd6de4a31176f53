//! Session configuration.

use handheld_core::constants::DEFAULT_SETTLE_DELAY_MS;
use handheld_core::{ReaderMode, ScanSettings};
use handheld_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default capacity of the session event channels.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Maps UI contexts (screen names, workflow steps) to reader modes.
///
/// Contexts without an entry map to [`ReaderMode::Idle`].
///
/// ```
/// use handheld_core::ReaderMode;
/// use handheld_reader::ContextModes;
///
/// let contexts = ContextModes::new()
///     .with("stocktake", ReaderMode::Inventory)
///     .with("checkout", ReaderMode::Barcode);
///
/// assert_eq!(contexts.mode_for("stocktake"), ReaderMode::Inventory);
/// assert_eq!(contexts.mode_for("settings"), ReaderMode::Idle);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextModes {
    modes: HashMap<String, ReaderMode>,
}

impl ContextModes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, context: impl Into<String>, mode: ReaderMode) -> Self {
        self.modes.insert(context.into(), mode);
        self
    }

    pub fn insert(&mut self, context: impl Into<String>, mode: ReaderMode) {
        self.modes.insert(context.into(), mode);
    }

    pub fn mode_for(&self, context: &str) -> ReaderMode {
        self.modes.get(context).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

/// Everything needed to open a reader session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub transport: TransportConfig,

    /// Mode pushed right after connecting.
    pub initial_mode: ReaderMode,

    /// Settings pushed right after connecting.
    pub initial_settings: ScanSettings,

    /// Pause between a completed cycle and the automatic restart of a
    /// continuous scan.
    pub settle_delay: Duration,

    /// Battery query period; `None` relies on the reader's own reports.
    pub battery_poll_interval: Option<Duration>,

    pub contexts: ContextModes,

    /// Capacity of the controller and subscriber channels.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            initial_mode: ReaderMode::Idle,
            initial_settings: ScanSettings::default(),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            battery_poll_interval: None,
            contexts: ContextModes::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            ..Self::default()
        }
    }

    pub fn with_initial_mode(mut self, mode: ReaderMode) -> Self {
        self.initial_mode = mode;
        self
    }

    pub fn with_initial_settings(mut self, settings: ScanSettings) -> Self {
        self.initial_settings = settings;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_battery_poll_interval(mut self, interval: Duration) -> Self {
        self.battery_poll_interval = Some(interval);
        self
    }

    pub fn with_contexts(mut self, contexts: ContextModes) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.initial_mode, ReaderMode::Idle);
        assert_eq!(config.settle_delay, Duration::from_millis(100));
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert!(config.battery_poll_interval.is_none());
        assert!(config.contexts.is_empty());
    }

    #[test]
    fn test_contexts_deserialize_from_map() {
        let contexts: ContextModes =
            serde_json::from_str(r#"{"receiving":"inventory","find":"locate"}"#).unwrap();
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts.mode_for("find"), ReaderMode::Locate);
        assert_eq!(contexts.mode_for("unknown"), ReaderMode::Idle);
    }
}
