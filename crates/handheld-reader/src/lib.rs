//! Reader sessions for handheld RFID/barcode readers.
//!
//! [`DeviceManager`] opens a session on a transport picked by the
//! [`TransportFactory`](handheld_transport::TransportFactory), runs a
//! controller task that owns the link and the reader state machine, and
//! publishes [`ReaderEvent`]s to any number of subscribers.
//!
//! - [`state`]: connection state machine with transition history
//! - `controller`: actor owning the transport and the state machine
//! - [`manager`]: session handle and single-session registry
//! - [`config`]: session configuration and UI context mapping
//! - [`events`]: published events

pub mod config;
mod controller;
pub mod error;
pub mod events;
pub mod manager;
pub mod state;

pub use config::{ContextModes, SessionConfig};
pub use error::{ReaderError, Result};
pub use events::ReaderEvent;
pub use manager::{DeviceManager, SessionRegistry};
pub use state::{ReaderStateMachine, StateHistory, StateTransition};
