//! Bridge process exposing a handheld reader over TCP.
//!
//! Hosts that cannot reach the reader directly (no Bluetooth stack, remote
//! machines) connect with the proxy transport. The bridge owns the real
//! link, radio or simulated, and relays frames both ways as JSON lines.
//!
//! # Example
//!
//! ```no_run
//! use handheld_bridge::{BridgeConfig, BridgeServer};
//! use handheld_transport::{SimulatorConfig, TransportConfig};
//!
//! # async fn example() -> handheld_bridge::Result<()> {
//! let config = BridgeConfig::new(
//!     "0.0.0.0:7878".parse().unwrap(),
//!     TransportConfig::simulated(SimulatorConfig::default()),
//! );
//! let server = BridgeServer::bind(config).await?;
//! server.run().await
//! # }
//! ```

pub mod error;
pub mod server;

pub use error::{BridgeError, Result};
pub use server::{BridgeConfig, BridgeServer};
