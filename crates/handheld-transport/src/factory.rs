//! Transport selection.
//!
//! [`TransportFactory`] turns a [`TransportConfig`] into a connected
//! [`AnyTransport`]. With [`TransportPreference::Auto`] it walks the
//! candidates in order Radio, Proxy, Simulated and moves on whenever a link
//! cannot be brought up. An explicit preference is tried alone.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(feature = "ble")]
use crate::ble::BleAdapter;
use crate::devices::AnyTransport;
use crate::error::{Result, TransportError};
use crate::proxy::{ProxyConfig, ProxyTransport};
use crate::radio::RadioConfig;
#[cfg(feature = "ble")]
use crate::radio::RadioTransport;
use crate::simulated::{SimulatedTransport, SimulatorConfig, SimulatorHandle};
use crate::traits::{Transport, TransportEvent, TransportKind};

/// Environment variable overriding the configured preference.
pub const TRANSPORT_ENV_VAR: &str = "HANDHELD_TRANSPORT";

/// Which transport to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// Radio, then proxy, then simulator.
    #[default]
    Auto,
    Radio,
    Proxy,
    Simulated,
}

impl TransportPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Radio => "radio",
            Self::Proxy => "proxy",
            Self::Simulated => "simulated",
        }
    }
}

impl FromStr for TransportPreference {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "radio" | "ble" => Ok(Self::Radio),
            "proxy" => Ok(Self::Proxy),
            "simulated" | "sim" => Ok(Self::Simulated),
            other => Err(TransportError::invalid_config(format!(
                "unknown transport '{other}'"
            ))),
        }
    }
}

impl fmt::Display for TransportPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport preference plus the configuration of every kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub preference: TransportPreference,
    pub radio: RadioConfig,

    /// Bridge to use. Without one, the proxy is skipped in `Auto` mode.
    pub proxy: Option<ProxyConfig>,

    pub simulator: SimulatorConfig,
}

impl TransportConfig {
    /// Simulator only.
    pub fn simulated(simulator: SimulatorConfig) -> Self {
        Self {
            preference: TransportPreference::Simulated,
            simulator,
            ..Self::default()
        }
    }

    /// Proxy only.
    pub fn proxy(proxy: ProxyConfig) -> Self {
        Self {
            preference: TransportPreference::Proxy,
            proxy: Some(proxy),
            ..Self::default()
        }
    }

    pub fn with_preference(mut self, preference: TransportPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn with_radio(mut self, radio: RadioConfig) -> Self {
        self.radio = radio;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_simulator(mut self, simulator: SimulatorConfig) -> Self {
        self.simulator = simulator;
        self
    }

    /// Apply `HANDHELD_TRANSPORT` on top of the configured preference.
    pub fn with_env_override(self) -> Result<Self> {
        self.with_override(std::env::var(TRANSPORT_ENV_VAR).ok().as_deref())
    }

    /// Apply an optional textual preference on top of the configured one.
    pub fn with_override(mut self, value: Option<&str>) -> Result<Self> {
        if let Some(value) = value {
            self.preference = value.parse()?;
        }
        Ok(self)
    }
}

/// A transport built but not yet connected.
#[derive(Debug)]
pub struct BuiltTransport {
    pub transport: AnyTransport,

    /// Present for the simulated transport.
    pub simulator: Option<SimulatorHandle>,
}

/// A transport whose link is up.
#[derive(Debug)]
pub struct ConnectedTransport {
    pub transport: AnyTransport,
    pub events: mpsc::Receiver<TransportEvent>,
    pub simulator: Option<SimulatorHandle>,
}

/// Builds and connects transports from a [`TransportConfig`].
#[derive(Debug, Clone, Default)]
pub struct TransportFactory {
    config: TransportConfig,
}

impl TransportFactory {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Factory for `config` with `HANDHELD_TRANSPORT` applied on top.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidConfig` if the variable names no
    /// known transport.
    pub fn from_env(config: TransportConfig) -> Result<Self> {
        let config = config.with_env_override()?;
        if let Ok(value) = std::env::var(TRANSPORT_ENV_VAR) {
            debug!(preference = %config.preference, %value, "Transport preference from environment");
        }
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Kinds that will be tried, in order.
    pub fn candidates(&self) -> Vec<TransportKind> {
        match self.config.preference {
            TransportPreference::Radio => vec![TransportKind::Radio],
            TransportPreference::Proxy => vec![TransportKind::Proxy],
            TransportPreference::Simulated => vec![TransportKind::Simulated],
            TransportPreference::Auto => {
                let mut kinds = Vec::with_capacity(3);
                if cfg!(feature = "ble") {
                    kinds.push(TransportKind::Radio);
                }
                if self.config.proxy.is_some() {
                    kinds.push(TransportKind::Proxy);
                }
                kinds.push(TransportKind::Simulated);
                kinds
            }
        }
    }

    /// Construct a transport of the given kind without connecting it.
    pub fn build(&self, kind: TransportKind) -> Result<BuiltTransport> {
        match kind {
            TransportKind::Radio => self.build_radio(),
            TransportKind::Proxy => {
                let config = self.config.proxy.clone().unwrap_or_default();
                Ok(BuiltTransport {
                    transport: ProxyTransport::new(config).into(),
                    simulator: None,
                })
            }
            TransportKind::Simulated => {
                let (transport, handle) = SimulatedTransport::new(self.config.simulator.clone());
                Ok(BuiltTransport {
                    transport: transport.into(),
                    simulator: Some(handle),
                })
            }
        }
    }

    #[cfg(feature = "ble")]
    fn build_radio(&self) -> Result<BuiltTransport> {
        let transport = RadioTransport::new(BleAdapter::new(), self.config.radio.clone());
        Ok(BuiltTransport {
            transport: transport.into(),
            simulator: None,
        })
    }

    #[cfg(not(feature = "ble"))]
    fn build_radio(&self) -> Result<BuiltTransport> {
        Err(TransportError::unsupported(
            "radio transport (built without the `ble` feature)",
        ))
    }

    /// Connect the first candidate that comes up.
    ///
    /// Only connection errors move on to the next candidate; the last
    /// candidate's error is returned if none succeeds.
    pub async fn connect(&self) -> Result<ConnectedTransport> {
        let candidates = self.candidates();
        let mut last_error = None;

        for (index, kind) in candidates.iter().copied().enumerate() {
            let built = match self.build(kind) {
                Ok(built) => built,
                Err(e) if e.is_connection_error() && index + 1 < candidates.len() => {
                    warn!(transport = %kind, error = %e, "Transport unavailable, trying next");
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let BuiltTransport {
                mut transport,
                simulator,
            } = built;

            match transport.connect().await {
                Ok(events) => {
                    info!(transport = %kind, "Transport connected");
                    return Ok(ConnectedTransport {
                        transport,
                        events,
                        simulator,
                    });
                }
                Err(e) if e.is_connection_error() && index + 1 < candidates.len() => {
                    warn!(transport = %kind, error = %e, "Transport failed, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| TransportError::unsupported("no transport candidates")))
    }
}
