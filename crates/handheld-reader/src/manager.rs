//! Reader session management.
//!
//! A [`DeviceManager`] is one live session: its lifetime is the lifetime of
//! the link. At most one session can be live per [`SessionRegistry`]; the
//! claim is a single compare-and-swap, so two concurrent `create` calls can
//! never both succeed.
//!
//! ```text
//!  caller ──► DeviceManager ──(mpsc)──► controller task ──► Transport
//!                  ▲                          │
//!                  │                          ▼
//!   broadcast ◄── event pump ◄──(mpsc)── ReaderEvent
//! ```
//!
//! If the link drops on its own, the pump frees the registry slot before it
//! publishes [`ReaderEvent::TransportDisconnected`], so a subscriber reacting
//! to that event can open a new session right away.
//!
//! # Example
//!
//! ```
//! use handheld_core::ReaderMode;
//! use handheld_reader::{DeviceManager, ReaderEvent, SessionConfig, SessionRegistry};
//! use handheld_transport::{SimulatorConfig, TransportConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> handheld_reader::Result<()> {
//! let registry = SessionRegistry::new();
//! let config = SessionConfig::new(TransportConfig::simulated(SimulatorConfig::default()));
//!
//! let session = DeviceManager::create(&registry, config).await?;
//! let mut events = session.subscribe();
//!
//! session.set_mode(ReaderMode::Inventory).await?;
//! session.start_scanning().await?;
//! while let Ok(event) = events.recv().await {
//!     if let ReaderEvent::TagRead(tags) = event {
//!         println!("{} tag(s)", tags.len());
//!         break;
//!     }
//! }
//!
//! session.destroy().await;
//! assert!(!registry.is_active());
//! # Ok(())
//! # }
//! ```

use handheld_core::{ReaderMode, ReaderState, ScanSettings};
use handheld_transport::{AnyTransport, SimulatorHandle, TransportFactory, TransportKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ContextModes, SessionConfig};
use crate::controller::{self, ControlRequest, ControllerConfig, Reply, TransportSource};
use crate::error::{ReaderError, Result};
use crate::events::ReaderEvent;
use crate::state::StateHistory;

const NO_SESSION: u64 = 0;

/// Tracks the single live session.
///
/// Share one registry (behind an `Arc`) wherever sessions are created.
#[derive(Debug)]
pub struct SessionRegistry {
    active: AtomicU64,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Id of the live session, if any.
    pub fn active_session(&self) -> Option<u64> {
        match self.active.load(Ordering::SeqCst) {
            NO_SESSION => None,
            id => Some(id),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_session().is_some()
    }

    fn claim(self: &Arc<Self>) -> Result<SessionLease> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        match self
            .active
            .compare_exchange(NO_SESSION, id, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(SessionLease {
                registry: Arc::clone(self),
                id,
            }),
            Err(current) => Err(ReaderError::SessionActive {
                session_id: current,
            }),
        }
    }

    fn release(&self, id: u64) -> bool {
        self.active
            .compare_exchange(id, NO_SESSION, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            active: AtomicU64::new(NO_SESSION),
            next_id: AtomicU64::new(1),
        }
    }
}

/// Claim on the registry slot. Released at most once, at the latest on drop.
#[derive(Debug)]
struct SessionLease {
    registry: Arc<SessionRegistry>,
    id: u64,
}

impl SessionLease {
    fn release(&self) -> bool {
        self.registry.release(self.id)
    }

    fn is_held(&self) -> bool {
        self.registry.active_session() == Some(self.id)
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Handle to a live reader session.
#[derive(Debug)]
pub struct DeviceManager {
    lease: Arc<SessionLease>,
    requests: mpsc::Sender<ControlRequest>,
    events: broadcast::Sender<ReaderEvent>,
    state: watch::Receiver<ReaderState>,
    kind: TransportKind,
    simulator: Option<SimulatorHandle>,
    contexts: ContextModes,
    destroyed: AtomicBool,
    settings_watch: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceManager {
    /// Open a session on the transport chosen by `config.transport`.
    ///
    /// `HANDHELD_TRANSPORT`, when set, replaces the configured preference.
    ///
    /// # Errors
    /// - [`ReaderError::Transport`] if `HANDHELD_TRANSPORT` names no known
    ///   transport
    /// - [`ReaderError::SessionActive`] if the registry already has a live
    ///   session
    /// - [`ReaderError::Transport`] if no link could be established
    /// - any error from pushing the initial mode and settings; the session
    ///   is torn down first
    pub async fn create(registry: &Arc<SessionRegistry>, config: SessionConfig) -> Result<Self> {
        let factory = TransportFactory::from_env(config.transport.clone())?;
        Self::start(registry, TransportSource::Factory(factory), config).await
    }

    /// Open a session on an already built, unconnected transport.
    pub async fn create_with_transport(
        registry: &Arc<SessionRegistry>,
        transport: AnyTransport,
        config: SessionConfig,
    ) -> Result<Self> {
        Self::start(registry, TransportSource::Prebuilt(transport), config).await
    }

    async fn start(
        registry: &Arc<SessionRegistry>,
        source: TransportSource,
        config: SessionConfig,
    ) -> Result<Self> {
        let lease = Arc::new(registry.claim()?);
        info!(session_id = lease.id, "Opening reader session");

        let capacity = config.event_capacity.max(1);
        let (events, _) = broadcast::channel(capacity);
        let (controller_tx, controller_rx) = mpsc::channel(capacity);
        tokio::spawn(pump_events(
            controller_rx,
            events.clone(),
            Arc::clone(&lease),
        ));

        let link = match controller::start(source, ControllerConfig::from(&config), controller_tx)
            .await
        {
            Ok(link) => link,
            Err(e) => {
                warn!(session_id = lease.id, error = %e, "Reader session failed to open");
                lease.release();
                return Err(e);
            }
        };

        let manager = Self {
            lease,
            requests: link.requests,
            events,
            state: link.state,
            kind: link.kind,
            simulator: link.simulator,
            contexts: config.contexts.clone(),
            destroyed: AtomicBool::new(false),
            settings_watch: Mutex::new(None),
        };

        let initial = async {
            manager
                .set_settings(config.initial_settings.clone())
                .await?;
            manager.set_mode(config.initial_mode).await
        };
        if let Err(e) = initial.await {
            warn!(session_id = manager.session_id(), error = %e, "Initial configuration failed");
            manager.destroy().await;
            return Err(e);
        }

        info!(
            session_id = manager.session_id(),
            transport = %manager.kind,
            "Reader session open"
        );
        Ok(manager)
    }

    pub fn session_id(&self) -> u64 {
        self.lease.id
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    /// Control handle of the simulated reader, for simulated sessions.
    pub fn simulator(&self) -> Option<&SimulatorHandle> {
        self.simulator.as_ref()
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ReaderEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ReaderState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<ReaderState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst) && self.lease.is_held() && self.state().is_connected()
    }

    async fn request(&self, make: impl FnOnce(Reply) -> ControlRequest) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ReaderError::SessionClosed);
        }
        let (reply, response) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| ReaderError::SessionClosed)?;
        response.await.map_err(|_| ReaderError::SessionClosed)?
    }

    /// Recent state transitions and time spent in the current state.
    pub async fn state_history(&self) -> Result<StateHistory> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ReaderError::SessionClosed);
        }
        let (reply, response) = oneshot::channel();
        self.requests
            .send(ControlRequest::History { reply })
            .await
            .map_err(|_| ReaderError::SessionClosed)?;
        response.await.map_err(|_| ReaderError::SessionClosed)
    }

    /// Switch the reader mode.
    ///
    /// Setting the mode already in effect succeeds without touching the
    /// link. While scanning, the change waits until the scan stops.
    pub async fn set_mode(&self, mode: ReaderMode) -> Result<()> {
        self.request(|reply| ControlRequest::SetMode { mode, reply })
            .await
    }

    /// Push scan settings to the reader.
    pub async fn set_settings(&self, settings: ScanSettings) -> Result<()> {
        self.request(|reply| ControlRequest::SetSettings { settings, reply })
            .await
    }

    /// Follow a settings source: the current value is pushed right away and
    /// every change after that. Replaces any previous source.
    pub fn watch_settings(&self, mut source: watch::Receiver<ScanSettings>) {
        let requests = self.requests.clone();
        let session_id = self.session_id();

        let task = tokio::spawn(async move {
            loop {
                let settings = source.borrow_and_update().clone();
                let (reply, response) = oneshot::channel();
                if requests
                    .send(ControlRequest::SetSettings { settings, reply })
                    .await
                    .is_err()
                {
                    break;
                }
                match response.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(session_id, error = %e, "Settings update rejected"),
                    Err(_) => break,
                }
                if source.changed().await.is_err() {
                    debug!(session_id, "Settings source closed");
                    break;
                }
            }
        });

        if let Some(previous) = self.lock_settings_watch().replace(task) {
            previous.abort();
        }
    }

    /// Switch to the mode mapped to a UI context.
    pub async fn set_context(&self, context: &str) -> Result<()> {
        let mode = self.contexts.mode_for(context);
        debug!(context, %mode, "Context changed");
        self.set_mode(mode).await
    }

    pub async fn start_scanning(&self) -> Result<()> {
        self.request(|reply| ControlRequest::StartScanning { reply })
            .await
    }

    pub async fn stop_scanning(&self) -> Result<()> {
        self.request(|reply| ControlRequest::StopScanning { reply })
            .await
    }

    /// Disconnect and free the registry slot.
    ///
    /// Idempotent. Pending commands are abandoned and their callers get
    /// [`ReaderError::SessionClosed`].
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_settings_watch();

        let (reply, done) = oneshot::channel();
        if self
            .requests
            .send(ControlRequest::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }

        self.lease.release();
        info!(session_id = self.session_id(), "Reader session destroyed");
    }

    fn lock_settings_watch(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.settings_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_settings_watch(&self) {
        if let Some(task) = self.lock_settings_watch().take() {
            task.abort();
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_settings_watch();
        // Dropping the request sender also stops the controller; this only
        // makes it prompt.
        let (reply, _) = oneshot::channel();
        let _ = self.requests.try_send(ControlRequest::Shutdown { reply });
        self.lease.release();
        debug!(session_id = self.session_id(), "Reader session dropped");
    }
}

/// Forward controller events to subscribers.
async fn pump_events(
    mut controller: mpsc::Receiver<ReaderEvent>,
    events: broadcast::Sender<ReaderEvent>,
    lease: Arc<SessionLease>,
) {
    while let Some(event) = controller.recv().await {
        if let ReaderEvent::TransportDisconnected { reason } = &event {
            if lease.release() {
                warn!(
                    session_id = lease.id,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "Reader session lost its link"
                );
            }
        }
        // No subscribers is fine.
        let _ = events.send(event);
    }
}
