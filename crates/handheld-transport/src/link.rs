//! Live-link bookkeeping shared by the concrete transports.
//!
//! Every transport has the same two ways of losing its link: an explicit
//! `disconnect()` from the owner and an unexpected loss noticed by a
//! background task. Both go through [`LinkSlot::release`], which hands the
//! link out exactly once, so `Disconnected` is pushed at most once.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::queue::CommandQueue;
use crate::traits::{TransportEvent, WriteCompletion};

/// Capacity of the inbound event channel handed out by `connect`.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Resources owned by one live connection.
#[derive(Debug)]
pub(crate) struct ActiveLink {
    queue: CommandQueue,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveLink {
    pub(crate) fn new(queue: CommandQueue) -> Self {
        Self {
            queue,
            tasks: Vec::new(),
        }
    }

    /// Cancel pending writes and stop the background tasks.
    ///
    /// Must not be called from one of those tasks; they use
    /// [`ActiveLink::close_queue`] instead.
    pub(crate) fn shutdown(self) {
        self.queue.close();
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Cancel pending writes, leaving the background tasks running.
    pub(crate) fn close_queue(self) {
        self.queue.close();
    }
}

/// Connection flag plus the handles of the current link.
#[derive(Debug, Default)]
pub(crate) struct LinkSlot {
    connected: AtomicBool,
    link: Mutex<Option<ActiveLink>>,
}

impl LinkSlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveLink>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Store a freshly established link and mark it connected.
    pub(crate) fn install(&self, link: ActiveLink) {
        let previous = self.lock().replace(link);
        self.connected.store(true, Ordering::SeqCst);
        if let Some(previous) = previous {
            previous.shutdown();
        }
    }

    /// Attach a background task to the current link.
    pub(crate) fn attach(&self, task: JoinHandle<()>) {
        match self.lock().as_mut() {
            Some(link) => link.tasks.push(task),
            None => task.abort(),
        }
    }

    /// Submit bytes to the current link's queue.
    pub(crate) fn submit(&self, bytes: Bytes) -> Result<WriteCompletion> {
        match self.lock().as_ref() {
            Some(link) if self.is_connected() => link.queue.submit(bytes),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Take the link if it is still up. Returns `Some` to exactly one caller.
    pub(crate) fn release(&self) -> Option<ActiveLink> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return None;
        }
        self.lock().take()
    }
}

/// Report an unexpected link loss from a background task.
///
/// Sends `Disconnected` only if this call won the release.
pub(crate) async fn report_link_lost(
    slot: &LinkSlot,
    events: &mpsc::Sender<TransportEvent>,
    reason: Option<String>,
) {
    let Some(link) = slot.release() else {
        return;
    };
    link.close_queue();
    debug!(reason = reason.as_deref().unwrap_or("unknown"), "Link lost");
    let _ = events.send(TransportEvent::Disconnected { reason }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{LinkWriter, QueueConfig, WriteError};

    struct NullWriter;

    impl LinkWriter for NullWriter {
        async fn write_frame(&mut self, _bytes: &[u8]) -> std::result::Result<(), WriteError> {
            Ok(())
        }
    }

    fn link() -> ActiveLink {
        ActiveLink::new(CommandQueue::spawn(NullWriter, QueueConfig::default()))
    }

    #[tokio::test]
    async fn test_release_happens_once() {
        let slot = LinkSlot::new();
        slot.install(link());
        assert!(slot.is_connected());

        assert!(slot.release().is_some());
        assert!(slot.release().is_none());
        assert!(!slot.is_connected());
    }

    #[tokio::test]
    async fn test_submit_requires_link() {
        let slot = LinkSlot::new();
        assert!(matches!(
            slot.submit(Bytes::from_static(b"x")),
            Err(TransportError::NotConnected)
        ));

        slot.install(link());
        slot.submit(Bytes::from_static(b"x")).unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_link_lost_reported_once() {
        let slot = LinkSlot::new();
        slot.install(link());
        let (tx, mut rx) = mpsc::channel(4);

        report_link_lost(&slot, &tx, Some("out of range".into())).await;
        report_link_lost(&slot, &tx, None).await;
        drop(tx);

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Disconnected {
                reason: Some("out of range".into())
            })
        );
        assert_eq!(rx.recv().await, None);
    }
}
