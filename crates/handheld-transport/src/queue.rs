//! Reliable command queue.
//!
//! Serializes writes over a half-duplex link: one command in flight, FIFO
//! order, bounded backlog. A worker task drains the queue through a
//! [`LinkWriter`]; transient failures are retried in place with an
//! escalating delay, so the retried command stays ahead of everything
//! submitted after it.
//!
//! ```text
//! submit ──> [ waiting... ] ──> worker ──> LinkWriter::write_frame
//!                                  │  Transient: sleep(schedule[n]), retry
//!                                  │  Fatal / retries exhausted: fail
//!                                  └─ Ok: resolve completion
//! ```

use bytes::Bytes;
use handheld_core::constants::{
    DEFAULT_MAX_RETRIES, DEFAULT_QUEUE_CAPACITY, DEFAULT_RETRY_SCHEDULE_MS,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Result, TransportError};
use crate::traits::WriteCompletion;

/// Outcome of a failed low-level write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// Worth retrying (link busy, write timed out).
    Transient(String),

    /// Retrying cannot help (link gone, characteristic missing).
    Fatal(String),
}

impl WriteError {
    pub fn message(&self) -> &str {
        match self {
            WriteError::Transient(message) | WriteError::Fatal(message) => message,
        }
    }
}

/// Low-level frame writer driven by the queue worker.
pub trait LinkWriter: Send + 'static {
    /// Deliver one encoded frame.
    fn write_frame(
        &mut self,
        bytes: &[u8],
    ) -> impl Future<Output = std::result::Result<(), WriteError>> + Send;
}

/// Retry behaviour for transient write failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Delay before each retry; the last entry repeats.
    pub schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            schedule: DEFAULT_RETRY_SCHEDULE_MS
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            schedule: Vec::new(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.schedule = schedule;
        self
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let index = usize::try_from(retry).unwrap_or(usize::MAX);
        self.schedule
            .get(index)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Queue sizing and retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Bound on waiting plus in-flight commands.
    pub capacity: usize,

    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

struct PendingCommand {
    bytes: Bytes,
    done: oneshot::Sender<Result<()>>,
}

impl PendingCommand {
    fn resolve(self, result: Result<()>) {
        // Caller may have dropped the completion.
        let _ = self.done.send(result);
    }
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<PendingCommand>,
    in_flight: bool,
    closed: bool,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.waiting.len() + usize::from(self.in_flight)
    }
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    cancel: CancellationToken,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded FIFO of outgoing frames with a single in-flight write.
///
/// # Examples
///
/// ```
/// use handheld_transport::queue::{CommandQueue, LinkWriter, QueueConfig, WriteError};
///
/// struct Sink;
///
/// impl LinkWriter for Sink {
///     async fn write_frame(&mut self, _bytes: &[u8]) -> Result<(), WriteError> {
///         Ok(())
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() -> handheld_transport::Result<()> {
/// let queue = CommandQueue::spawn(Sink, QueueConfig::default());
/// queue.submit(bytes::Bytes::from_static(&[0xA7, 0xB3]))?.await?;
/// queue.close();
/// # Ok(())
/// # }
/// ```
pub struct CommandQueue {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl CommandQueue {
    /// Start the worker task over `writer`.
    pub fn spawn<W: LinkWriter>(writer: W, config: QueueConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            capacity: config.capacity.max(1),
        });

        let worker = tokio::spawn(run_worker(Arc::clone(&shared), writer, config.retry));

        Self { shared, worker }
    }

    /// Enqueue a frame.
    ///
    /// # Errors
    /// Returns `TransportError::QueueFull` when the bound is reached and
    /// `TransportError::NotConnected` once the queue is closed.
    pub fn submit(&self, bytes: Bytes) -> Result<WriteCompletion> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(TransportError::NotConnected);
        }
        if state.pending() >= self.shared.capacity {
            debug!(capacity = self.shared.capacity, "Command queue full");
            return Err(TransportError::queue_full(self.shared.capacity));
        }

        let (done, rx) = oneshot::channel();
        state.waiting.push_back(PendingCommand { bytes, done });
        trace!(pending = state.pending(), "Command queued");
        drop(state);

        self.shared.notify.notify_one();
        Ok(WriteCompletion::pending(rx))
    }

    /// Waiting plus in-flight commands.
    pub fn len(&self) -> usize {
        self.shared.lock().pending()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Cancel every pending command and stop the worker.
    ///
    /// Interrupts an in-flight write or backoff sleep. Idempotent.
    pub fn close(&self) {
        let drained = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.waiting)
        };

        self.shared.cancel.cancel();
        if !drained.is_empty() {
            debug!(cancelled = drained.len(), "Command queue closed");
        }
        for command in drained {
            command.resolve(Err(TransportError::Cancelled));
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.close();
        self.worker.abort();
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("CommandQueue")
            .field("waiting", &state.waiting.len())
            .field("in_flight", &state.in_flight)
            .field("closed", &state.closed)
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

async fn run_worker<W: LinkWriter>(shared: Arc<Shared>, mut writer: W, policy: RetryPolicy) {
    loop {
        let next = {
            let mut state = shared.lock();
            if state.closed {
                break;
            }
            let next = state.waiting.pop_front();
            state.in_flight = next.is_some();
            next
        };

        let Some(command) = next else {
            tokio::select! {
                _ = shared.notify.notified() => continue,
                _ = shared.cancel.cancelled() => break,
            }
        };

        let result = tokio::select! {
            result = deliver(&mut writer, &command.bytes, &policy, &shared.cancel) => result,
            _ = shared.cancel.cancelled() => Err(TransportError::Cancelled),
        };

        shared.lock().in_flight = false;
        command.resolve(result);
    }

    trace!("Command queue worker stopped");
}

/// Write one command, retrying transient failures per `policy`.
async fn deliver<W: LinkWriter>(
    writer: &mut W,
    bytes: &[u8],
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match writer.write_frame(bytes).await {
            Ok(()) => {
                trace!(attempts, len = bytes.len(), "Frame written");
                return Ok(());
            }
            Err(WriteError::Transient(message)) if attempts <= policy.max_retries => {
                let delay = policy.delay_for(attempts - 1);
                warn!(
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Transient write failure, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                }
            }
            Err(error) => {
                warn!(attempts, error = %error.message(), "Write failed");
                return Err(TransportError::write_failed(attempts, error.message()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Semaphore;

    /// Writer that records frames and plays back a script of failures.
    #[derive(Clone, Default)]
    struct ScriptedWriter {
        written: Arc<Mutex<Vec<Bytes>>>,
        script: Arc<Mutex<VecDeque<WriteError>>>,
        attempts: Arc<AtomicU32>,
        gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedWriter {
        fn failing(errors: Vec<WriteError>) -> Self {
            Self {
                script: Arc::new(Mutex::new(errors.into())),
                ..Self::default()
            }
        }

        fn gated() -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            (
                Self {
                    gate: Some(Arc::clone(&gate)),
                    ..Self::default()
                },
                gate,
            )
        }

        fn written(&self) -> Vec<Bytes> {
            self.written.lock().unwrap().clone()
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl LinkWriter for ScriptedWriter {
        async fn write_frame(&mut self, bytes: &[u8]) -> std::result::Result<(), WriteError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            let scripted = self.script.lock().unwrap().pop_front();
            if let Some(error) = scripted {
                return Err(error);
            }
            self.written
                .lock()
                .unwrap()
                .push(Bytes::copy_from_slice(bytes));
            Ok(())
        }
    }

    fn frame(n: u8) -> Bytes {
        Bytes::from(vec![0xA7, 0xB3, n])
    }

    fn transient() -> WriteError {
        WriteError::Transient("busy".into())
    }

    #[tokio::test]
    async fn test_writes_in_submission_order() {
        let writer = ScriptedWriter::default();
        let queue = CommandQueue::spawn(writer.clone(), QueueConfig::default());

        let completions: Vec<_> = (0..5).map(|n| queue.submit(frame(n)).unwrap()).collect();
        for completion in completions {
            completion.await.unwrap();
        }

        assert_eq!(writer.written(), (0..5).map(frame).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_twice_then_success() {
        let writer = ScriptedWriter::failing(vec![transient(), transient()]);
        let queue = CommandQueue::spawn(writer.clone(), QueueConfig::default());

        let started = tokio::time::Instant::now();
        queue.submit(frame(1)).unwrap().await.unwrap();

        assert_eq!(writer.attempts(), 3);
        assert_eq!(writer.written(), vec![frame(1)]);
        // 50ms + 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    #[tokio::test(start_paused = true)]
    async fn test_retry_bound(#[case] max_retries: u32) {
        let writer = ScriptedWriter::failing(vec![transient(); 10]);
        let config = QueueConfig::default()
            .with_retry(RetryPolicy::default().with_max_retries(max_retries));
        let queue = CommandQueue::spawn(writer.clone(), config);

        let result = queue.submit(frame(1)).unwrap().await;

        match result {
            Err(TransportError::WriteFailed { attempts, .. }) => {
                assert_eq!(attempts, max_retries + 1)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(writer.attempts(), max_retries + 1);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let writer = ScriptedWriter::failing(vec![WriteError::Fatal("gone".into())]);
        let queue = CommandQueue::spawn(writer.clone(), QueueConfig::default());

        let result = queue.submit(frame(1)).unwrap().await;
        assert!(matches!(
            result,
            Err(TransportError::WriteFailed { attempts: 1, .. })
        ));

        // Next command is unaffected.
        queue.submit(frame(2)).unwrap().await.unwrap();
        assert_eq!(writer.written(), vec![frame(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_command_stays_ahead() {
        let writer = ScriptedWriter::failing(vec![transient()]);
        let queue = CommandQueue::spawn(writer.clone(), QueueConfig::default());

        let first = queue.submit(frame(1)).unwrap();
        let second = queue.submit(frame(2)).unwrap();
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(writer.written(), vec![frame(1), frame(2)]);
    }

    #[tokio::test]
    async fn test_queue_full_backpressure() {
        let (writer, gate) = ScriptedWriter::gated();
        let queue = CommandQueue::spawn(writer.clone(), QueueConfig::default().with_capacity(2));

        let first = queue.submit(frame(1)).unwrap();
        let second = queue.submit(frame(2)).unwrap();

        // Bound covers the in-flight command too.
        assert_eq!(queue.len(), 2);
        assert!(matches!(
            queue.submit(frame(3)),
            Err(TransportError::QueueFull { capacity: 2 })
        ));

        gate.add_permits(2);
        first.await.unwrap();
        second.await.unwrap();

        gate.add_permits(1);
        queue.submit(frame(4)).unwrap().await.unwrap();
        assert_eq!(writer.written(), vec![frame(1), frame(2), frame(4)]);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_commands() {
        let (writer, _gate) = ScriptedWriter::gated();
        let queue = CommandQueue::spawn(writer.clone(), QueueConfig::default());

        let completions: Vec<_> = (0..3).map(|n| queue.submit(frame(n)).unwrap()).collect();
        tokio::task::yield_now().await;
        queue.close();

        for completion in completions {
            assert!(matches!(completion.await, Err(TransportError::Cancelled)));
        }
        assert!(queue.is_closed());
        assert!(matches!(
            queue.submit(frame(9)),
            Err(TransportError::NotConnected)
        ));
        assert!(writer.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_backoff() {
        let writer = ScriptedWriter::failing(vec![transient(); 10]);
        let config = QueueConfig::default().with_retry(
            RetryPolicy::default()
                .with_max_retries(5)
                .with_schedule(vec![Duration::from_secs(3600)]),
        );
        let queue = CommandQueue::spawn(writer.clone(), config);

        let completion = queue.submit(frame(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        assert!(matches!(completion.await, Err(TransportError::Cancelled)));
        assert_eq!(writer.attempts(), 1);
    }

    #[test]
    fn test_delay_schedule_repeats_last_entry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(7), Duration::from_millis(500));
        assert_eq!(RetryPolicy::none().delay_for(0), Duration::ZERO);
    }
}
