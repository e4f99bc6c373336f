//! Link lifecycle: reader loop, writer path, and the pending call table.
//!
//! One reader task drains frames off the stream and routes each one:
//! requests spawn a dispatch task, responses resolve the pending entry for
//! their correlation id. Issuing a call suspends only the task that issued
//! it, never the reader, so a handler that calls back through the link
//! keeps being serviced and nested calls cannot deadlock the connection.
//! All outbound frames (requests and responses alike) funnel through one
//! mpsc channel into a single writer task, so concurrent completions never
//! interleave partial frames.
//!
//! Connection states: Idle (a detached handle, nothing to talk to) →
//! Connected → Closing (shutdown requested, no new calls) → Closed
//! (terminal; also reached on EOF or a fatal stream error).

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{DEFAULT_MAX_FRAME_LEN, MessageCodec};
use crate::dispatch::HandlerRegistry;
use crate::protocol::{CallId, CallOutcome, WireMessage};
use crate::term::{Atom, Term};

/// Why an issued call failed to produce a value.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The peer answered `{error, Reason}`.
    #[error("remote error: {0}")]
    Remote(Term),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The link closed while the call was pending.
    #[error("link closed before the response arrived")]
    Closed,

    /// The link is not accepting calls (never connected, or shutting down).
    #[error("link is not accepting calls")]
    Rejected,
}

impl CallError {
    /// The remote reason term, when there is one.
    pub fn remote_reason(&self) -> Option<&Term> {
        match self {
            Self::Remote(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connected,
    Closing,
    Closed,
}

const STATE_IDLE: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

impl LinkState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_IDLE => Self::Idle,
            STATE_CONNECTED => Self::Connected,
            STATE_CLOSING => Self::Closing,
            _ => Self::Closed,
        }
    }

    fn raw(self) -> u8 {
        match self {
            Self::Idle => STATE_IDLE,
            Self::Connected => STATE_CONNECTED,
            Self::Closing => STATE_CLOSING,
            Self::Closed => STATE_CLOSED,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Deadline applied by [`CallHandle::call`].
    pub call_timeout: Duration,
    /// Cap on a single frame's payload, both directions.
    pub max_frame_len: usize,
}

impl LinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

struct Shared {
    /// Pending call table: correlation id to the waiting caller. At most
    /// one entry per id; entries leave on response, timeout, or abandon.
    pending: DashMap<u64, oneshot::Sender<CallOutcome>>,
    next_id: AtomicU64,
    state: AtomicU8,
    outbound: mpsc::UnboundedSender<WireMessage>,
    config: LinkConfig,
}

impl Shared {
    fn state(&self) -> LinkState {
        LinkState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state.raw(), Ordering::Release);
    }

    /// Drains the pending table; dropped senders wake every waiting caller
    /// with [`CallError::Closed`].
    fn fail_pending(&self) {
        let stranded = self.pending.len();
        if stranded > 0 {
            tracing::warn!(stranded, "failing pending calls");
        }
        self.pending.clear();
    }
}

/// Cloneable caller stub bound to one link.
///
/// Handlers receive one of these so they can issue nested calls back to
/// the peer while servicing a request.
#[derive(Clone)]
pub struct CallHandle {
    shared: Arc<Shared>,
}

impl CallHandle {
    /// A handle bound to nothing; every call fails with
    /// [`CallError::Rejected`]. Lets local-only dispatch run without a
    /// connection.
    pub fn detached() -> Self {
        let (outbound, _discard) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                pending: DashMap::new(),
                next_id: AtomicU64::new(0),
                state: AtomicU8::new(STATE_IDLE),
                outbound,
                config: LinkConfig::default(),
            }),
        }
    }

    /// Calls `module:function(args)` on the peer and waits for the matching
    /// response, under the link's default deadline.
    pub async fn call(
        &self,
        module: impl Into<Atom>,
        function: impl Into<Atom>,
        args: Vec<Term>,
    ) -> Result<Term, CallError> {
        let timeout = self.shared.config.call_timeout;
        self.call_with_timeout(module, function, args, timeout).await
    }

    /// Like [`call`](Self::call) with an explicit deadline. On expiry the
    /// pending entry is removed; a response that arrives later is logged
    /// and discarded by the reader.
    pub async fn call_with_timeout(
        &self,
        module: impl Into<Atom>,
        function: impl Into<Atom>,
        args: Vec<Term>,
        deadline: Duration,
    ) -> Result<Term, CallError> {
        if self.shared.state() != LinkState::Connected {
            return Err(CallError::Rejected);
        }

        let raw_id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(raw_id, tx);
        // Removes the entry however this future exits, including drop-abandon.
        let _guard = PendingGuard {
            shared: &self.shared,
            id: raw_id,
        };

        let module = module.into();
        let function = function.into();
        tracing::trace!(id = raw_id, %module, %function, "issuing call");
        let request = WireMessage::Request {
            id: CallId::new(raw_id),
            module,
            function,
            args,
        };
        if self.shared.outbound.send(request).is_err() {
            return Err(CallError::Closed);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(CallOutcome::Ok(value))) => Ok(value),
            Ok(Ok(CallOutcome::Error(reason))) => Err(CallError::Remote(reason)),
            Ok(Err(_sender_dropped)) => Err(CallError::Closed),
            Err(_elapsed) => {
                tracing::debug!(id = raw_id, ?deadline, "call timed out");
                Err(CallError::Timeout(deadline))
            }
        }
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }
}

struct PendingGuard<'a> {
    shared: &'a Arc<Shared>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.id);
    }
}

/// One bridged connection: owns the reader and writer tasks.
///
/// Dropping the `Link` leaves the tasks running until the stream reaches
/// EOF; handles stay usable. Call [`shutdown`](Self::shutdown) to tear the
/// connection down deliberately.
pub struct Link {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    /// Starts a link over a read/write pair, dispatching incoming requests
    /// against `registry`.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        registry: Arc<HandlerRegistry>,
        config: LinkConfig,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
            state: AtomicU8::new(STATE_CONNECTED),
            outbound: outbound_tx,
            config,
        });

        let frames_in = FramedRead::new(reader, MessageCodec::new(config.max_frame_len));
        let frames_out = FramedWrite::new(writer, MessageCodec::new(config.max_frame_len));

        let writer_task = tokio::spawn(write_loop(frames_out, outbound_rx, Arc::clone(&shared)));
        let reader_task = tokio::spawn(read_loop(frames_in, Arc::clone(&shared), registry));

        Self {
            shared,
            reader: reader_task,
            writer: writer_task,
        }
    }

    /// Starts a link over a full-duplex stream.
    pub fn over_stream<S>(stream: S, registry: Arc<HandlerRegistry>, config: LinkConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::spawn(reader, writer, registry, config)
    }

    pub fn handle(&self) -> CallHandle {
        CallHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Stops accepting calls, fails everything pending, and tears the
    /// reader and writer down. The peer observes EOF.
    pub async fn shutdown(self) {
        tracing::debug!("link shutting down");
        self.shared.set_state(LinkState::Closing);
        self.shared.fail_pending();
        self.reader.abort();
        self.writer.abort();
        let _ = self.reader.await;
        let _ = self.writer.await;
        self.shared.set_state(LinkState::Closed);
    }

    /// Waits until the connection ends (peer EOF or fatal stream error).
    pub async fn wait(self) {
        let _ = self.reader.await;
        self.writer.abort();
        let _ = self.writer.await;
    }
}

async fn read_loop<R>(
    mut frames: FramedRead<R, MessageCodec>,
    shared: Arc<Shared>,
    registry: Arc<HandlerRegistry>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(WireMessage::Request {
                id,
                module,
                function,
                args,
            }) => {
                tracing::trace!(%id, %module, %function, "request received");
                let registry = Arc::clone(&registry);
                let shared = Arc::clone(&shared);
                let caller = CallHandle {
                    shared: Arc::clone(&shared),
                };
                // Dispatch on its own task: the reader must keep draining
                // frames so nested calls issued by this handler resolve.
                tokio::spawn(async move {
                    let outcome = registry.dispatch(caller, module, function, args).await;
                    let response = WireMessage::Response { id, outcome };
                    if shared.outbound.send(response).is_err() {
                        tracing::warn!(%id, "writer gone, dropping response");
                    }
                });
            }
            Ok(WireMessage::Response { id, outcome }) => {
                match shared.pending.remove(&id.raw()) {
                    Some((_, tx)) => {
                        tracing::trace!(%id, ok = outcome.is_ok(), "response matched");
                        let _ = tx.send(outcome);
                    }
                    // Timed out or abandoned before the peer answered.
                    None => tracing::debug!(%id, "late response, discarding"),
                }
            }
            Err(error) => {
                tracing::error!(%error, "fatal stream error, closing link");
                break;
            }
        }
    }

    if shared.state() == LinkState::Connected {
        tracing::debug!("peer closed the connection");
    }
    shared.set_state(LinkState::Closed);
    shared.fail_pending();
}

async fn write_loop<W>(
    mut frames: FramedWrite<W, MessageCodec>,
    mut outbound: mpsc::UnboundedReceiver<WireMessage>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(message) = outbound.recv().await {
        if let Err(error) = frames.send(message).await {
            tracing::error!(%error, "frame write failed, closing link");
            shared.set_state(LinkState::Closed);
            shared.fail_pending();
            break;
        }
    }
}
