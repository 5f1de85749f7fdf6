//! Unix-socket request/response/signal multiplexer.
//!
//! Two cooperating workers, mirroring the split described in the design:
//!
//! - **Acceptor** blocks on `accept` and hands new peer streams over.
//! - **Processor** is a single task that owns every per-peer table
//!   (writers, pending calls, signal subscriptions) and dispatches
//!   handlers. Request handlers return futures which are driven on
//!   separate tasks, so a slow handler never stalls the processor loop.
//!
//! Peers subscribe to signals by sending a request with the reserved
//! method id `METHOD_SUBSCRIBE_SIGNALS` whose payload is a JSON array of
//! method ids; `signal()` broadcasts reach subscribed peers only.

use crate::constants::{DEFAULT_CALL_TIMEOUT, MAX_PEERS, METHOD_SUBSCRIBE_SIGNALS};
use crate::error::{Error, Result};
use crate::ipc::frame::{
    next_peer_id, Frame, FrameKind, ERR_HANDLER_ERROR, ERR_NO_SUCH_METHOD, ERR_PEER_DISCONNECTED,
    ERR_SERVICE_STOPPED, ERR_TIMED_OUT,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Handler Types
// =============================================================================

/// Peer identifier, unique for the process lifetime.
pub type PeerId = u64;

/// Boxed future returned by method handlers. The `Err` string becomes the
/// reason of a `HANDLER_ERROR` frame.
pub type HandlerFuture =
    Pin<Box<dyn Future<Output = std::result::Result<Vec<u8>, String>> + Send>>;

/// Typed request/response handler, run per incoming request.
pub type MethodHandler = Arc<dyn Fn(PeerId, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Fire-and-forget signal handler, run on the processor task.
pub type SignalHandlerFn = Arc<dyn Fn(PeerId, Vec<u8>) + Send + Sync>;

/// Peer lifecycle hook.
pub type PeerCallback = Arc<dyn Fn(PeerId) + Send + Sync>;

/// Callback receiving an asynchronous call result.
pub type ResultCallback = Box<dyn FnOnce(Result<Vec<u8>>) + Send>;

// =============================================================================
// Internal Events
// =============================================================================

enum PendingReply {
    Channel(oneshot::Sender<Result<Vec<u8>>>),
    Callback(ResultCallback),
}

impl PendingReply {
    fn complete(self, result: Result<Vec<u8>>) {
        match self {
            // A dropped receiver means the caller timed out; the late
            // result is discarded.
            PendingReply::Channel(tx) => {
                let _ = tx.send(result);
            }
            PendingReply::Callback(cb) => cb(result),
        }
    }
}

enum Event {
    NewPeer(UnixStream),
    Frame(PeerId, Frame),
    PeerClosed(PeerId, Error),
    Call {
        method_id: u32,
        peer_id: PeerId,
        payload: Vec<u8>,
        reply: PendingReply,
    },
    Signal {
        method_id: u32,
        payload: Vec<u8>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

struct PeerState {
    write_tx: mpsc::UnboundedSender<Frame>,
    subscriptions: HashSet<u32>,
    reader: JoinHandle<()>,
}

// =============================================================================
// Shared Registries
// =============================================================================

#[derive(Default)]
struct Registry {
    methods: Mutex<HashMap<u32, MethodHandler>>,
    signals: Mutex<HashMap<u32, SignalHandlerFn>>,
    new_peer: Mutex<Option<PeerCallback>>,
    removed_peer: Mutex<Option<PeerCallback>>,
}

// =============================================================================
// Service
// =============================================================================

/// Unix-socket IPC service.
///
/// Cheap to clone; all clones share the same listener and worker tasks.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    registry: Arc<Registry>,
    started: AtomicBool,
    event_tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    /// Creates a service bound to nothing yet; `start()` binds the socket.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                registry: Arc::new(Registry::default()),
                started: AtomicBool::new(false),
                event_tx: Mutex::new(None),
                stop_tx: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Socket path this service listens on.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Returns true between a successful `start()` and `stop()`.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Binds the socket and launches the acceptor and processor workers.
    /// A second call while running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the socket cannot be bound.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // A stale socket file from an unclean shutdown would fail the bind.
        if self.inner.path.exists() {
            std::fs::remove_file(&self.inner.path)?;
        }
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.inner.path)?;
        info!(path = %self.inner.path.display(), "ipc service listening");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let acceptor = tokio::spawn(acceptor_loop(listener, event_tx.clone(), stop_rx));
        let processor = tokio::spawn(processor_loop(
            event_rx,
            event_tx.clone(),
            Arc::clone(&self.inner.registry),
        ));

        *self.inner.event_tx.lock().expect("event_tx lock") = Some(event_tx);
        *self.inner.stop_tx.lock().expect("stop_tx lock") = Some(stop_tx);
        self.inner
            .workers
            .lock()
            .expect("workers lock")
            .extend([acceptor, processor]);
        Ok(())
    }

    /// Stops both workers, closes the listener and every peer, and fails
    /// all outstanding calls with `ServiceStopped`. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(path = %self.inner.path.display(), "ipc service stopping");

        if let Some(stop_tx) = self.inner.stop_tx.lock().expect("stop_tx lock").take() {
            let _ = stop_tx.send(true);
        }
        let event_tx = self.inner.event_tx.lock().expect("event_tx lock").take();
        if let Some(event_tx) = event_tx {
            let (done_tx, done_rx) = oneshot::channel();
            if event_tx.send(Event::Stop { done: done_tx }).is_ok() {
                let _ = done_rx.await;
            }
        }

        let workers: Vec<_> = self
            .inner
            .workers
            .lock()
            .expect("workers lock")
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.await;
        }
        let _ = std::fs::remove_file(&self.inner.path);
    }

    // =========================================================================
    // Handler Registration
    // =========================================================================

    /// Registers a request/response handler for a method id, replacing any
    /// previous one.
    pub fn add_method_handler<F, Fut>(&self, method_id: u32, handler: F)
    where
        F: Fn(PeerId, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<u8>, String>> + Send + 'static,
    {
        debug!(method_id, "adding method handler");
        let boxed: MethodHandler =
            Arc::new(move |peer, payload| Box::pin(handler(peer, payload)) as HandlerFuture);
        self.inner
            .registry
            .methods
            .lock()
            .expect("methods lock")
            .insert(method_id, boxed);
    }

    /// Registers a fire-and-forget handler for signals a peer sends us.
    pub fn add_signal_handler<F>(&self, method_id: u32, handler: F)
    where
        F: Fn(PeerId, Vec<u8>) + Send + Sync + 'static,
    {
        debug!(method_id, "adding signal handler");
        self.inner
            .registry
            .signals
            .lock()
            .expect("signals lock")
            .insert(method_id, Arc::new(handler));
    }

    /// Removes the handler registered for a method id, if any.
    pub fn remove_method(&self, method_id: u32) {
        self.inner
            .registry
            .methods
            .lock()
            .expect("methods lock")
            .remove(&method_id);
        self.inner
            .registry
            .signals
            .lock()
            .expect("signals lock")
            .remove(&method_id);
    }

    /// Installs the new-peer lifecycle hook.
    pub fn set_new_peer_callback<F>(&self, callback: F)
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        *self.inner.registry.new_peer.lock().expect("new_peer lock") = Some(Arc::new(callback));
    }

    /// Installs the removed-peer lifecycle hook.
    pub fn set_removed_peer_callback<F>(&self, callback: F)
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        *self
            .inner
            .registry
            .removed_peer
            .lock()
            .expect("removed_peer lock") = Some(Arc::new(callback));
    }

    // =========================================================================
    // Calls and Signals
    // =========================================================================

    /// Calls a method on a peer and awaits the paired response.
    ///
    /// # Errors
    ///
    /// - `Error::Timeout` when the response does not arrive in time; a
    ///   late response is discarded.
    /// - `Error::PeerGone` when the peer disconnects first.
    /// - `Error::ServiceStopped` when `stop()` wins the race.
    pub async fn call(
        &self,
        method_id: u32,
        peer_id: PeerId,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_event(Event::Call {
            method_id,
            peer_id,
            payload,
            reply: PendingReply::Channel(reply_tx),
        })?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_) => Err(Error::Timeout(timeout)),
            Ok(Err(_)) => Err(Error::ServiceStopped),
            Ok(Ok(result)) => result,
        }
    }

    /// Calls a method on a peer with the default timeout.
    pub async fn call_default(
        &self,
        method_id: u32,
        peer_id: PeerId,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        self.call(method_id, peer_id, payload, DEFAULT_CALL_TIMEOUT)
            .await
    }

    /// Calls a method on a peer and returns immediately; `on_result` runs
    /// on the processor task when the response, an error, or disconnect
    /// arrives.
    pub fn call_async<F>(
        &self,
        method_id: u32,
        peer_id: PeerId,
        payload: Vec<u8>,
        on_result: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        self.send_event(Event::Call {
            method_id,
            peer_id,
            payload,
            reply: PendingReply::Callback(Box::new(on_result)),
        })
    }

    /// Broadcasts a signal to every peer subscribed to the method id.
    pub fn signal(&self, method_id: u32, payload: Vec<u8>) -> Result<()> {
        self.send_event(Event::Signal { method_id, payload })
    }

    fn send_event(&self, event: Event) -> Result<()> {
        let guard = self.inner.event_tx.lock().expect("event_tx lock");
        match guard.as_ref() {
            Some(tx) => tx.send(event).map_err(|_| Error::ServiceStopped),
            None => Err(Error::ServiceStopped),
        }
    }
}

// =============================================================================
// Acceptor
// =============================================================================

async fn acceptor_loop(
    listener: UnixListener,
    event_tx: mpsc::UnboundedSender<Event>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                debug!("acceptor stopping");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        if event_tx.send(Event::NewPeer(stream)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

// =============================================================================
// Processor
// =============================================================================

struct Processor {
    peers: HashMap<PeerId, PeerState>,
    pending: HashMap<(PeerId, u64), PendingReply>,
    event_tx: mpsc::UnboundedSender<Event>,
    registry: Arc<Registry>,
}

async fn processor_loop(
    mut event_rx: mpsc::UnboundedReceiver<Event>,
    event_tx: mpsc::UnboundedSender<Event>,
    registry: Arc<Registry>,
) {
    let mut processor = Processor {
        peers: HashMap::new(),
        pending: HashMap::new(),
        event_tx,
        registry,
    };

    while let Some(event) = event_rx.recv().await {
        match event {
            Event::NewPeer(stream) => processor.on_new_peer(stream),
            Event::Frame(peer_id, frame) => processor.on_frame(peer_id, frame),
            Event::PeerClosed(peer_id, error) => processor.on_peer_closed(peer_id, error),
            Event::Call {
                method_id,
                peer_id,
                payload,
                reply,
            } => processor.on_call(method_id, peer_id, payload, reply),
            Event::Signal { method_id, payload } => processor.on_signal(method_id, payload),
            Event::Stop { done } => {
                processor.on_stop();
                let _ = done.send(());
                return;
            }
        }
    }
}

impl Processor {
    fn on_new_peer(&mut self, stream: UnixStream) {
        if self.peers.len() >= MAX_PEERS {
            warn!(max = MAX_PEERS, "peer rejected: limit reached");
            return;
        }

        let peer_id = next_peer_id();
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        tokio::spawn(peer_writer(peer_id, write_half, write_rx));
        let reader = tokio::spawn(peer_reader(peer_id, read_half, self.event_tx.clone()));

        self.peers.insert(
            peer_id,
            PeerState {
                write_tx,
                subscriptions: HashSet::new(),
                reader,
            },
        );
        debug!(peer_id, "peer connected");

        let callback = self
            .registry
            .new_peer
            .lock()
            .expect("new_peer lock")
            .clone();
        if let Some(callback) = callback {
            callback(peer_id);
        }
    }

    fn on_peer_closed(&mut self, peer_id: PeerId, error: Error) {
        let Some(peer) = self.peers.remove(&peer_id) else {
            return;
        };
        peer.reader.abort();
        debug!(peer_id, reason = %error, "peer removed");

        let stale: Vec<_> = self
            .pending
            .keys()
            .filter(|(p, _)| *p == peer_id)
            .copied()
            .collect();
        for key in stale {
            if let Some(reply) = self.pending.remove(&key) {
                reply.complete(Err(Error::PeerGone(peer_id)));
            }
        }

        let callback = self
            .registry
            .removed_peer
            .lock()
            .expect("removed_peer lock")
            .clone();
        if let Some(callback) = callback {
            callback(peer_id);
        }
    }

    fn on_frame(&mut self, peer_id: PeerId, frame: Frame) {
        match frame.kind {
            FrameKind::Request => self.on_request(peer_id, frame),
            FrameKind::Response => {
                if let Some(reply) = self.pending.remove(&(peer_id, frame.message_id)) {
                    reply.complete(Ok(frame.payload));
                }
                // No pending entry: the caller already timed out; discard.
            }
            FrameKind::Error => {
                if let Some(reply) = self.pending.remove(&(peer_id, frame.message_id)) {
                    reply.complete(Err(decode_remote_error(peer_id, &frame)));
                }
            }
            FrameKind::Signal => self.on_peer_signal(peer_id, frame),
        }
    }

    fn on_request(&mut self, peer_id: PeerId, frame: Frame) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        let write_tx = peer.write_tx.clone();

        if frame.method_id == METHOD_SUBSCRIBE_SIGNALS {
            match serde_json::from_slice::<Vec<u32>>(&frame.payload) {
                Ok(ids) => {
                    peer.subscriptions.extend(ids);
                    let _ = write_tx.send(Frame::response(
                        frame.message_id,
                        frame.method_id,
                        Vec::new(),
                    ));
                }
                Err(e) => {
                    let _ = write_tx.send(Frame::error(
                        frame.message_id,
                        frame.method_id,
                        ERR_HANDLER_ERROR,
                        &format!("bad subscription payload: {e}"),
                    ));
                }
            }
            return;
        }

        let handler = self
            .registry
            .methods
            .lock()
            .expect("methods lock")
            .get(&frame.method_id)
            .cloned();
        let Some(handler) = handler else {
            warn!(peer_id, method_id = frame.method_id, "no handler for request");
            let _ = write_tx.send(Frame::error(
                frame.message_id,
                frame.method_id,
                ERR_NO_SUCH_METHOD,
                "no such method",
            ));
            return;
        };

        // Run the handler on its own task; a panic is contained there and
        // turned into a HANDLER_ERROR reply, and the processor loop keeps
        // serving other peers meanwhile.
        let message_id = frame.message_id;
        let method_id = frame.method_id;
        let join = tokio::spawn(handler(peer_id, frame.payload));
        tokio::spawn(async move {
            let reply = match join.await {
                Ok(Ok(payload)) => Frame::response(message_id, method_id, payload),
                Ok(Err(reason)) => {
                    Frame::error(message_id, method_id, ERR_HANDLER_ERROR, &reason)
                }
                Err(_) => Frame::error(
                    message_id,
                    method_id,
                    ERR_HANDLER_ERROR,
                    "handler panicked",
                ),
            };
            let _ = write_tx.send(reply);
        });
    }

    fn on_peer_signal(&self, peer_id: PeerId, frame: Frame) {
        let handler = self
            .registry
            .signals
            .lock()
            .expect("signals lock")
            .get(&frame.method_id)
            .cloned();
        match handler {
            Some(handler) => {
                let outcome =
                    catch_unwind(AssertUnwindSafe(|| handler(peer_id, frame.payload)));
                if outcome.is_err() {
                    warn!(peer_id, method_id = frame.method_id, "signal handler panicked");
                }
            }
            None => {
                debug!(peer_id, method_id = frame.method_id, "unhandled signal");
            }
        }
    }

    fn on_call(&mut self, method_id: u32, peer_id: PeerId, payload: Vec<u8>, reply: PendingReply) {
        let Some(peer) = self.peers.get(&peer_id) else {
            reply.complete(Err(Error::PeerGone(peer_id)));
            return;
        };
        let frame = Frame::request(method_id, payload);
        let message_id = frame.message_id;
        if peer.write_tx.send(frame).is_err() {
            reply.complete(Err(Error::PeerGone(peer_id)));
            return;
        }
        self.pending.insert((peer_id, message_id), reply);
    }

    fn on_signal(&self, method_id: u32, payload: Vec<u8>) {
        for (peer_id, peer) in &self.peers {
            if peer.subscriptions.contains(&method_id) {
                let frame = Frame::signal(method_id, payload.clone());
                if peer.write_tx.send(frame).is_err() {
                    debug!(peer_id, method_id, "signal dropped, peer writer gone");
                }
            }
        }
    }

    fn on_stop(&mut self) {
        for (_, reply) in self.pending.drain() {
            reply.complete(Err(Error::ServiceStopped));
        }
        let peer_ids: Vec<_> = self.peers.keys().copied().collect();
        for peer_id in peer_ids {
            if let Some(peer) = self.peers.remove(&peer_id) {
                peer.reader.abort();
            }
            let callback = self
                .registry
                .removed_peer
                .lock()
                .expect("removed_peer lock")
                .clone();
            if let Some(callback) = callback {
                callback(peer_id);
            }
        }
    }
}

fn decode_remote_error(peer_id: PeerId, frame: &Frame) -> Error {
    match frame.error_payload() {
        Ok((ERR_SERVICE_STOPPED, _)) => Error::ServiceStopped,
        Ok((ERR_PEER_DISCONNECTED, _)) => Error::PeerGone(peer_id),
        Ok((ERR_TIMED_OUT, _)) => Error::Timeout(Duration::ZERO),
        Ok((ERR_NO_SUCH_METHOD, _)) => Error::NoSuchMethod(frame.method_id),
        Ok((_, reason)) => Error::Handler(reason),
        Err(e) => e,
    }
}

// =============================================================================
// Peer Tasks
// =============================================================================

async fn peer_writer(
    peer_id: PeerId,
    mut half: OwnedWriteHalf,
    mut write_rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = write_rx.recv().await {
        if let Err(e) = frame.write_to(&mut half).await {
            debug!(peer_id, error = %e, "peer write failed");
            break;
        }
    }
    let _ = half.shutdown().await;
}

async fn peer_reader(
    peer_id: PeerId,
    mut half: OwnedReadHalf,
    event_tx: mpsc::UnboundedSender<Event>,
) {
    loop {
        match Frame::read_from(&mut half).await {
            Ok(frame) => {
                if event_tx.send(Event::Frame(peer_id, frame)).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = event_tx.send(Event::PeerClosed(peer_id, e));
                return;
            }
        }
    }
}
