//! Named-service transport binding.
//!
//! The host reaches a sandbox's sidecar through a brokered channel identified by
//! a well-known service name. Such channels speak dictionaries and deliver each
//! reply to a per-call handler, with no way to recall a handler once a call is
//! issued. [`ServiceChannel`] captures that model; [`NamedServiceTransport`]
//! adapts it to the `send(request, timeout) -> response` contract by feeding
//! replies into a [`CompletionTracker`].
//!
//! [`LocalServiceChannel`] implements the channel over a Unix socket resolved by
//! [`ServiceAddress::for_service`], multiplexing replies by its own sequence
//! numbers. [`ServiceListener`] is the matching responder.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Envelope, Request, RequestId, Response, ResponseOutcome};
use crate::bridge::transport::ServiceAddress;
use crate::error::BridgeError;
use crate::tracker::CompletionTracker;

/// Native message shape of a service channel.
pub type ServiceMessage = serde_json::Map<String, serde_json::Value>;

/// Connection-level failures reported by a service channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Peer process exited or the connection dropped.
    #[error("connection interrupted")]
    ConnectionInterrupted,
    /// Channel was cancelled or never reached a peer.
    #[error("connection invalid")]
    ConnectionInvalid,
    #[error("channel error: {0}")]
    Internal(String),
}

impl From<ChannelError> for BridgeError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::ConnectionInterrupted => {
                BridgeError::interrupted("service connection interrupted")
            }
            ChannelError::ConnectionInvalid => BridgeError::internal("service connection invalid"),
            ChannelError::Internal(message) => BridgeError::internal(message),
        }
    }
}

pub type ReplyHandler = Box<dyn FnOnce(Result<ServiceMessage, ChannelError>) + Send>;
pub type EventHandler = Arc<dyn Fn(ChannelError) + Send + Sync>;

/// Identity of the remote endpoint as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerIdentity {
    /// No traffic has crossed the channel yet, so the OS has nothing to report.
    Unknown,
    Process(u32),
}

/// Asynchronous request/reply channel with per-call reply handlers.
pub trait ServiceChannel: Send + Sync {
    /// Handler for errors not tied to a call.
    fn set_event_handler(&self, handler: EventHandler);

    /// Start delivering traffic. Calls made before activation are queued.
    fn activate(&self);

    /// Issue a call. `reply` runs exactly once, with the reply or a channel error.
    fn send_with_reply(&self, message: ServiceMessage, reply: ReplyHandler);

    /// Tear the channel down. Outstanding handlers receive `ConnectionInvalid`.
    fn cancel(&self);

    /// Process id of the peer, once traffic has been observed.
    fn remote_pid(&self) -> Option<u32>;
}

/// Encode an envelope as a channel dictionary.
pub fn encode_message(envelope: &Envelope) -> Result<ServiceMessage, BridgeError> {
    match serde_json::to_value(envelope)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(BridgeError::malformed("envelope did not encode as a dictionary")),
    }
}

/// Decode a channel dictionary into an envelope.
pub fn decode_message(message: ServiceMessage) -> Result<Envelope, BridgeError> {
    Ok(serde_json::from_value(serde_json::Value::Object(message))?)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChannelFrame {
    Call { seq: u64, body: ServiceMessage },
    Reply { seq: u64, body: ServiceMessage },
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Service channel mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

struct Outstanding {
    handlers: HashMap<u64, ReplyHandler>,
    /// Set once the connection is gone; later calls fail immediately with it.
    closed: Option<ChannelError>,
}

struct ChannelShared {
    service: String,
    outstanding: Mutex<Outstanding>,
    event_handler: Mutex<EventHandler>,
    traffic_seen: AtomicBool,
    peer_pid: Option<u32>,
}

impl ChannelShared {
    /// Mark the connection dead and fail every outstanding call with `err`.
    fn disconnect(&self, err: ChannelError) {
        let drained: Vec<ReplyHandler> = {
            let mut outstanding = lock(&self.outstanding);
            if outstanding.closed.is_some() {
                return;
            }
            outstanding.closed = Some(err.clone());
            outstanding.handlers.drain().map(|(_, h)| h).collect()
        };

        tracing::debug!(service = %self.service, error = %err, outstanding = drained.len(), "Service channel disconnected");
        for handler in drained {
            handler(Err(err.clone()));
        }

        if err != ChannelError::ConnectionInvalid {
            let event_handler = Arc::clone(&lock(&self.event_handler));
            event_handler(err);
        }
    }

    fn deliver_reply(&self, seq: u64, body: ServiceMessage) {
        self.traffic_seen.store(true, Ordering::SeqCst);
        let handler = lock(&self.outstanding).handlers.remove(&seq);
        match handler {
            Some(handler) => handler(Ok(body)),
            None => tracing::warn!(service = %self.service, seq, "Reply for unknown call"),
        }
    }
}

/// Service channel over a Unix socket.
pub struct LocalServiceChannel {
    shared: Arc<ChannelShared>,
    next_seq: AtomicU64,
    outbound: mpsc::UnboundedSender<ChannelFrame>,
    pending_io: Mutex<Option<(OwnedReadHalf, OwnedWriteHalf, mpsc::UnboundedReceiver<ChannelFrame>)>>,
    tasks: Mutex<Vec<AbortHandle>>,
    cancelled: AtomicBool,
}

impl LocalServiceChannel {
    /// Connect to the named service. Must run inside a tokio runtime.
    pub async fn connect(service: &str) -> Result<Self, BridgeError> {
        Self::connect_address(service, &ServiceAddress::for_service(service)).await
    }

    pub async fn connect_address(
        service: &str,
        address: &ServiceAddress,
    ) -> Result<Self, BridgeError> {
        let std_stream = address.connect().map_err(|e| {
            tracing::debug!(service, address = %address, error = %e, "Service lookup failed");
            BridgeError::from(ChannelError::ConnectionInvalid)
        })?;
        std_stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(std_stream)?;
        tracing::debug!(service, address = %address, "Connected to service");
        Ok(Self::from_stream(service, stream))
    }

    pub fn from_stream(service: &str, stream: UnixStream) -> Self {
        let peer_pid = stream
            .peer_cred()
            .ok()
            .and_then(|cred| cred.pid())
            .and_then(|pid| u32::try_from(pid).ok());
        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let noop: EventHandler = Arc::new(|_| {});

        Self {
            shared: Arc::new(ChannelShared {
                service: service.to_string(),
                outstanding: Mutex::new(Outstanding {
                    handlers: HashMap::new(),
                    closed: None,
                }),
                event_handler: Mutex::new(noop),
                traffic_seen: AtomicBool::new(false),
                peer_pid,
            }),
            next_seq: AtomicU64::new(1),
            outbound,
            pending_io: Mutex::new(Some((read_half, write_half, outbound_rx))),
            tasks: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
        }
    }
}

impl ServiceChannel for LocalServiceChannel {
    fn set_event_handler(&self, handler: EventHandler) {
        *lock(&self.shared.event_handler) = handler;
    }

    fn activate(&self) {
        let Some((read_half, write_half, mut outbound_rx)) = lock(&self.pending_io).take() else {
            return;
        };

        let reader_shared = Arc::clone(&self.shared);
        let reader = tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, JsonCodec::<ChannelFrame>::new());
            loop {
                match frames.next().await {
                    Some(Ok(ChannelFrame::Reply { seq, body })) => {
                        reader_shared.deliver_reply(seq, body);
                    }
                    Some(Ok(ChannelFrame::Call { seq, .. })) => {
                        tracing::warn!(service = %reader_shared.service, seq, "Unexpected call on client channel");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(service = %reader_shared.service, error = %e, "Service channel read failed");
                        reader_shared.disconnect(ChannelError::ConnectionInterrupted);
                        break;
                    }
                    None => {
                        reader_shared.disconnect(ChannelError::ConnectionInterrupted);
                        break;
                    }
                }
            }
        });

        let writer_shared = Arc::clone(&self.shared);
        let writer = tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, JsonCodec::<ChannelFrame>::new());
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!(service = %writer_shared.service, error = %e, "Service channel write failed");
                    writer_shared.disconnect(ChannelError::ConnectionInterrupted);
                    break;
                }
            }
        });

        let mut tasks = lock(&self.tasks);
        tasks.push(reader.abort_handle());
        tasks.push(writer.abort_handle());
        tracing::trace!(service = %self.shared.service, "Service channel activated");
    }

    fn send_with_reply(&self, message: ServiceMessage, reply: ReplyHandler) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut outstanding = lock(&self.shared.outstanding);
            if let Some(err) = outstanding.closed.clone() {
                drop(outstanding);
                reply(Err(err));
                return;
            }
            outstanding.handlers.insert(seq, reply);
        }

        if self
            .outbound
            .send(ChannelFrame::Call { seq, body: message })
            .is_err()
        {
            self.shared.disconnect(ChannelError::ConnectionInterrupted);
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(service = %self.shared.service, "Cancelling service channel");
        self.shared.disconnect(ChannelError::ConnectionInvalid);
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&self.pending_io).take();
    }

    fn remote_pid(&self) -> Option<u32> {
        if self.shared.traffic_seen.load(Ordering::SeqCst) {
            self.shared.peer_pid
        } else {
            None
        }
    }
}

impl Drop for LocalServiceChannel {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Responder logic for a [`ServiceListener`].
#[async_trait::async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    /// Handle one call. `None` means the call is never answered.
    async fn handle(&self, message: ServiceMessage) -> Option<ServiceMessage>;
}

/// Listening side of a named service.
pub struct ServiceListener {
    address: ServiceAddress,
    listener: tokio::net::UnixListener,
}

impl ServiceListener {
    /// Bind the named service. Must run inside a tokio runtime.
    pub fn bind(service: &str) -> io::Result<Self> {
        Self::bind_address(ServiceAddress::for_service(service))
    }

    pub fn bind_address(address: ServiceAddress) -> io::Result<Self> {
        let std_listener = address.bind()?;
        std_listener.set_nonblocking(true)?;
        let listener = tokio::net::UnixListener::from_std(std_listener)?;
        Ok(Self { address, listener })
    }

    pub fn address(&self) -> &ServiceAddress {
        &self.address
    }

    /// Accept connections forever, serving each on its own task.
    pub async fn serve<H: ServiceHandler>(self, handler: Arc<H>) -> io::Result<()> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            tracing::debug!(address = %self.address, "Accepted service connection");
            tokio::spawn(serve_service_connection(stream, Arc::clone(&handler)));
        }
    }
}

impl Drop for ServiceListener {
    fn drop(&mut self) {
        if let Err(e) = self.address.cleanup() {
            tracing::warn!(error = %e, "Failed to clean up service socket");
        }
    }
}

async fn serve_service_connection<H: ServiceHandler>(stream: UnixStream, handler: Arc<H>) {
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, JsonCodec::<ChannelFrame>::new());
    let writer = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
        write_half,
        JsonCodec::<ChannelFrame>::new(),
    )));

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(ChannelFrame::Call { seq, body }) => {
                let handler = Arc::clone(&handler);
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    let Some(reply) = handler.handle(body).await else {
                        tracing::trace!(seq, "Handler declined to reply");
                        return;
                    };
                    let mut writer = writer.lock().await;
                    if let Err(e) = writer.send(ChannelFrame::Reply { seq, body: reply }).await {
                        tracing::debug!(seq, error = %e, "Failed to send reply");
                    }
                });
            }
            Ok(ChannelFrame::Reply { seq, .. }) => {
                tracing::warn!(seq, "Unexpected reply on service connection");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Service connection read failed");
                break;
            }
        }
    }
    tracing::debug!("Service connection closed");
}

/// `send(request, timeout) -> response` over a [`ServiceChannel`].
pub struct NamedServiceTransport {
    service: String,
    channel: Arc<dyn ServiceChannel>,
    tracker: CompletionTracker<Response>,
    closed: Arc<AtomicBool>,
}

impl NamedServiceTransport {
    /// Connect to `service` through a [`LocalServiceChannel`].
    pub async fn connect(service: &str) -> Result<Self, BridgeError> {
        let channel = LocalServiceChannel::connect(service).await?;
        Self::with_channel(service, Arc::new(channel))
    }

    /// Wrap an existing channel: install a no-op event handler and activate it.
    ///
    /// Channels spawn their I/O on activation, so this must run inside a tokio
    /// runtime; outside one it fails instead of activating.
    pub fn with_channel(
        service: &str,
        channel: Arc<dyn ServiceChannel>,
    ) -> Result<Self, BridgeError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(BridgeError::internal(
                "service channels must be activated inside a tokio runtime",
            ));
        }
        channel.set_event_handler(Arc::new(|_| {}));
        channel.activate();
        Ok(Self {
            service: service.to_string(),
            channel,
            tracker: CompletionTracker::new(service),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Issue `request` and wait for its response, or for `timeout` if given.
    ///
    /// A timeout does not recall the call; the sidecar may still apply it.
    pub async fn send(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response, BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::ConnectionClosed);
        }

        let request_id = request.request_id.clone();
        let method = request.method;
        let message = encode_message(&Envelope::Request(request))?;
        let pending = self.tracker.register(request_id.clone(), timeout)?;
        // `close` marks closed before failing entries: either the entry above
        // was failed with ConnectionClosed or the flag is visible now.
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::ConnectionClosed);
        }

        tracing::debug!(service = %self.service, request_id = %request_id, method = %method, "Sending request");

        let tracker = self.tracker.clone();
        let closed = Arc::clone(&self.closed);
        let expected = request_id.clone();
        self.channel.send_with_reply(
            message,
            Box::new(move |reply| {
                let outcome = match reply {
                    Ok(message) => response_from_message(&expected, message),
                    Err(_) if closed.load(Ordering::SeqCst) => Err(BridgeError::ConnectionClosed),
                    Err(err) => Err(err.into()),
                };
                tracker.resolve(&expected, outcome);
            }),
        );

        let response = pending.wait().await?;
        match response.outcome {
            ResponseOutcome::Ok { fd_attached: true } => Err(BridgeError::malformed(
                "service channel cannot carry descriptors",
            )),
            ResponseOutcome::Ok { .. } => Ok(response),
            ResponseOutcome::Error { detail } => Err(BridgeError::Remote {
                request_id: response.request_id,
                detail,
            }),
        }
    }

    pub fn remote_peer_identity(&self) -> PeerIdentity {
        match self.channel.remote_pid() {
            Some(pid) => PeerIdentity::Process(pid),
            None => PeerIdentity::Unknown,
        }
    }

    /// Cancel the channel. Pending and later sends fail with `ConnectionClosed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tracker.fail_all(BridgeError::ConnectionClosed);
        self.channel.cancel();
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }
}

fn response_from_message(
    expected: &RequestId,
    message: ServiceMessage,
) -> Result<Response, BridgeError> {
    match decode_message(message)? {
        Envelope::Response(response) if &response.request_id == expected => Ok(response),
        Envelope::Response(response) => Err(BridgeError::malformed(format!(
            "reply for {} answered {}",
            expected, response.request_id
        ))),
        other => Err(BridgeError::malformed(format!(
            "expected a response, got {}",
            other.kind_str()
        ))),
    }
}
