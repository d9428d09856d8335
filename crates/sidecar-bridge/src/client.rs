//! Host-side client facade.
//!
//! [`ControlTransport`] is the seam both bindings plug into. [`SocketClient`]
//! drives the socket binding with one dedicated reader thread per connection;
//! [`NamedServiceTransport`] drives the named-service binding. [`SidecarClient`]
//! wraps either one, applies the configured default timeout, and offers typed
//! helpers per method.

use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bridge::protocol::{Envelope, Event, Method, Request, Response, ResponseOutcome};
use crate::bridge::service::NamedServiceTransport;
use crate::bridge::transport::{ServiceAddress, SocketTransport};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::tracker::CompletionTracker;

/// Successful reply, plus the descriptor that followed it, if any.
#[derive(Debug)]
pub struct Reply {
    pub response: Response,
    pub descriptor: Option<OwnedFd>,
}

/// Request/response transport to one sidecar.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    /// Send `request` and wait for its reply, or for `timeout` if given.
    ///
    /// An error response from the sidecar is returned as [`BridgeError::Remote`].
    async fn send(&self, request: Request, timeout: Option<Duration>) -> Result<Reply, BridgeError>;

    /// Next unsolicited event from the sidecar.
    async fn receive_event(&self) -> Result<Event, BridgeError> {
        Err(BridgeError::EventsUnsupported)
    }

    /// Tear down the connection. Pending and later sends fail.
    fn close(&self);
}

#[async_trait]
impl ControlTransport for NamedServiceTransport {
    async fn send(&self, request: Request, timeout: Option<Duration>) -> Result<Reply, BridgeError> {
        let response = NamedServiceTransport::send(self, request, timeout).await?;
        Ok(Reply {
            response,
            descriptor: None,
        })
    }

    fn close(&self) {
        NamedServiceTransport::close(self);
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Socket client mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

/// Socket binding client.
///
/// A reader thread owns the read side of the connection: `Response` frames
/// (and the descriptor marker after each) go to the tracker, `Event` frames go
/// to an unbounded queue. Writes share one lock so frames never interleave.
pub struct SocketClient {
    transport: Arc<SocketTransport>,
    writer: Arc<Mutex<()>>,
    tracker: CompletionTracker<Reply>,
    /// Terminal error once the reader has stopped.
    terminal: Arc<Mutex<Option<BridgeError>>>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
}

impl SocketClient {
    pub fn new(transport: SocketTransport) -> Result<Self, BridgeError> {
        Self::with_route(transport, "socket")
    }

    /// `route` names the peer in timeout errors.
    pub fn with_route(transport: SocketTransport, route: &str) -> Result<Self, BridgeError> {
        let read_side = transport.try_clone()?;
        let tracker = CompletionTracker::new(route);
        let terminal = Arc::new(Mutex::new(None));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        {
            let tracker = tracker.clone();
            let terminal = Arc::clone(&terminal);
            std::thread::Builder::new()
                .name("sidecar-reader".to_string())
                .spawn(move || read_loop(read_side, tracker, terminal, events_tx))?;
        }

        tracing::debug!(route, "Socket client started");
        Ok(Self {
            transport: Arc::new(transport),
            writer: Arc::new(Mutex::new(())),
            tracker,
            terminal,
            events: tokio::sync::Mutex::new(events_rx),
        })
    }

    pub fn connect(address: &ServiceAddress, config: &BridgeConfig) -> Result<Self, BridgeError> {
        let transport =
            SocketTransport::connect(address)?.with_max_frame_bytes(config.max_frame_bytes);
        Self::with_route(transport, &address.to_string())
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }

    fn terminal_error(&self) -> Option<BridgeError> {
        lock(&self.terminal).clone()
    }
}

fn read_loop(
    transport: SocketTransport,
    tracker: CompletionTracker<Reply>,
    terminal: Arc<Mutex<Option<BridgeError>>>,
    events: mpsc::UnboundedSender<Event>,
) {
    let err = loop {
        match transport.read_frame() {
            Ok(Envelope::Response(response)) => {
                let descriptor = match transport.receive_optional_descriptor() {
                    Ok(descriptor) => descriptor,
                    Err(e) => break e,
                };
                if response.fd_attached() != descriptor.is_some() {
                    break BridgeError::malformed(format!(
                        "response {} disagrees with its descriptor marker",
                        response.request_id
                    ));
                }
                tracing::trace!(request_id = %response.request_id, fd = descriptor.is_some(), "Received response");
                let request_id = response.request_id.clone();
                // A reply nobody waits for drops here, closing any descriptor with it.
                tracker.resolve(
                    &request_id,
                    Ok(Reply {
                        response,
                        descriptor,
                    }),
                );
            }
            Ok(Envelope::Event(event)) => {
                tracing::trace!(kind = event.kind.as_str(), process_id = %event.process_id, "Received event");
                if events.send(event).is_err() {
                    tracing::debug!("Event queue closed, dropping event");
                }
            }
            Ok(Envelope::Request(request)) => {
                tracing::warn!(request_id = %request.request_id, "Ignoring request frame sent to host");
            }
            Err(e) => break e,
        }
    };

    match &err {
        BridgeError::ConnectionClosed => tracing::debug!("Sidecar connection closed"),
        other => tracing::warn!(error = %other, "Socket reader stopped"),
    }

    // Publish the terminal error before failing entries so a concurrent send
    // either sees it or is among the entries failed here. An explicit close wins.
    lock(&terminal).get_or_insert_with(|| err.clone());
    tracker.fail_all(err);
    transport.close();
}

#[async_trait]
impl ControlTransport for SocketClient {
    async fn send(&self, request: Request, timeout: Option<Duration>) -> Result<Reply, BridgeError> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }

        let request_id = request.request_id.clone();
        let pending = self.tracker.register(request_id.clone(), timeout)?;
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }

        tracing::debug!(request_id = %request_id, method = %request.method, "Sending request");

        // The write is not awaited: a peer that stops reading can block it
        // indefinitely, and the timer must still decide the outcome. A failed
        // write settles the entry itself.
        let method = request.method;
        let transport = Arc::clone(&self.transport);
        let writer = Arc::clone(&self.writer);
        let tracker = self.tracker.clone();
        let envelope = Envelope::Request(request);
        tokio::task::spawn_blocking(move || {
            let written = {
                let _guard = lock(&writer);
                transport.write_frame(&envelope)
            };
            if let Err(e) = written {
                tracing::debug!(request_id = %request_id, error = %e, "Request write failed");
                tracker.resolve(&request_id, Err(e));
            }
        });

        let reply = pending.wait().await?;
        if reply.descriptor.is_some() && !method.may_carry_descriptor() {
            // Dropping the reply closes the unexpected descriptor.
            return Err(BridgeError::malformed(format!(
                "{} reply {} carried a descriptor",
                method, reply.response.request_id
            )));
        }
        match &reply.response.outcome {
            ResponseOutcome::Ok { .. } => Ok(reply),
            ResponseOutcome::Error { detail } => Err(BridgeError::Remote {
                request_id: reply.response.request_id.clone(),
                detail: detail.clone(),
            }),
        }
    }

    async fn receive_event(&self) -> Result<Event, BridgeError> {
        self.events
            .lock()
            .await
            .recv()
            .await
            .ok_or(BridgeError::ConnectionClosed)
    }

    fn close(&self) {
        {
            let mut terminal = lock(&self.terminal);
            if terminal.is_none() {
                *terminal = Some(BridgeError::ConnectionClosed);
            }
        }
        self.tracker.fail_all(BridgeError::ConnectionClosed);
        self.transport.close();
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        // The detached reader thread sees EOF and exits.
        ControlTransport::close(self);
    }
}

/// Typed entry point for host code.
#[derive(Clone)]
pub struct SidecarClient {
    transport: Arc<dyn ControlTransport>,
    default_timeout: Option<Duration>,
}

impl SidecarClient {
    pub fn new(transport: Arc<dyn ControlTransport>) -> Self {
        Self {
            transport,
            default_timeout: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Connect over the socket binding to the configured service name.
    pub fn connect_socket(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let address = ServiceAddress::for_service(&config.service_name);
        let client = SocketClient::connect(&address, config)?;
        Ok(Self::new(Arc::new(client)).with_default_timeout(config.request_timeout))
    }

    /// Connect over the named-service binding to the configured service name.
    pub async fn connect_service(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let transport = NamedServiceTransport::connect(&config.service_name).await?;
        Ok(Self::new(Arc::new(transport)).with_default_timeout(config.request_timeout))
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    pub async fn send(&self, request: Request) -> Result<Reply, BridgeError> {
        self.transport.send(request, self.default_timeout).await
    }

    pub async fn send_with_timeout(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Reply, BridgeError> {
        self.transport.send(request, timeout).await
    }

    pub async fn receive_event(&self) -> Result<Event, BridgeError> {
        self.transport.receive_event().await
    }

    pub fn close(&self) {
        self.transport.close();
    }

    async fn call(
        &self,
        method: Method,
        process_id: &str,
        payload: Vec<u8>,
    ) -> Result<Response, BridgeError> {
        let reply = self.send(Request::new(method, process_id, payload)).await?;
        Ok(reply.response)
    }

    /// Hand the sidecar its initial configuration.
    pub async fn bootstrap(&self, config: Vec<u8>) -> Result<Response, BridgeError> {
        self.call(Method::Bootstrap, "", config).await
    }

    /// Create a process from `spec`. The sidecar may attach a descriptor.
    pub async fn create_process(&self, process_id: &str, spec: Vec<u8>) -> Result<Reply, BridgeError> {
        self.send(Request::new(Method::CreateProcess, process_id, spec))
            .await
    }

    pub async fn start_process(&self, process_id: &str) -> Result<Response, BridgeError> {
        self.call(Method::StartProcess, process_id, Vec::new()).await
    }

    pub async fn write_stdin(&self, process_id: &str, data: Vec<u8>) -> Result<Response, BridgeError> {
        self.call(Method::Stdin, process_id, data).await
    }

    /// Obtain a descriptor connected to the process's stdio.
    pub async fn dial_stdio(&self, process_id: &str) -> Result<OwnedFd, BridgeError> {
        let reply = self
            .send(Request::new(Method::DialStdio, process_id, Vec::new()))
            .await?;
        reply.descriptor.ok_or_else(|| {
            BridgeError::malformed(format!(
                "dial_stdio reply {} carried no descriptor",
                reply.response.request_id
            ))
        })
    }

    /// Deliver `signal` (decimal in the payload) to the process.
    pub async fn signal(&self, process_id: &str, signal: i32) -> Result<Response, BridgeError> {
        self.call(Method::Signal, process_id, signal.to_string().into_bytes())
            .await
    }

    pub async fn wait(&self, process_id: &str) -> Result<Response, BridgeError> {
        self.call(Method::Wait, process_id, Vec::new()).await
    }

    pub async fn stop(&self, process_id: &str) -> Result<Response, BridgeError> {
        self.call(Method::Stop, process_id, Vec::new()).await
    }

    pub async fn shutdown(&self) -> Result<Response, BridgeError> {
        self.call(Method::Shutdown, "", Vec::new()).await
    }
}
