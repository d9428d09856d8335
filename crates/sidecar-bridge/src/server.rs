//! Sidecar-side responder for the socket binding.
//!
//! [`serve_connection`] reads request frames and runs each through a
//! [`RequestHandler`] on its own thread, so a long `wait` does not hold up a
//! `stdin` behind it. Every response frame is followed by exactly one
//! descriptor marker, and frame plus marker are written under one lock shared
//! with the [`EventEmitter`]: nothing else can land between them.

use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::bridge::protocol::{Envelope, Event, Method, Request, RequestId, Response};
use crate::bridge::transport::SocketTransport;
use crate::error::BridgeError;

/// What a handler decided for one request.
#[derive(Debug)]
pub enum HandlerReply {
    Ok,
    /// Success with a descriptor for the host, e.g. for `dial_stdio`.
    OkWithDescriptor(OwnedFd),
    Error(String),
}

impl HandlerReply {
    pub fn error(detail: impl Into<String>) -> Self {
        Self::Error(detail.into())
    }
}

pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: Request, events: &EventEmitter) -> HandlerReply;
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Responder writer mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

/// Write half of a served connection.
struct FrameWriter {
    transport: Mutex<SocketTransport>,
}

impl FrameWriter {
    fn respond(
        &self,
        method: Method,
        request_id: RequestId,
        reply: HandlerReply,
    ) -> Result<(), BridgeError> {
        let (response, descriptor) = match reply {
            HandlerReply::Ok => (Response::ok(request_id, false), None),
            HandlerReply::OkWithDescriptor(_) if !method.may_carry_descriptor() => {
                tracing::error!(request_id = %request_id, method = %method, "Handler attached a descriptor to a method that cannot carry one");
                let detail = format!("{method} replies cannot carry a descriptor");
                (Response::error(request_id, detail), None)
            }
            HandlerReply::OkWithDescriptor(fd) => (Response::ok(request_id, true), Some(fd)),
            HandlerReply::Error(detail) => (Response::error(request_id, detail), None),
        };

        // Our copy of the descriptor closes on return; the host holds its own.
        let transport = lock(&self.transport);
        transport.write_frame_with_descriptor(
            &Envelope::Response(response),
            descriptor.as_ref().map(|fd| fd.as_fd()),
        )
    }

    fn emit(&self, event: &Event) -> Result<(), BridgeError> {
        lock(&self.transport).write_frame(&Envelope::Event(event.clone()))
    }
}

/// Pushes unsolicited events to the host on a served connection.
#[derive(Clone)]
pub struct EventEmitter {
    writer: Arc<FrameWriter>,
}

impl EventEmitter {
    pub fn emit(&self, event: &Event) -> Result<(), BridgeError> {
        tracing::trace!(kind = event.kind.as_str(), process_id = %event.process_id, "Emitting event");
        self.writer.emit(event)
    }
}

/// One served connection: the read loop plus the shared writer.
pub struct Responder {
    reader: SocketTransport,
    emitter: EventEmitter,
}

impl Responder {
    pub fn new(transport: SocketTransport) -> Result<Self, BridgeError> {
        let reader = transport.try_clone()?;
        Ok(Self {
            reader,
            emitter: EventEmitter {
                writer: Arc::new(FrameWriter {
                    transport: Mutex::new(transport),
                }),
            },
        })
    }

    /// Emitter for events raised outside any request, e.g. process exits.
    pub fn emitter(&self) -> EventEmitter {
        self.emitter.clone()
    }

    /// Serve requests until the host goes away.
    ///
    /// Returns `Ok` when the host closes the connection, or the error that
    /// ended the read loop. Handler threads still running finish on their own;
    /// their writes fail once the connection is gone.
    pub fn run<H: RequestHandler>(self, handler: Arc<H>) -> Result<(), BridgeError> {
        loop {
            let request = match self.reader.read_frame() {
                Ok(Envelope::Request(request)) => request,
                Ok(other) => {
                    tracing::warn!(kind = other.kind_str(), "Ignoring non-request frame from host");
                    continue;
                }
                Err(BridgeError::ConnectionClosed) => {
                    tracing::debug!("Host closed control connection");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Control connection read failed");
                    return Err(e);
                }
            };

            tracing::debug!(request_id = %request.request_id, method = %request.method, process_id = %request.process_id, "Handling request");

            let handler = Arc::clone(&handler);
            let emitter = self.emitter.clone();
            std::thread::Builder::new()
                .name(format!("sidecar-{}", request.method))
                .spawn(move || {
                    let method = request.method;
                    let request_id = request.request_id.clone();
                    let reply = handler.handle(request, &emitter);
                    if let Err(e) = emitter.writer.respond(method, request_id.clone(), reply) {
                        tracing::warn!(request_id = %request_id, error = %e, "Failed to write response");
                    }
                })?;
        }
    }
}

/// Serve one connection until the host closes it.
pub fn serve_connection<H: RequestHandler>(
    transport: SocketTransport,
    handler: Arc<H>,
) -> Result<(), BridgeError> {
    Responder::new(transport)?.run(handler)
}

/// Accept host connections on `listener`, serving each on its own thread.
pub fn serve<H: RequestHandler>(listener: UnixListener, handler: Arc<H>) -> Result<(), BridgeError> {
    loop {
        let (stream, _) = listener.accept()?;
        tracing::debug!("Accepted control connection");
        let handler = Arc::clone(&handler);
        std::thread::Builder::new()
            .name("sidecar-conn".to_string())
            .spawn(move || {
                if let Err(e) = serve_connection(SocketTransport::new(stream), handler) {
                    tracing::warn!(error = %e, "Control connection ended with error");
                }
            })?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::time::Duration;

    use crate::bridge::protocol::{EventKind, Method};
    use crate::client::{ControlTransport, SidecarClient, SocketClient};

    /// Minimal process table: echoes stdin back as a stdout event and hands out
    /// a pipe for `dial_stdio`.
    struct FakeSidecar {
        stdio_payload: &'static [u8],
    }

    impl RequestHandler for FakeSidecar {
        fn handle(&self, request: Request, events: &EventEmitter) -> HandlerReply {
            match request.method {
                Method::Stdin => {
                    let echo = Event::new(EventKind::Stdout, request.process_id, request.payload);
                    match events.emit(&echo) {
                        Ok(()) => HandlerReply::Ok,
                        Err(e) => HandlerReply::error(e.to_string()),
                    }
                }
                Method::DialStdio => {
                    let (read_end, write_end) = match nix::unistd::pipe() {
                        Ok(pair) => pair,
                        Err(e) => return HandlerReply::error(e.to_string()),
                    };
                    let mut writer = File::from(write_end);
                    if let Err(e) = writer.write_all(self.stdio_payload) {
                        return HandlerReply::error(e.to_string());
                    }
                    HandlerReply::OkWithDescriptor(read_end)
                }
                Method::Wait => {
                    std::thread::sleep(Duration::from_millis(200));
                    HandlerReply::Ok
                }
                // Misbehaves on purpose: `state` replies never carry descriptors.
                Method::State => match nix::unistd::pipe() {
                    Ok((read_end, _write_end)) => HandlerReply::OkWithDescriptor(read_end),
                    Err(e) => HandlerReply::error(e.to_string()),
                },
                _ => HandlerReply::error(format!("unsupported method {}", request.method)),
            }
        }
    }

    fn start() -> (SidecarClient, std::thread::JoinHandle<Result<(), BridgeError>>) {
        let (host, sidecar) = SocketTransport::pair().unwrap();
        let handler = Arc::new(FakeSidecar {
            stdio_payload: b"fd-pass",
        });
        let server = std::thread::spawn(move || serve_connection(sidecar, handler));
        let client: Arc<dyn ControlTransport> = Arc::new(SocketClient::new(host).unwrap());
        (SidecarClient::new(client), server)
    }

    #[tokio::test]
    async fn stdin_round_trip_with_event() {
        let (client, _server) = start();

        let response = client.write_stdin("proc-1", b"hello".to_vec()).await.unwrap();
        assert!(response.is_ok());

        let event = client.receive_event().await.unwrap();
        assert_eq!(event.kind, EventKind::Stdout);
        assert_eq!(event.process_id, "proc-1");
        assert_eq!(event.payload, b"hello");
    }

    #[tokio::test]
    async fn dial_stdio_passes_pipe() {
        let (client, _server) = start();

        let fd = client.dial_stdio("proc-1").await.unwrap();
        let mut out = String::new();
        File::from(fd).read_to_string(&mut out).unwrap();
        assert_eq!(out, "fd-pass");
    }

    #[tokio::test]
    async fn slow_handler_does_not_block_others() {
        let (client, _server) = start();

        let waiting = {
            let client = client.clone();
            tokio::spawn(async move { client.wait("proc-1").await })
        };
        let response = client.write_stdin("proc-1", b"x".to_vec()).await.unwrap();
        assert!(response.is_ok());
        assert!(!waiting.is_finished());
        assert!(waiting.await.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn handler_error_reaches_caller() {
        let (client, _server) = start();
        match client.stop("proc-1").await {
            Err(BridgeError::Remote { detail, .. }) => {
                assert_eq!(detail, "unsupported method stop");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn loop_ends_cleanly_when_host_closes() {
        let (client, server) = start();
        client.close();
        drop(client);
        assert!(server.join().unwrap().is_ok());
    }

    #[test]
    fn listener_serves_each_connection() {
        use crate::bridge::transport::ServiceAddress;

        let dir = tempfile::tempdir().unwrap();
        let address = ServiceAddress::path(dir.path().join("sidecar.sock"));
        let listener = address.bind().unwrap();
        std::thread::spawn(move || {
            serve(
                listener,
                Arc::new(FakeSidecar {
                    stdio_payload: b"",
                }),
            )
        });

        for n in 0..2 {
            let host = SocketTransport::connect(&address).unwrap();
            let id = RequestId::from(format!("req-{n}"));
            host.write_frame(&Envelope::Request(Request::with_id(
                id.clone(),
                Method::Stdin,
                "proc-1",
                b"ping".to_vec(),
            )))
            .unwrap();

            // The echo event is emitted before the handler returns its reply.
            assert!(matches!(host.read_frame().unwrap(), Envelope::Event(_)));
            match host.read_frame().unwrap() {
                Envelope::Response(response) => assert_eq!(response.request_id, id),
                other => panic!("expected response, got {other:?}"),
            }
            assert!(host.receive_optional_descriptor().unwrap().is_none());
        }
    }

    #[test]
    fn descriptor_refused_for_plain_method() {
        let (host, sidecar) = SocketTransport::pair().unwrap();
        std::thread::spawn(move || {
            serve_connection(
                sidecar,
                Arc::new(FakeSidecar {
                    stdio_payload: b"",
                }),
            )
        });

        host.write_frame(&Envelope::Request(Request::with_id(
            RequestId::from("req-state"),
            Method::State,
            "proc-1",
            Vec::new(),
        )))
        .unwrap();

        match host.read_frame().unwrap() {
            Envelope::Response(response) => {
                assert_eq!(response.request_id, RequestId::from("req-state"));
                assert!(!response.fd_attached());
                assert_eq!(
                    response.outcome,
                    crate::bridge::protocol::ResponseOutcome::Error {
                        detail: "state replies cannot carry a descriptor".to_string()
                    }
                );
            }
            other => panic!("expected response, got {other:?}"),
        }
        assert!(host.receive_optional_descriptor().unwrap().is_none());
    }

    #[tokio::test]
    async fn emitter_pushes_events_outside_requests() {
        let (host, sidecar) = SocketTransport::pair().unwrap();
        let responder = Responder::new(sidecar).unwrap();
        let emitter = responder.emitter();
        std::thread::spawn(move || {
            responder.run(Arc::new(FakeSidecar {
                stdio_payload: b"",
            }))
        });
        let client = SidecarClient::new(Arc::new(SocketClient::new(host).unwrap()));

        emitter
            .emit(&Event::new(EventKind::Exit, "proc-3", b"0".to_vec()))
            .unwrap();

        let event = client.receive_event().await.unwrap();
        assert_eq!(event.kind, EventKind::Exit);
        assert_eq!(event.process_id, "proc-3");
        assert_eq!(event.payload, b"0");
    }

    #[test]
    fn stray_frames_are_ignored() {
        let (host, sidecar) = SocketTransport::pair().unwrap();
        let server = std::thread::spawn(move || {
            serve_connection(
                sidecar,
                Arc::new(FakeSidecar {
                    stdio_payload: b"",
                }),
            )
        });

        host.write_frame(&Envelope::Event(Event::new(EventKind::Log, "p", Vec::new())))
            .unwrap();
        host.write_frame(&Envelope::Request(Request::with_id(
            RequestId::from("req-1"),
            Method::Resize,
            "p",
            Vec::new(),
        )))
        .unwrap();

        match host.read_frame().unwrap() {
            Envelope::Response(response) => {
                assert_eq!(response.request_id, RequestId::from("req-1"));
                assert!(!response.is_ok());
            }
            other => panic!("expected response, got {other:?}"),
        }
        assert!(host.receive_optional_descriptor().unwrap().is_none());

        host.close();
        assert!(server.join().unwrap().is_ok());
    }
}
