//! sidecar-bridge: control-plane transport between a sandbox host and its in-VM sidecar.

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod telemetry;
pub mod tracker;

pub use bridge::protocol::{Envelope, Event, EventKind, Method, Request, RequestId, Response, ResponseOutcome};
pub use bridge::service::{NamedServiceTransport, PeerIdentity, ServiceListener};
pub use bridge::transport::{ServiceAddress, SocketTransport};
pub use client::{ControlTransport, Reply, SidecarClient, SocketClient};
pub use config::BridgeConfig;
pub use error::{BridgeError, TransportErrorKind};
pub use server::{EventEmitter, HandlerReply, RequestHandler, Responder, serve_connection};
pub use tracker::{CompletionTracker, PendingReply};
