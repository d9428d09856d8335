//! Socket transport binding and service addressing.
//!
//! [`SocketTransport`] is the raw bidirectional binding: blocking frame reads and
//! writes plus the descriptor helpers, all keyed to one Unix stream. Callers who
//! want concurrency dedicate a thread per direction (see `client::SocketClient`).
//!
//! [`ServiceAddress`] resolves a well-known service name to a socket:
//! - **Abstract**: Linux abstract namespace (no filesystem, auto-cleanup)
//! - **Path**: filesystem socket (macOS, BSD, or an explicit path anywhere)

use std::io;
use std::net::Shutdown;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::bridge::codec::{self, DEFAULT_MAX_FRAME_BYTES};
use crate::bridge::fdpass::DescriptorTransfer;
use crate::bridge::protocol::Envelope;
use crate::error::BridgeError;

/// Where a named service listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceAddress {
    Path { path: PathBuf },
    #[cfg(target_os = "linux")]
    Abstract { name: String },
}

impl ServiceAddress {
    /// Platform default for a service name (abstract on Linux, `$TMPDIR/<name>.sock` elsewhere).
    pub fn for_service(name: &str) -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Abstract {
                name: name.to_string(),
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::Path {
                path: std::env::temp_dir().join(format!("{}.sock", name)),
            }
        }
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path { path: path.into() }
    }

    pub fn bind(&self) -> io::Result<UnixListener> {
        match self {
            Self::Path { path } => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                tracing::debug!(path = %path.display(), "Binding service socket");
                UnixListener::bind(path)
            }
            #[cfg(target_os = "linux")]
            Self::Abstract { name } => {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::SocketAddr;

                tracing::debug!(name = %name, "Binding abstract service socket");
                let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
                UnixListener::bind_addr(&addr)
            }
        }
    }

    pub fn connect(&self) -> io::Result<UnixStream> {
        match self {
            Self::Path { path } => {
                tracing::trace!(path = %path.display(), "Connecting to service socket");
                UnixStream::connect(path)
            }
            #[cfg(target_os = "linux")]
            Self::Abstract { name } => {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::SocketAddr;

                tracing::trace!(name = %name, "Connecting to abstract service socket");
                let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
                UnixStream::connect_addr(&addr)
            }
        }
    }

    /// Remove the filesystem entry, if any.
    pub fn cleanup(&self) -> io::Result<()> {
        match self {
            Self::Path { path } if path.exists() => {
                tracing::debug!(path = %path.display(), "Removing service socket");
                std::fs::remove_file(path)
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path { path } => write!(f, "{}", path.display()),
            #[cfg(target_os = "linux")]
            Self::Abstract { name } => write!(f, "@{}", name),
        }
    }
}

/// Blocking frame transport over one Unix stream.
pub struct SocketTransport {
    stream: UnixStream,
    max_frame_bytes: usize,
    closed: AtomicBool,
}

impl SocketTransport {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Connected pair, mostly for in-process peers and tests.
    pub fn pair() -> Result<(Self, Self), BridgeError> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    pub fn connect(address: &ServiceAddress) -> Result<Self, BridgeError> {
        let stream = address.connect()?;
        tracing::debug!(address = %address, "Connected socket transport");
        Ok(Self::new(stream))
    }

    /// Second handle on the same connection, e.g. for a dedicated reader thread.
    pub fn try_clone(&self) -> Result<Self, BridgeError> {
        Ok(Self {
            stream: self.stream.try_clone()?,
            max_frame_bytes: self.max_frame_bytes,
            closed: AtomicBool::new(self.is_closed()),
        })
    }

    pub fn write_frame(&self, envelope: &Envelope) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let mut stream = &self.stream;
        codec::write_frame(&mut stream, envelope)
    }

    pub fn read_frame(&self) -> Result<Envelope, BridgeError> {
        self.ensure_open()?;
        let mut stream = &self.stream;
        codec::read_frame(&mut stream, self.max_frame_bytes)
    }

    pub fn send_descriptor(&self, fd: BorrowedFd<'_>) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.stream.send_descriptor(fd)
    }

    pub fn send_no_descriptor(&self) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.stream.send_no_descriptor()
    }

    pub fn receive_optional_descriptor(&self) -> Result<Option<OwnedFd>, BridgeError> {
        self.ensure_open()?;
        self.stream.receive_optional_descriptor()
    }

    /// Write a frame followed by its descriptor marker.
    ///
    /// Callers sharing the connection must hold their writer lock across this call.
    pub fn write_frame_with_descriptor(
        &self,
        envelope: &Envelope,
        fd: Option<BorrowedFd<'_>>,
    ) -> Result<(), BridgeError> {
        self.write_frame(envelope)?;
        match fd {
            Some(fd) => self.send_descriptor(fd),
            None => self.send_no_descriptor(),
        }
    }

    /// Shut down both directions. Blocked readers on any clone see EOF.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Closing socket transport");
        if let Err(e) = self.stream.shutdown(Shutdown::Both)
            && e.kind() != io::ErrorKind::NotConnected
        {
            tracing::warn!(error = %e, "Failed to shut down socket");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.is_closed() {
            Err(BridgeError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}
