//! Error taxonomy for the control-plane transport.
//!
//! Every transport, codec and correlation failure surfaces as one [`BridgeError`].
//! The enum is `Clone` so a single terminal condition (reader died, channel
//! cancelled) can fail every pending request with the same value.

use std::io;
use std::time::Duration;

use crate::bridge::protocol::RequestId;

/// Sub-kind of a [`BridgeError::Transport`] failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Peer process or connection died. Retryable by reconnecting.
    Interrupted,
    /// Any other failure of the underlying primitive. Surfaced as-is.
    Internal,
}

impl TransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interrupted => "interrupted",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Bad length prefix or undecodable body. Indicates a protocol/version mismatch.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Stream ended in the middle of a frame.
    #[error("truncated frame: expected {expected} bytes, got {received}")]
    TruncatedFrame { expected: usize, received: usize },

    /// Peer closed the connection cleanly, or the local side was closed.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport error ({}): {message}", kind.as_str())]
    Transport {
        kind: TransportErrorKind,
        /// Underlying OS error code, when there is one.
        code: Option<i32>,
        message: String,
    },

    /// Synthetic timeout raised by the completion tracker.
    #[error("request {request_id} to {route} timed out after {after:?}")]
    Timeout {
        route: String,
        request_id: RequestId,
        after: Duration,
    },

    /// Protocol-level failure reported by the sidecar inside a response.
    #[error("request {request_id} failed: {detail}")]
    Remote { request_id: RequestId, detail: String },

    /// The caller reused an identifier that is still in flight.
    #[error("request {0} is already in flight")]
    DuplicateRequest(RequestId),

    /// The binding has no event stream.
    #[error("this transport does not deliver events")]
    EventsUnsupported,
}

impl BridgeError {
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportErrorKind::Interrupted,
            code: None,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportErrorKind::Internal,
            code: None,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame(message.into())
    }

    /// True for conditions where the connection is gone and the caller must reconnect.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::TruncatedFrame { .. }
                | Self::Transport {
                    kind: TransportErrorKind::Interrupted,
                    ..
                }
        )
    }

    /// True when reconnecting and re-issuing the request may succeed.
    ///
    /// Remote failures are never retryable at this layer; timeouts are left to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                kind: TransportErrorKind::Interrupted,
                ..
            }
        )
    }
}

impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => TransportErrorKind::Interrupted,
            _ => TransportErrorKind::Internal,
        };
        Self::Transport {
            kind,
            code: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for BridgeError {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::from(io::Error::from(errno))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedFrame(err.to_string())
    }
}
