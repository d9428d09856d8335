//! Framed codec for host-sidecar communication.
//!
//! Frame layout: `[4-byte big-endian length][length bytes of JSON]`.
//!
//! Two entry points share that layout:
//! - [`JsonCodec`]: `tokio_util` Encoder/Decoder for AsyncRead/AsyncWrite streams
//! - [`read_frame`] / [`write_frame`]: blocking loops for std streams, used by the
//!   socket binding where descriptor passing needs exact control of every read

use std::io::{self, Read, Write};
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::bridge::protocol::Envelope;
use crate::error::BridgeError;

pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Largest body accepted unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const LARGE_FRAME_BYTES: usize = 100_000;

/// Codec that frames messages with length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    max_frame_bytes: usize,
    /// Declared length of the frame being assembled. The inner codec consumes the
    /// prefix as soon as it sees it, so EOF reporting needs its own copy.
    pending_len: Option<usize>,
    _phantom: PhantomData<T>,
}

pub type EnvelopeCodec = JsonCodec<Envelope>;

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_PREFIX_BYTES)
                .big_endian()
                .max_frame_length(max_frame_bytes)
                .new_codec(),
            max_frame_bytes,
            pending_len: None,
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.pending_len.is_none() && src.len() >= LENGTH_PREFIX_BYTES {
            let mut header = &src[..LENGTH_PREFIX_BYTES];
            self.pending_len = Some(header.get_u32() as usize);
        }
        let frame = self.inner.decode(src).map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData {
                BridgeError::malformed(format!(
                    "declared length exceeds limit of {} bytes",
                    self.max_frame_bytes
                ))
            } else {
                BridgeError::from(e)
            }
        })?;
        match frame {
            Some(bytes) => {
                self.pending_len = None;
                tracing::trace!(frame_bytes = bytes.len(), "Decoded frame");
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        match self.pending_len {
            Some(expected) => Err(BridgeError::TruncatedFrame {
                expected,
                received: src.len(),
            }),
            None if src.is_empty() => Ok(None),
            None => Err(BridgeError::TruncatedFrame {
                expected: LENGTH_PREFIX_BYTES,
                received: src.len(),
            }),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = BridgeError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        log_encoded(json.len());
        self.inner.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}

fn log_encoded(json_len: usize) {
    tracing::trace!(json_size_bytes = json_len, "Encoding frame");
    if json_len > LARGE_FRAME_BYTES {
        tracing::info!(
            json_size_bytes = json_len,
            json_size_kb = json_len / 1024,
            "Large frame being encoded"
        );
    }
}

/// Encode one envelope into a self-terminating frame.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, BridgeError> {
    let json = serde_json::to_vec(envelope)?;
    log_encoded(json.len());
    let len = u32::try_from(json.len())
        .map_err(|_| BridgeError::malformed(format!("envelope of {} bytes", json.len())))?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + json.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// Decode exactly one frame held entirely in `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Envelope, BridgeError> {
    let Some((header, body)) = bytes.split_first_chunk::<LENGTH_PREFIX_BYTES>() else {
        return Err(BridgeError::malformed("frame shorter than its length prefix"));
    };
    let len = u32::from_be_bytes(*header) as usize;
    if body.len() != len {
        return Err(BridgeError::malformed(format!(
            "prefix declares {} bytes but frame holds {}",
            len,
            body.len()
        )));
    }
    Ok(serde_json::from_slice(body)?)
}

/// Write one envelope frame, retrying until every byte is transferred.
pub fn write_frame<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<(), BridgeError> {
    let frame = encode(envelope)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    tracing::trace!(kind = envelope.kind_str(), frame_bytes = frame.len(), "Wrote frame");
    Ok(())
}

/// Read one envelope frame.
///
/// EOF on a frame boundary is [`BridgeError::ConnectionClosed`]; EOF anywhere
/// else is [`BridgeError::TruncatedFrame`].
pub fn read_frame<R: Read>(reader: &mut R, max_frame_bytes: usize) -> Result<Envelope, BridgeError> {
    let mut header = [0u8; LENGTH_PREFIX_BYTES];
    match read_full(reader, &mut header)? {
        0 => return Err(BridgeError::ConnectionClosed),
        n if n < LENGTH_PREFIX_BYTES => {
            return Err(BridgeError::TruncatedFrame {
                expected: LENGTH_PREFIX_BYTES,
                received: n,
            });
        }
        _ => {}
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_bytes {
        return Err(BridgeError::malformed(format!(
            "declared length {} exceeds limit of {} bytes",
            len, max_frame_bytes
        )));
    }

    let mut body = vec![0u8; len];
    let received = read_full(reader, &mut body)?;
    if received < len {
        return Err(BridgeError::TruncatedFrame {
            expected: len,
            received,
        });
    }

    let envelope: Envelope = serde_json::from_slice(&body)?;
    tracing::trace!(kind = envelope.kind_str(), frame_bytes = len, "Read frame");
    Ok(envelope)
}

/// Fill `buf` unless EOF comes first. Returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}


#[cfg(test)]
mod round_trip {
    use super::*;
    use crate::bridge::protocol::{
        Event, EventKind, Method, Request, RequestId, Response, ResponseOutcome,
    };
    use proptest::prelude::*;

    fn method() -> impl Strategy<Value = Method> {
        prop_oneof![
            Just(Method::Bootstrap),
            Just(Method::CreateProcess),
            Just(Method::StartProcess),
            Just(Method::Stdin),
            Just(Method::DialStdio),
            Just(Method::Signal),
            Just(Method::Resize),
            Just(Method::Wait),
            Just(Method::State),
            Just(Method::Stop),
            Just(Method::Shutdown),
        ]
    }

    fn event_kind() -> impl Strategy<Value = EventKind> {
        prop_oneof![
            Just(EventKind::Stdout),
            Just(EventKind::Stderr),
            Just(EventKind::Exit),
            Just(EventKind::Log),
        ]
    }

    fn request_id() -> BoxedStrategy<RequestId> {
        ".{0,40}".prop_map(RequestId::from).boxed()
    }

    fn payload() -> BoxedStrategy<Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..512).boxed()
    }

    fn envelope() -> impl Strategy<Value = Envelope> {
        let request = (request_id(), method(), ".{0,24}", payload()).prop_map(
            |(id, method, process_id, data)| {
                Envelope::Request(Request::with_id(id, method, process_id, data))
            },
        );
        let outcome = prop_oneof![
            any::<bool>().prop_map(|fd_attached| ResponseOutcome::Ok { fd_attached }),
            ".{0,64}".prop_map(|detail| ResponseOutcome::Error { detail }),
        ];
        let response = (request_id(), outcome).prop_map(|(request_id, outcome)| {
            Envelope::Response(Response {
                request_id,
                outcome,
            })
        });
        let event = (event_kind(), ".{0,24}", payload()).prop_map(|(kind, process_id, data)| {
            Envelope::Event(Event::new(kind, process_id, data))
        });
        prop_oneof![request, response, event]
    }

    proptest! {
        #[test]
        fn every_envelope_survives_encode_and_decode(envelope in envelope()) {
            let frame = encode(&envelope).unwrap();
            prop_assert_eq!(decode(&frame).unwrap(), envelope.clone());

            let mut stream = &frame[..];
            prop_assert_eq!(read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES).unwrap(), envelope);
            prop_assert!(stream.is_empty());
        }
    }
}
