//! Wire protocol types for host-sidecar communication.
//!
//! Three envelope kinds share one self-describing encoding:
//! - **request**: host asks the sidecar to do something (carries a caller-chosen id)
//! - **response**: sidecar answers exactly one request
//! - **event**: sidecar reports something unprompted (process output, exit)
//!
//! Method and event tags are closed sets; an unknown tag fails decoding.

use serde::{Deserialize, Serialize};

/// Identifier correlating a response with the request that caused it.
///
/// Chosen by the side issuing the request, never by the responder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operations the host can ask of the sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Bootstrap,
    CreateProcess,
    StartProcess,
    Stdin,
    /// Open a live stdio stream of a remote process; the reply carries its descriptor.
    DialStdio,
    Signal,
    Resize,
    Wait,
    State,
    Stop,
    Shutdown,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::CreateProcess => "create_process",
            Self::StartProcess => "start_process",
            Self::Stdin => "stdin",
            Self::DialStdio => "dial_stdio",
            Self::Signal => "signal",
            Self::Resize => "resize",
            Self::Wait => "wait",
            Self::State => "state",
            Self::Stop => "stop",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether a successful reply to this method may carry a descriptor.
    pub fn may_carry_descriptor(&self) -> bool {
        matches!(self, Self::DialStdio | Self::CreateProcess)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Things the sidecar reports without being asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Stdout,
    Stderr,
    Exit,
    Log,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Exit => "exit",
            Self::Log => "log",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "requestID")]
    pub request_id: RequestId,
    pub method: Method,
    #[serde(rename = "processID")]
    pub process_id: String,
    #[serde(rename = "data", with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl Request {
    /// Build a request with a freshly generated id.
    pub fn new(method: Method, process_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::with_id(RequestId::new(), method, process_id, payload)
    }

    pub fn with_id(
        request_id: RequestId,
        method: Method,
        process_id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            request_id,
            method,
            process_id: process_id.into(),
            payload: payload.into(),
        }
    }
}

/// Result of the requested operation as reported by the sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// `fd_attached` tells the receiver a descriptor follows the frame.
    Ok { fd_attached: bool },
    Error { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ResponseWire", into = "ResponseWire")]
pub struct Response {
    pub request_id: RequestId,
    pub outcome: ResponseOutcome,
}

impl Response {
    pub fn ok(request_id: RequestId, fd_attached: bool) -> Self {
        Self {
            request_id,
            outcome: ResponseOutcome::Ok { fd_attached },
        }
    }

    pub fn error(request_id: RequestId, detail: impl Into<String>) -> Self {
        Self {
            request_id,
            outcome: ResponseOutcome::Error {
                detail: detail.into(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, ResponseOutcome::Ok { .. })
    }

    pub fn fd_attached(&self) -> bool {
        matches!(self.outcome, ResponseOutcome::Ok { fd_attached: true })
    }
}

/// Flat wire shape of a response; `ok` selects which of the other fields matter.
#[derive(Serialize, Deserialize)]
struct ResponseWire {
    #[serde(rename = "requestID")]
    request_id: RequestId,
    ok: bool,
    #[serde(rename = "fdAttached")]
    fd_attached: bool,
    #[serde(
        rename = "errorDetail",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    error_detail: Option<String>,
}

impl TryFrom<ResponseWire> for Response {
    type Error = String;

    fn try_from(wire: ResponseWire) -> Result<Self, Self::Error> {
        let outcome = if wire.ok {
            ResponseOutcome::Ok {
                fd_attached: wire.fd_attached,
            }
        } else {
            if wire.fd_attached {
                return Err("error response cannot carry a descriptor".to_string());
            }
            let detail = wire
                .error_detail
                .ok_or_else(|| "error response is missing errorDetail".to_string())?;
            ResponseOutcome::Error { detail }
        };
        Ok(Self {
            request_id: wire.request_id,
            outcome,
        })
    }
}

impl From<Response> for ResponseWire {
    fn from(response: Response) -> Self {
        match response.outcome {
            ResponseOutcome::Ok { fd_attached } => Self {
                request_id: response.request_id,
                ok: true,
                fd_attached,
                error_detail: None,
            },
            ResponseOutcome::Error { detail } => Self {
                request_id: response.request_id,
                ok: false,
                fd_attached: false,
                error_detail: Some(detail),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub kind: EventKind,
    #[serde(rename = "processID")]
    pub process_id: String,
    #[serde(rename = "data", with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl Event {
    pub fn new(kind: EventKind, process_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            process_id: process_id.into(),
            payload: payload.into(),
        }
    }
}

/// One transmitted protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Envelope {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Event(_) => "event",
        }
    }
}

impl From<Request> for Envelope {
    fn from(r: Request) -> Self {
        Self::Request(r)
    }
}

impl From<Response> for Envelope {
    fn from(r: Response) -> Self {
        Self::Response(r)
    }
}

impl From<Event> for Envelope {
    fn from(e: Event) -> Self {
        Self::Event(e)
    }
}

/// Serde adapter carrying opaque payload bytes as a base64 string.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes() {
        let req = Envelope::Request(Request::with_id(
            RequestId::from("req-1"),
            Method::Stdin,
            "proc-1",
            b"sidecar-stdin".to_vec(),
        ));
        insta::assert_json_snapshot!(req, @r#"
        {
          "kind": "request",
          "requestID": "req-1",
          "method": "stdin",
          "processID": "proc-1",
          "data": "c2lkZWNhci1zdGRpbg=="
        }
        "#);
    }

    #[test]
    fn ok_response_serializes() {
        let resp = Envelope::Response(Response::ok(RequestId::from("req-1"), true));
        insta::assert_json_snapshot!(resp, @r#"
        {
          "kind": "response",
          "requestID": "req-1",
          "ok": true,
          "fdAttached": true
        }
        "#);
    }

    #[test]
    fn error_response_serializes() {
        let resp = Envelope::Response(Response::error(RequestId::from("req-2"), "no such process"));
        insta::assert_json_snapshot!(resp, @r#"
        {
          "kind": "response",
          "requestID": "req-2",
          "ok": false,
          "fdAttached": false,
          "errorDetail": "no such process"
        }
        "#);
    }

    #[test]
    fn event_serializes() {
        let event = Envelope::Event(Event::new(EventKind::Stdout, "proc-2", b"stdout\n".to_vec()));
        insta::assert_json_snapshot!(event, @r#"
        {
          "kind": "event",
          "event": "stdout",
          "processID": "proc-2",
          "data": "c3Rkb3V0Cg=="
        }
        "#);
    }

    #[test]
    fn error_response_requires_detail() {
        let json = r#"{"kind":"response","requestID":"req-3","ok":false,"fdAttached":false}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }

    #[test]
    fn response_requires_fd_attached() {
        let json = r#"{"kind":"response","requestID":"req-3","ok":true}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }

    #[test]
    fn unknown_method_is_rejected() {
        let json = r#"{"kind":"request","requestID":"r","method":"reboot","processID":"p","data":""}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let json = r#"{"kind":"notification","processID":"p"}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let json = r#"{"kind":"event","event":"stderr","processID":"p","data":"***"}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn descriptor_capable_methods() {
        assert!(Method::DialStdio.may_carry_descriptor());
        assert!(!Method::Stdin.may_carry_descriptor());
    }
}
