//! Control-plane wire layer between the host and the in-VM sidecar.
//!
//! # Architecture
//!
//! - **protocol**: Envelope types (Request, Response, Event)
//! - **codec**: Length-prefixed JSON framing, sync and tokio flavours
//! - **fdpass**: One-byte descriptor marker with SCM_RIGHTS
//! - **transport**: Socket binding and service addressing
//! - **service**: Named-service binding over a reply-callback channel

pub mod codec;
pub mod fdpass;
pub mod protocol;
pub mod service;
pub mod transport;
