//! Bridge configuration.

use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_FRAME_BYTES;

pub const DEFAULT_SERVICE_NAME: &str = "sandbox-sidecar";

/// Connection settings shared by both bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Well-known name the sidecar is reachable under.
    pub service_name: String,
    /// Applied by `SidecarClient` when the caller gives none. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Largest declared frame length accepted by the decoder.
    pub max_frame_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            request_timeout: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl BridgeConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Read `SIDECAR_SERVICE_NAME`, `SIDECAR_REQUEST_TIMEOUT` (seconds) and
    /// `SIDECAR_MAX_FRAME_BYTES`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(name) = lookup("SIDECAR_SERVICE_NAME").filter(|s| !s.is_empty()) {
            config.service_name = name;
        }

        if let Some(raw) = lookup("SIDECAR_REQUEST_TIMEOUT") {
            match raw.parse::<f64>().map(Duration::try_from_secs_f64) {
                Ok(Ok(timeout)) if timeout.is_zero() => config.request_timeout = None,
                Ok(Ok(timeout)) => config.request_timeout = Some(timeout),
                _ => tracing::warn!(value = %raw, "Invalid SIDECAR_REQUEST_TIMEOUT, using no timeout"),
            }
        }

        if let Some(raw) = lookup("SIDECAR_MAX_FRAME_BYTES") {
            match raw.parse::<usize>() {
                Ok(bytes) if bytes > 0 => config.max_frame_bytes = bytes,
                _ => tracing::warn!(
                    value = %raw,
                    default = DEFAULT_MAX_FRAME_BYTES,
                    "Invalid SIDECAR_MAX_FRAME_BYTES, using default"
                ),
            }
        }

        config
    }
}
