use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// What to do when a write-single-register echo differs from the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum EchoPolicy {
    /// Log a warning and report success.
    #[default]
    Warn,
    /// Fail the call with [`ClientError::EchoMismatch`](crate::ClientError::EchoMismatch).
    Reject,
}

/// Connection settings, snapshotted by each `connect()`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub connect_timeout: Duration,
    /// Used when a call does not pass its own timeout.
    pub request_timeout: Duration,
    pub echo_policy: EchoPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
            echo_policy: EchoPolicy::Warn,
        }
    }
}

impl ClientSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::default().with_host(host).with_port(port)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_echo_policy(mut self, policy: EchoPolicy) -> Self {
        self.echo_policy = policy;
        self
    }
}
