//! Dispatcher and connection configuration.
//!
//! ```toml
//! transport = "framed"              # framed, header
//!
//! [dispatcher]
//! allow_out_of_order_responses = false
//! task_timeout_ms = 30000           # omit to let handlers run unbounded
//! stall_warning_ms = 5000           # head-of-line wait before warning
//! drain_timeout_ms = 1000           # grace for running handlers after peer EOF
//! max_frame_size = 16777216         # 16MB
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::error::{Result, TransportError};
use crate::message::TransportType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Per-connection dispatch behaviour
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Honour requests that declare out-of-order response support.
    /// When false every response is released in request order.
    pub allow_out_of_order_responses: bool,
    /// Abandon a handler and close the connection after this long
    pub task_timeout_ms: Option<u64>,
    /// Warn once the oldest outstanding ordered request has waited this long
    pub stall_warning_ms: u64,
    /// How long handlers still running when the peer stops sending may take
    /// before the connection is torn down
    pub drain_timeout_ms: u64,
    /// Largest request or response frame accepted, in bytes
    pub max_frame_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            allow_out_of_order_responses: false,
            task_timeout_ms: None,
            stall_warning_ms: crate::DEFAULT_STALL_WARNING_MS,
            drain_timeout_ms: crate::DEFAULT_DRAIN_TIMEOUT_MS,
            max_frame_size: crate::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl DispatcherConfig {
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    pub fn stall_warning(&self) -> Duration {
        Duration::from_millis(self.stall_warning_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Reject values that would make the dispatcher unusable
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(TransportError::configuration(
                "max_frame_size must be greater than zero",
                Some("max_frame_size"),
            ));
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(TransportError::configuration(
                format!(
                    "max_frame_size {} does not fit a 4-byte length prefix",
                    self.max_frame_size
                ),
                Some("max_frame_size"),
            ));
        }
        if self.stall_warning_ms == 0 {
            return Err(TransportError::configuration(
                "stall_warning_ms must be greater than zero",
                Some("stall_warning_ms"),
            ));
        }
        if self.drain_timeout_ms == 0 {
            return Err(TransportError::configuration(
                "drain_timeout_ms must be greater than zero",
                Some("drain_timeout_ms"),
            ));
        }
        if self.task_timeout_ms == Some(0) {
            return Err(TransportError::configuration(
                "task_timeout_ms must be greater than zero when set",
                Some("task_timeout_ms"),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration for serving connections
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Framing style of accepted connections
    pub transport: TransportType,
    pub dispatcher: DispatcherConfig,
}

impl TransportConfig {
    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TransportError::configuration(
                format!("Failed to read config file {}: {}", path.display(), e),
                None,
            )
        })?;

        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.transport.is_length_prefixed() {
            return Err(TransportError::configuration(
                format!(
                    "{} transport needs a protocol-aware decoder and cannot be served directly",
                    self.transport
                ),
                Some("transport"),
            ));
        }
        self.dispatcher.validate()
    }
}
