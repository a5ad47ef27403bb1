//! Ordered Response Transport
//!
//! Response-ordering core for multiplexed RPC servers. Requests arriving on a
//! single connection are handled concurrently, but their responses are written
//! back in the order the requests arrived unless a request declared that its
//! client accepts out-of-order responses.
//!
//! Module layout, leaf-first:
//!
//! - [`message`]: transport-tagged messages and the factory that shapes responses
//! - [`sequencer`]: per-connection sequence numbering and in-order release
//! - [`dispatcher`]: spawns handlers and routes their responses to the sequencer
//! - [`connection`]: drives a length-prefixed byte stream through the dispatcher
//!
//! Framing codecs beyond a length prefix, connection acceptance, and admission
//! control belong to the surrounding server.

pub mod clock;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod metrics;
pub mod sequencer;

// Re-export commonly used types
pub use config::{DispatcherConfig, TransportConfig};
pub use connection::{serve_connection, ConnectionSummary, FrameReader};
pub use dispatcher::{CloseReason, CloseSignal, ConnectionDispatcher, Dispatcher, RequestHandler};
pub use error::{Result, TransportError};
pub use message::{MessageFactory, RpcMessage, TransportType};
pub use metrics::{DispatchMetrics, DispatchMetricsSnapshot};
pub use sequencer::{ChannelSink, HeadOfLine, ResponseSequencer, ResponseSink, SequencerStats};

// Constants for configuration
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024; // 64KB
pub const DEFAULT_STALL_WARNING_MS: u64 = 5_000;
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 1_000;
