//! RPC Message Interface
//!
//! A [`RpcMessage`] is one request or response unit flowing through a
//! connection. The payload and transport classification are fixed at
//! construction; the remaining metadata is write-once:
//!
//! - the process-start timestamp, stamped by whichever component begins
//!   processing and read for latency accounting only
//! - the sequence number, stamped by the
//!   [`ResponseSequencer`](crate::sequencer::ResponseSequencer) at admission
//!
//! Responses are built through a [`MessageFactory`] obtained from the request,
//! so dispatch code never needs to know how the request was framed.

use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server transport framing style a message arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    /// Raw protocol bytes with no outer frame
    Unframed,
    /// 4-byte big-endian length prefix followed by the payload
    Framed,
    /// Length-prefixed frame carrying an extended header
    Header,
}

impl TransportType {
    /// Whether messages on this transport carry a length prefix
    pub fn is_length_prefixed(self) -> bool {
        match self {
            TransportType::Framed | TransportType::Header => true,
            TransportType::Unframed => false,
        }
    }

    /// Stable name used in logs and configuration
    pub fn as_str(self) -> &'static str {
        match self {
            TransportType::Unframed => "unframed",
            TransportType::Framed => "framed",
            TransportType::Header => "header",
        }
    }
}

impl Default for TransportType {
    fn default() -> Self {
        Self::Framed
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request or response travelling over one connection
#[derive(Debug)]
pub struct RpcMessage {
    payload: Bytes,
    transport_type: TransportType,
    /// Set by the protocol layer when the client understands out-of-order responses
    accepts_out_of_order: bool,
    process_start_millis: OnceCell<u64>,
    sequence: OnceCell<u64>,
}

impl RpcMessage {
    /// Create a new message
    pub fn new(payload: impl Into<Bytes>, transport_type: TransportType) -> Self {
        Self {
            payload: payload.into(),
            transport_type,
            accepts_out_of_order: false,
            process_start_millis: OnceCell::new(),
            sequence: OnceCell::new(),
        }
    }

    /// Record whether the client declared that it accepts out-of-order responses
    pub fn with_out_of_order_responses(mut self, accepted: bool) -> Self {
        self.accepts_out_of_order = accepted;
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    /// Whether the client declared support for out-of-order responses
    pub fn accepts_out_of_order_responses(&self) -> bool {
        self.accepts_out_of_order
    }

    /// Standard clients require responses in request order. Ordering is
    /// relaxed only when the protocol layer marked the request otherwise.
    pub fn is_ordered_responses_required(&self) -> bool {
        !self.accepts_out_of_order
    }

    /// Time at which processing of this message began, if stamped
    pub fn process_start_time_millis(&self) -> Option<u64> {
        self.process_start_millis.get().copied()
    }

    /// Stamp the process-start time. Returns `false` and leaves the existing
    /// value untouched if the message was already stamped.
    pub fn set_process_start_time_millis(&self, millis: u64) -> bool {
        self.process_start_millis.set(millis).is_ok()
    }

    /// Sequence number assigned at admission, if admitted
    pub fn sequence_number(&self) -> Option<u64> {
        self.sequence.get().copied()
    }

    pub(crate) fn assign_sequence_number(&self, sequence: u64) -> bool {
        self.sequence.set(sequence).is_ok()
    }

    /// Factory for building responses shaped like this message
    pub fn message_factory(&self) -> MessageFactory {
        MessageFactory::new(self.transport_type)
    }
}

/// Builds messages that share a transport classification.
///
/// Obtained from a request via [`RpcMessage::message_factory`]; the factory
/// copies nothing but the transport type, so the messages it creates share no
/// state with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFactory {
    transport_type: TransportType,
}

impl MessageFactory {
    pub fn new(transport_type: TransportType) -> Self {
        Self { transport_type }
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    /// Create a fresh message carrying `payload`
    pub fn create(&self, payload: impl Into<Bytes>) -> RpcMessage {
        RpcMessage::new(payload, self.transport_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_accessors() {
        let msg = RpcMessage::new(Bytes::from_static(b"ping"), TransportType::Header);

        assert_eq!(msg.payload().as_ref(), b"ping");
        assert_eq!(msg.transport_type(), TransportType::Header);
        assert!(msg.is_ordered_responses_required());
        assert_eq!(msg.sequence_number(), None);
        assert_eq!(msg.process_start_time_millis(), None);
    }

    #[test]
    fn test_out_of_order_declaration() {
        let msg = RpcMessage::new(b"x".to_vec(), TransportType::Framed)
            .with_out_of_order_responses(true);

        assert!(msg.accepts_out_of_order_responses());
        assert!(!msg.is_ordered_responses_required());
    }

    #[test]
    fn test_process_start_is_write_once() {
        let msg = RpcMessage::new(Bytes::new(), TransportType::Framed);

        assert!(msg.set_process_start_time_millis(1_000));
        assert!(!msg.set_process_start_time_millis(2_000));
        assert_eq!(msg.process_start_time_millis(), Some(1_000));
        assert_eq!(msg.process_start_time_millis(), Some(1_000));
    }

    #[test]
    fn test_sequence_is_write_once() {
        let msg = RpcMessage::new(Bytes::new(), TransportType::Framed);

        assert!(msg.assign_sequence_number(7));
        assert!(!msg.assign_sequence_number(8));
        assert_eq!(msg.sequence_number(), Some(7));
    }

    #[test]
    fn test_factory_preserves_transport_type() {
        for transport in [
            TransportType::Unframed,
            TransportType::Framed,
            TransportType::Header,
        ] {
            let request = RpcMessage::new(b"request".to_vec(), transport);
            let response = request.message_factory().create(b"response".to_vec());

            assert_eq!(response.transport_type(), transport);
            assert_eq!(response.payload().as_ref(), b"response");
        }
    }

    #[test]
    fn test_factory_output_is_independent_of_request() {
        let request = RpcMessage::new(b"request".to_vec(), TransportType::Framed)
            .with_out_of_order_responses(true);
        request.set_process_start_time_millis(42);
        request.assign_sequence_number(3);

        let response = request.message_factory().create(Bytes::from_static(b"ok"));

        assert_eq!(response.sequence_number(), None);
        assert_eq!(response.process_start_time_millis(), None);
        assert!(response.is_ordered_responses_required());

        // Stamping the response must not leak back into the request
        response.set_process_start_time_millis(99);
        assert_eq!(request.process_start_time_millis(), Some(42));
    }

    #[test]
    fn test_transport_type_framing() {
        assert!(TransportType::Framed.is_length_prefixed());
        assert!(TransportType::Header.is_length_prefixed());
        assert!(!TransportType::Unframed.is_length_prefixed());
        assert_eq!(TransportType::default(), TransportType::Framed);
        assert_eq!(TransportType::Header.to_string(), "header");
    }
}
