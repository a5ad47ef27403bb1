//! Request Dispatcher
//!
//! Wires requests read off a connection to concurrently running handlers and
//! routes their responses back through the connection's
//! [`ResponseSequencer`].
//!
//! A [`Dispatcher`] is shared by all connections of a server. Each connection
//! gets its own [`ConnectionDispatcher`], which owns the sequencer and the
//! handler tasks spawned for that connection. Dropping or closing the
//! connection dispatcher aborts outstanding handlers and discards any
//! responses still waiting for an earlier one.

use crate::clock::{current_time_millis, elapsed_millis_since};
use crate::config::DispatcherConfig;
use crate::message::RpcMessage;
use crate::metrics::DispatchMetrics;
use crate::sequencer::{HeadOfLine, ResponseSequencer, ResponseSink};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, warn};

/// Application logic invoked for every request
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the response payload for `request`.
    ///
    /// Failures are encoded into the returned payload; the dispatcher releases
    /// error responses exactly like successful ones.
    async fn handle(&self, request: &RpcMessage) -> Bytes;
}

/// Why a connection was asked to close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request of the server application
    Requested,
    /// A handler ran past the configured task timeout
    TaskTimeout { sequence: u64, timeout_ms: u64 },
    /// A handler task panicked
    HandlerPanic,
    /// Writing responses to the peer failed
    WriterFailed,
}

/// One-shot request to close a connection, raised from any task.
///
/// The first reason recorded wins; later requests are ignored.
#[derive(Debug, Default)]
pub struct CloseSignal {
    requested: AtomicBool,
    reason: Mutex<Option<CloseReason>>,
    notify: Notify,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, reason: CloseReason) {
        let mut recorded = self.reason.lock();
        if recorded.is_none() {
            *recorded = Some(reason);
            self.requested.store(true, Ordering::Release);
            self.notify.notify_one();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// The reason given by the first close request, if any
    pub fn reason(&self) -> Option<CloseReason> {
        *self.reason.lock()
    }

    /// Resolve once a close has been requested
    pub async fn wait(&self) {
        while !self.is_requested() {
            self.notify.notified().await;
        }
    }
}

/// Sink wrapper that records release latency before forwarding
pub struct MeteredSink<S> {
    inner: S,
    metrics: DispatchMetrics,
}

impl<S: ResponseSink> ResponseSink for MeteredSink<S> {
    fn write(&self, response: RpcMessage) {
        let latency_ms = response
            .process_start_time_millis()
            .map(elapsed_millis_since);
        self.metrics.record_release(latency_ms);
        self.inner.write(response);
    }
}

/// Server-wide dispatcher shared by every connection
pub struct Dispatcher<H> {
    handler: Arc<H>,
    config: DispatcherConfig,
    metrics: DispatchMetrics,
}

impl<H: RequestHandler> Dispatcher<H> {
    pub fn new(handler: H, config: DispatcherConfig) -> Self {
        Self {
            handler: Arc::new(handler),
            config,
            metrics: DispatchMetrics::new(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    /// Create the per-connection dispatcher writing released responses to `sink`
    pub fn open_connection<S>(&self, sink: S) -> ConnectionDispatcher<H, S>
    where
        S: ResponseSink + 'static,
    {
        let sink = MeteredSink {
            inner: sink,
            metrics: self.metrics.clone(),
        };

        ConnectionDispatcher {
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            sequencer: Arc::new(ResponseSequencer::new(sink)),
            tasks: JoinSet::new(),
            close: Arc::new(CloseSignal::new()),
            last_stall_warned: None,
        }
    }
}

/// Dispatch state owned by exactly one connection
pub struct ConnectionDispatcher<H, S> {
    handler: Arc<H>,
    config: DispatcherConfig,
    metrics: DispatchMetrics,
    sequencer: Arc<ResponseSequencer<MeteredSink<S>>>,
    tasks: JoinSet<()>,
    close: Arc<CloseSignal>,
    last_stall_warned: Option<u64>,
}

impl<H, S> ConnectionDispatcher<H, S>
where
    H: RequestHandler,
    S: ResponseSink + 'static,
{
    /// Admit `request` and spawn its handler.
    ///
    /// Must be called from the connection's single reader, in wire order,
    /// inside a tokio runtime. Returns the assigned sequence number.
    pub fn dispatch(&mut self, request: RpcMessage) -> u64 {
        // A decoder may already have stamped the start of processing
        request.set_process_start_time_millis(current_time_millis());

        let request = if self.config.allow_out_of_order_responses {
            request
        } else {
            request.with_out_of_order_responses(false)
        };

        let sequence = self.sequencer.admit(&request);
        self.metrics.record_dispatch();

        let handler = Arc::clone(&self.handler);
        let sequencer = Arc::clone(&self.sequencer);
        let metrics = self.metrics.clone();
        let close = Arc::clone(&self.close);
        let task_timeout = self.config.task_timeout();

        self.tasks.spawn(async move {
            let factory = request.message_factory();

            let payload = match task_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, handler.handle(&request)).await {
                        Ok(payload) => payload,
                        Err(_) => {
                            metrics.record_task_timeout();
                            error!(
                                sequence,
                                timeout_ms = limit.as_millis() as u64,
                                "Request handler timed out, closing connection"
                            );
                            close.request(CloseReason::TaskTimeout {
                                sequence,
                                timeout_ms: limit.as_millis() as u64,
                            });
                            return;
                        }
                    }
                }
                None => handler.handle(&request).await,
            };

            let response = factory.create(payload);
            if let Some(started) = request.process_start_time_millis() {
                response.set_process_start_time_millis(started);
            }
            sequencer.complete(sequence, response);
        });

        sequence
    }

    /// Wait for the next handler task to finish.
    ///
    /// Returns `false` immediately when no tasks are running. Cancel safe.
    pub async fn join_next_task(&mut self) -> bool {
        match self.tasks.join_next().await {
            Some(result) => {
                self.observe_task(result);
                true
            }
            None => false,
        }
    }

    /// Wait until every spawned handler has finished or a close is requested
    pub async fn wait_idle(&mut self) {
        while !self.close.is_requested() && self.join_next_task().await {}
    }

    fn observe_task(&self, result: Result<(), JoinError>) {
        if let Err(err) = result {
            if err.is_panic() {
                self.metrics.record_handler_panic();
                error!(error = %err, "Request task panicked, closing connection");
                self.close.request(CloseReason::HandlerPanic);
            }
        }
    }

    /// Warn when the head-of-line request has been outstanding longer than
    /// the configured threshold.
    ///
    /// Returns the stalled head, if any. Each stalled sequence number is
    /// logged and counted once.
    pub fn check_stalls(&mut self) -> Option<HeadOfLine> {
        let head = self.sequencer.head_of_line()?;
        if head.waiting < self.config.stall_warning() {
            return None;
        }

        if self.last_stall_warned != Some(head.sequence) {
            self.last_stall_warned = Some(head.sequence);
            self.metrics.record_stall_warning();
            warn!(
                sequence = head.sequence,
                waiting_ms = head.waiting.as_millis() as u64,
                blocked = head.blocked,
                "Head-of-line request stalled, later responses are held back"
            );
        }
        Some(head)
    }

    /// Abort outstanding handlers and discard buffered responses.
    ///
    /// Returns the number of completed responses that were never written.
    pub async fn close(&mut self) -> usize {
        self.tasks.abort_all();
        while let Some(result) = self.tasks.join_next().await {
            self.observe_task(result);
        }

        let discarded = self.sequencer.teardown();
        self.metrics.record_discarded(discarded);
        debug!(discarded, "Connection dispatcher closed");
        discarded
    }

    pub fn close_signal(&self) -> Arc<CloseSignal> {
        Arc::clone(&self.close)
    }

    /// Ask the connection driver to close this connection
    pub fn request_close(&self) {
        self.close.request(CloseReason::Requested);
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn sequencer(&self) -> &ResponseSequencer<MeteredSink<S>> {
        &self.sequencer
    }
}

impl<H, S> Drop for ConnectionDispatcher<H, S> {
    fn drop(&mut self) {
        // The JoinSet aborts its tasks on drop; release buffered responses too
        self.tasks.abort_all();
        let discarded = self.sequencer.teardown();
        self.metrics.record_discarded(discarded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TransportType;
    use crate::sequencer::ChannelSink;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    /// Echoes the request, waiting first on a gate if one was registered for it
    #[derive(Default)]
    struct GatedHandler {
        gates: Mutex<HashMap<Bytes, oneshot::Receiver<()>>>,
    }

    impl GatedHandler {
        fn gate(&self, payload: &'static str) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().insert(Bytes::from_static(payload.as_bytes()), rx);
            tx
        }
    }

    #[async_trait]
    impl RequestHandler for GatedHandler {
        async fn handle(&self, request: &RpcMessage) -> Bytes {
            let gate = self.gates.lock().remove(request.payload());
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if request.payload().as_ref() == b"boom" {
                panic!("handler exploded");
            }
            Bytes::from(format!(
                "re:{}",
                String::from_utf8_lossy(request.payload())
            ))
        }
    }

    fn request(payload: &'static str) -> RpcMessage {
        RpcMessage::new(Bytes::from_static(payload.as_bytes()), TransportType::Framed)
    }

    fn unordered(payload: &'static str) -> RpcMessage {
        request(payload).with_out_of_order_responses(true)
    }

    async fn next_label(rx: &mut mpsc::UnboundedReceiver<RpcMessage>) -> String {
        let response = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("response within deadline")
            .expect("sink still open");
        String::from_utf8_lossy(response.payload()).into_owned()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn dispatcher(
        config: DispatcherConfig,
    ) -> (Dispatcher<GatedHandler>, Vec<oneshot::Sender<()>>) {
        let handler = GatedHandler::default();
        let gates = vec![handler.gate("a"), handler.gate("b"), handler.gate("c")];
        (Dispatcher::new(handler, config), gates)
    }

    #[tokio::test]
    async fn test_responses_follow_request_order() {
        let (dispatcher, mut gates) = dispatcher(DispatcherConfig::default());
        let (sink, mut rx) = ChannelSink::new();
        let mut connection = dispatcher.open_connection(sink);

        assert_eq!(connection.dispatch(request("a")), 0);
        assert_eq!(connection.dispatch(request("b")), 1);
        assert_eq!(connection.dispatch(request("c")), 2);

        let gate_c = gates.pop().unwrap();
        let gate_b = gates.pop().unwrap();
        let gate_a = gates.pop().unwrap();

        gate_c.send(()).unwrap();
        gate_b.send(()).unwrap();
        wait_until(|| connection.sequencer().stats().pending == 2).await;
        assert!(rx.try_recv().is_err());

        gate_a.send(()).unwrap();
        assert_eq!(next_label(&mut rx).await, "re:a");
        assert_eq!(next_label(&mut rx).await, "re:b");
        assert_eq!(next_label(&mut rx).await, "re:c");

        connection.wait_idle().await;
        let snapshot = dispatcher.metrics().snapshot();
        assert_eq!(snapshot.requests_dispatched, 3);
        assert_eq!(snapshot.responses_released, 3);
    }

    #[tokio::test]
    async fn test_out_of_order_request_released_immediately_when_allowed() {
        let config = DispatcherConfig {
            allow_out_of_order_responses: true,
            ..Default::default()
        };
        let (dispatcher, mut gates) = dispatcher(config);
        let (sink, mut rx) = ChannelSink::new();
        let mut connection = dispatcher.open_connection(sink);

        connection.dispatch(request("a"));
        connection.dispatch(unordered("x"));

        assert_eq!(next_label(&mut rx).await, "re:x");

        gates.remove(0).send(()).unwrap();
        assert_eq!(next_label(&mut rx).await, "re:a");
        assert_eq!(connection.sequencer().stats().released_out_of_order, 1);
    }

    #[tokio::test]
    async fn test_out_of_order_declaration_ignored_by_default() {
        let (dispatcher, mut gates) = dispatcher(DispatcherConfig::default());
        let (sink, mut rx) = ChannelSink::new();
        let mut connection = dispatcher.open_connection(sink);

        connection.dispatch(request("a"));
        connection.dispatch(unordered("x"));

        wait_until(|| connection.sequencer().stats().pending == 1).await;
        assert!(rx.try_recv().is_err());

        gates.remove(0).send(()).unwrap();
        assert_eq!(next_label(&mut rx).await, "re:a");
        assert_eq!(next_label(&mut rx).await, "re:x");
    }

    #[tokio::test]
    async fn test_responses_carry_process_start_time() {
        let (dispatcher, _gates) = dispatcher(DispatcherConfig::default());
        let (sink, mut rx) = ChannelSink::new();
        let mut connection = dispatcher.open_connection(sink);

        let before = current_time_millis();
        connection.dispatch(request("plain"));

        let response = rx.recv().await.unwrap();
        assert!(response.process_start_time_millis().unwrap() >= before);
        assert_eq!(response.transport_type(), TransportType::Framed);
    }

    #[tokio::test]
    async fn test_task_timeout_requests_close() {
        let config = DispatcherConfig {
            task_timeout_ms: Some(20),
            ..Default::default()
        };
        let (dispatcher, _gates) = dispatcher(config);
        let (sink, _rx) = ChannelSink::new();
        let mut connection = dispatcher.open_connection(sink);

        connection.dispatch(request("a"));

        let close = connection.close_signal();
        tokio::time::timeout(Duration::from_secs(2), close.wait())
            .await
            .expect("close requested after timeout");
        assert_eq!(
            close.reason(),
            Some(CloseReason::TaskTimeout {
                sequence: 0,
                timeout_ms: 20,
            })
        );
        assert_eq!(dispatcher.metrics().snapshot().task_timeouts, 1);
    }

    #[tokio::test]
    async fn test_stall_is_reported_once_per_head() {
        let config = DispatcherConfig {
            stall_warning_ms: 10,
            ..Default::default()
        };
        let (dispatcher, _gates) = dispatcher(config);
        let (sink, _rx) = ChannelSink::new();
        let mut connection = dispatcher.open_connection(sink);

        connection.dispatch(request("a"));
        connection.dispatch(request("plain"));
        wait_until(|| connection.sequencer().stats().pending == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let head = connection.check_stalls().unwrap();
        assert_eq!(head.sequence, 0);
        assert_eq!(head.blocked, 1);

        assert!(connection.check_stalls().is_some());
        assert_eq!(dispatcher.metrics().snapshot().stall_warnings, 1);
    }

    #[tokio::test]
    async fn test_close_discards_blocked_responses() {
        let (dispatcher, _gates) = dispatcher(DispatcherConfig::default());
        let (sink, mut rx) = ChannelSink::new();
        let mut connection = dispatcher.open_connection(sink);

        connection.dispatch(request("a"));
        connection.dispatch(request("plain"));
        wait_until(|| connection.sequencer().stats().pending == 1).await;

        assert_eq!(connection.close().await, 1);
        assert_eq!(connection.running_tasks(), 0);
        assert!(connection.sequencer().is_closed());

        drop(connection);
        assert!(rx.recv().await.is_none());
        assert_eq!(dispatcher.metrics().snapshot().responses_discarded, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_requests_close() {
        let (dispatcher, _gates) = dispatcher(DispatcherConfig::default());
        let (sink, _rx) = ChannelSink::new();
        let mut connection = dispatcher.open_connection(sink);

        connection.dispatch(request("boom"));
        connection.wait_idle().await;

        assert_eq!(
            connection.close_signal().reason(),
            Some(CloseReason::HandlerPanic)
        );
        assert_eq!(dispatcher.metrics().snapshot().handler_panics, 1);
    }

    #[tokio::test]
    async fn test_explicit_close_keeps_first_reason() {
        let (dispatcher, _gates) = dispatcher(DispatcherConfig::default());
        let (sink, _rx) = ChannelSink::new();
        let connection = dispatcher.open_connection(sink);

        connection.request_close();
        connection.close_signal().request(CloseReason::HandlerPanic);

        assert_eq!(connection.close_signal().reason(), Some(CloseReason::Requested));
    }

    #[tokio::test]
    async fn test_close_signal_wakes_waiter() {
        let signal = Arc::new(CloseSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait().await })
        };

        signal.request(CloseReason::WriterFailed);
        signal.request(CloseReason::Requested);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.reason(), Some(CloseReason::WriterFailed));
    }
}
