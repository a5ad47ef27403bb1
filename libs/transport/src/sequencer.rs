//! Response Sequencer
//!
//! Releases responses to a connection's write path in the order their
//! requests were admitted, no matter which order the handlers finish in.
//!
//! ```text
//! admit:     req#0  req#1  req#2  req#3        (single reader, wire order)
//! complete:         #2     #0     #3     #1    (any order, any task)
//!
//! pending:   {2}    {2}    {2,3}  {}
//! written:          #0            #1 #2 #3
//! ```
//!
//! Each completion inserts into the pending buffer and then drains every
//! contiguous response starting at the next expected sequence number. A
//! handler that never completes therefore blocks every later ordered response
//! on the connection (head-of-line blocking); [`ResponseSequencer::head_of_line`]
//! exposes that condition so the dispatcher can surface it.
//!
//! Requests that declared out-of-order support bypass the buffer entirely.
//! Their sequence numbers are recorded as skippable at admission so the drain
//! steps over them instead of waiting for a response that never enters the
//! buffer.
//!
//! All state sits behind one mutex, making insert-then-drain atomic with
//! respect to concurrent completions. Ordered writes happen while the lock is
//! held, so the sink must never block.

use crate::message::RpcMessage;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Write path for released responses.
///
/// Called with the sequencer lock held for ordered responses; implementations
/// must hand the response off without blocking.
pub trait ResponseSink: Send + Sync {
    fn write(&self, response: RpcMessage);
}

impl<F> ResponseSink for F
where
    F: Fn(RpcMessage) + Send + Sync,
{
    fn write(&self, response: RpcMessage) {
        self(response)
    }
}

/// Sink that forwards released responses to a writer task
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RpcMessage>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RpcMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ResponseSink for ChannelSink {
    fn write(&self, response: RpcMessage) {
        if let Err(mpsc::error::SendError(response)) = self.tx.send(response) {
            debug!(
                bytes = response.payload().len(),
                "Writer gone, dropping released response"
            );
        }
    }
}

/// The oldest ordered request still being handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadOfLine {
    /// Sequence number every later ordered response is waiting on
    pub sequence: u64,
    /// Time since the request was admitted
    pub waiting: Duration,
    /// Completed responses buffered behind it
    pub blocked: usize,
}

/// Counters describing one sequencer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequencerStats {
    pub next_expected: u64,
    pub next_assignable: u64,
    pub in_flight: usize,
    pub pending: usize,
    pub peak_pending: usize,
    pub released_in_order: u64,
    pub released_out_of_order: u64,
    pub closed: bool,
}

struct InFlight {
    ordering_required: bool,
    admitted_at: Instant,
}

#[derive(Default)]
struct SequencerState {
    next_expected: u64,
    next_assignable: u64,
    /// Admitted but not yet completed
    in_flight: HashMap<u64, InFlight>,
    /// Completed ordered responses waiting for earlier ones
    pending: HashMap<u64, RpcMessage>,
    /// Out-of-order sequence numbers the drain has not stepped over yet
    unordered: HashSet<u64>,
    peak_pending: usize,
    released_in_order: u64,
    released_out_of_order: u64,
    closed: bool,
}

/// Per-connection response ordering
pub struct ResponseSequencer<S> {
    state: Mutex<SequencerState>,
    sink: S,
}

impl<S: ResponseSink> ResponseSequencer<S> {
    pub fn new(sink: S) -> Self {
        Self {
            state: Mutex::new(SequencerState::default()),
            sink,
        }
    }

    /// Assign the next sequence number to `request`.
    ///
    /// Must be called from the connection's reader in wire order, before
    /// handling of the request begins. Never fails; after teardown the number
    /// is still assigned but not tracked.
    ///
    /// # Panics
    ///
    /// Panics if `request` was already admitted.
    pub fn admit(&self, request: &RpcMessage) -> u64 {
        let mut state = self.state.lock();

        let sequence = state.next_assignable;
        state.next_assignable += 1;

        assert!(
            request.assign_sequence_number(sequence),
            "request already admitted as sequence {:?}",
            request.sequence_number()
        );

        if state.closed {
            return sequence;
        }

        let ordering_required = request.is_ordered_responses_required();
        state.in_flight.insert(
            sequence,
            InFlight {
                ordering_required,
                admitted_at: Instant::now(),
            },
        );

        if !ordering_required {
            state.unordered.insert(sequence);
            // Nothing can be written here, but the drain may step over `sequence`
            self.drain(&mut state);
        }

        trace!(sequence, ordering_required, "Admitted request");
        sequence
    }

    /// Hand the response for `sequence` to the sequencer.
    ///
    /// Out-of-order responses go straight to the sink. Ordered responses are
    /// buffered, then every contiguous completed response is released.
    /// Returns the number of responses written by this call; zero after
    /// teardown.
    ///
    /// # Panics
    ///
    /// Panics if `sequence` was never admitted or was already completed.
    pub fn complete(&self, sequence: u64, response: RpcMessage) -> usize {
        let mut state = self.state.lock();

        if state.closed {
            trace!(sequence, "Completion after teardown ignored");
            return 0;
        }

        let entry = match state.in_flight.remove(&sequence) {
            Some(entry) => entry,
            None if sequence < state.next_assignable => {
                panic!("sequence {sequence} completed more than once")
            }
            None => panic!(
                "sequence {sequence} was never admitted (next assignable {})",
                state.next_assignable
            ),
        };

        if !entry.ordering_required {
            state.released_out_of_order += 1;
            drop(state);

            trace!(sequence, "Releasing out-of-order response");
            self.sink.write(response);
            return 1;
        }

        state.pending.insert(sequence, response);
        state.peak_pending = state.peak_pending.max(state.pending.len());

        let released = self.drain(&mut state);
        if released > 0 {
            debug!(
                sequence,
                released,
                next_expected = state.next_expected,
                pending = state.pending.len(),
                "Drained ordered responses"
            );
        } else {
            trace!(
                sequence,
                waiting_on = state.next_expected,
                "Buffered response behind earlier request"
            );
        }
        released
    }

    /// Release every contiguous response starting at `next_expected`
    fn drain(&self, state: &mut SequencerState) -> usize {
        let mut released = 0;
        loop {
            let next = state.next_expected;
            if let Some(response) = state.pending.remove(&next) {
                self.sink.write(response);
                state.released_in_order += 1;
                released += 1;
            } else if !state.unordered.remove(&next) {
                break;
            }
            state.next_expected = next + 1;
        }
        released
    }
}

impl<S> ResponseSequencer<S> {
    /// Discard all per-connection state.
    ///
    /// Buffered responses are dropped without being written and later
    /// completions become no-ops. Returns the number of discarded responses.
    pub fn teardown(&self) -> usize {
        let mut state = self.state.lock();
        if state.closed {
            return 0;
        }

        state.closed = true;
        let discarded = state.pending.len();
        let abandoned = state.in_flight.len();
        state.pending.clear();
        state.in_flight.clear();
        state.unordered.clear();

        if discarded > 0 {
            warn!(
                discarded,
                abandoned,
                next_expected = state.next_expected,
                "Sequencer torn down with buffered responses"
            );
        } else {
            debug!(abandoned, "Sequencer torn down");
        }
        discarded
    }

    /// The ordered request currently holding up the write path, if any
    pub fn head_of_line(&self) -> Option<HeadOfLine> {
        let state = self.state.lock();
        if state.closed {
            return None;
        }

        let entry = state.in_flight.get(&state.next_expected)?;
        Some(HeadOfLine {
            sequence: state.next_expected,
            waiting: entry.admitted_at.elapsed(),
            blocked: state.pending.len(),
        })
    }

    pub fn next_expected_sequence(&self) -> u64 {
        self.state.lock().next_expected
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> SequencerStats {
        let state = self.state.lock();
        SequencerStats {
            next_expected: state.next_expected,
            next_assignable: state.next_assignable,
            in_flight: state.in_flight.len(),
            pending: state.pending.len(),
            peak_pending: state.peak_pending,
            released_in_order: state.released_in_order,
            released_out_of_order: state.released_out_of_order,
            closed: state.closed,
        }
    }
}
