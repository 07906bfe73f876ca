use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::arq::frame::{ArqFrame, SequenceBit};
use crate::arq::write_budget::WriteBudget;
use crate::channel::{WriteCompleter, WriteCompletion};
use crate::config::ChannelConfig;
use crate::error::ChannelError;

struct PendingWrite {
    payload: Bytes,
    completion: WriteCompleter,
    /// set on first transmission - from then on, the write is retransmitted until it is
    ///  acknowledged, even if its completion handle was dropped
    in_flight: bool,
}

/// Stop-and-wait ARQ (alternating-bit protocol) for one connection.
///
/// The session is a pure state machine: it does no I/O and keeps no timers of its own. Its
///  owner feeds it received frames and flush ticks, writes the frames it collects in its outbox
///  to the wire, and schedules the next flush tick at [ArqSession::retransmit_deadline]. All
///  of that happens from a single task, so there is no locking here.
///
/// Sending side: writes are queued in FIFO order, and only the head of the queue is ever on the
///  wire. It is tagged with the current outbound bit and retransmitted every `retry_timeout`
///  until an ACK arrives with a bit *different* from the outbound bit, i.e. the receiver moved
///  past it. The outbound bit flips exactly once per successful ACK.
///
/// Receiving side: a DATA frame carrying the expected bit is delivered and the expected bit
///  flips; any other DATA frame is a retransmission of something that was delivered already
///  (the ACK got lost) and is dropped. Either way, the receiver replies with an ACK carrying
///  the expected bit *after* that, which repairs lost ACKs without extra signalling.
pub struct ArqSession {
    retry_timeout: Duration,
    expected_inbound: SequenceBit,
    outbound: SequenceBit,
    pending_writes: VecDeque<PendingWrite>,
    last_write_attempt: Option<Instant>,
    retransmit_deadline: Option<Instant>,
    outbox: Vec<ArqFrame>,
    write_budget: Arc<WriteBudget>,
    is_closed: bool,
}

impl ArqSession {
    pub fn new(config: &ChannelConfig, write_budget: Arc<WriteBudget>) -> ArqSession {
        ArqSession {
            retry_timeout: config.retry_timeout,
            expected_inbound: config.initial_inbound_sequence_bit,
            outbound: config.initial_outbound_sequence_bit,
            pending_writes: VecDeque::new(),
            last_write_attempt: None,
            retransmit_deadline: None,
            outbox: Vec::new(),
            write_budget,
            is_closed: false,
        }
    }

    /// Queues a payload for reliable delivery, reserving its length in the write budget.
    pub fn send(&mut self, payload: Bytes, now: Instant) -> WriteCompletion {
        let (completer, completion) = WriteCompletion::new();
        self.write_budget.reserve(payload.len());
        self.enqueue(payload, completer, now);
        completion
    }

    /// NB: The caller is responsible for having reserved `payload.len()` in the write budget
    pub(crate) fn enqueue(&mut self, payload: Bytes, completion: WriteCompleter, now: Instant) {
        if self.is_closed {
            self.write_budget.release(payload.len());
            let _ = completion.send(Err(ChannelError::ChannelClosed));
            return;
        }

        trace!("queueing {} bytes, {} writes pending", payload.len(), self.pending_writes.len());
        self.pending_writes.push_back(PendingWrite {
            payload,
            completion,
            in_flight: false,
        });
        self.on_flush_tick(now);
    }

    /// Frames that bypass ARQ: no sequence bit, no acknowledgement, no retransmission
    pub fn send_unsequenced(&mut self, payload: Bytes) {
        if !self.is_closed {
            self.outbox.push(ArqFrame::Unsequenced { payload });
        }
    }

    /// Returns the payload to be dispatched to the application, if any
    pub fn on_frame_received(&mut self, frame: ArqFrame, now: Instant) -> Option<Bytes> {
        if self.is_closed {
            return None;
        }

        match frame {
            ArqFrame::Data { bit, payload } => {
                let result = if bit == self.expected_inbound {
                    trace!("received expected DATA({:?}) - dispatching", bit);
                    self.expected_inbound.flip();
                    Some(payload)
                }
                else {
                    trace!("received DATA({:?}) while expecting {:?} - dropping duplicate", bit, self.expected_inbound);
                    None
                };

                self.outbox.push(ArqFrame::Ack { bit: self.expected_inbound });
                result
            }
            ArqFrame::Ack { bit } => {
                match self.outstanding() {
                    Some(outstanding) if outstanding != bit => {
                        trace!("received ACK({:?}) for DATA({:?})", bit, outstanding);
                        self.succeed_current_write();
                        self.on_flush_tick(now);
                    }
                    outstanding => {
                        trace!("received ACK({:?}) while outstanding is {:?} - ignoring", bit, outstanding);
                    }
                }
                None
            }
            ArqFrame::Unsequenced { payload } => Some(payload),
        }
    }

    /// (Re)sends the head of the queue if it was not sent yet or if its ACK is overdue.
    pub fn on_flush_tick(&mut self, now: Instant) {
        if self.is_closed {
            return;
        }

        self.discard_abandoned_writes();

        let Some(current) = self.pending_writes.front_mut() else {
            self.retransmit_deadline = None;
            return;
        };

        if let Some(last_write_attempt) = self.last_write_attempt {
            if now < last_write_attempt + self.retry_timeout {
                return;
            }
            debug!("no ACK for DATA({:?}) after {:?} - resending", self.outbound, now - last_write_attempt);
        }

        current.in_flight = true;
        self.outbox.push(ArqFrame::Data {
            bit: self.outbound,
            payload: current.payload.clone(),
        });
        self.last_write_attempt = Some(now);
        self.retransmit_deadline = Some(now + self.retry_timeout);
    }

    /// Fails all pending writes. The session ignores all further input after this.
    pub fn close(&mut self) {
        if self.is_closed {
            return;
        }
        self.is_closed = true;

        if !self.pending_writes.is_empty() {
            debug!("discarding {} pending writes", self.pending_writes.len());
        }
        for write in self.pending_writes.drain(..) {
            self.write_budget.release(write.payload.len());
            let _ = write.completion.send(Err(ChannelError::ChannelClosed));
        }
        self.last_write_attempt = None;
        self.retransmit_deadline = None;
        self.outbox.clear();
    }

    pub fn take_outbox(&mut self) -> Vec<ArqFrame> {
        std::mem::take(&mut self.outbox)
    }

    /// when the next flush tick is due, or `None` if nothing is waiting for an ACK
    pub fn retransmit_deadline(&self) -> Option<Instant> {
        self.retransmit_deadline
    }

    pub fn num_pending_writes(&self) -> usize {
        self.pending_writes.len()
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    /// the bit of the DATA frame that is on the wire waiting for an ACK, if any
    fn outstanding(&self) -> Option<SequenceBit> {
        match self.pending_writes.front() {
            Some(write) if write.in_flight => Some(self.outbound),
            _ => None,
        }
    }

    fn succeed_current_write(&mut self) {
        if let Some(write) = self.pending_writes.pop_front() {
            self.write_budget.release(write.payload.len());
            let _ = write.completion.send(Ok(()));
        }
        self.outbound.flip();

        self.last_write_attempt = None;
        self.retransmit_deadline = None;
    }

    fn discard_abandoned_writes(&mut self) {
        while let Some(write) = self.pending_writes.front() {
            if write.in_flight || !write.completion.is_closed() {
                break;
            }
            debug!("write of {} bytes was abandoned before it was sent - discarding", write.payload.len());
            self.write_budget.release(write.payload.len());
            self.pending_writes.pop_front();
        }
    }
}
