//! In-memory stand-ins for links, dispatchers and channel factories, for unit tests.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, watch};
use crate::arq::frame::ArqFrame;
use crate::arq::link::Link;
use crate::channel::{ChannelFactory, MessageDispatcher, RetryableChannel, WriteCompletion};
use crate::error::ChannelError;

/// the same number always gives the same address, different numbers give different addresses
pub fn test_addr(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), number))
}

type LossFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// Returns a loss filter for [MemoryLink::with_loss] that drops every n-th frame
pub fn drop_every_nth(n: usize) -> impl FnMut(&[u8]) -> bool + Send + 'static {
    let mut count = 0;
    move |_| {
        count += 1;
        count % n == 0
    }
}

/// Every frame that was sent through a [MemoryLink], including frames that got lost
#[derive(Clone, Default)]
pub struct FrameLog(Arc<Mutex<Vec<Bytes>>>);

impl FrameLog {
    pub fn frames(&self) -> Vec<ArqFrame> {
        self.0.lock().unwrap()
            .iter()
            .filter_map(|buf| ArqFrame::deser(&mut buf.clone()).ok())
            .collect()
    }
}

/// One end of an in-memory [Link]. Closing either end closes both.
pub struct MemoryLink {
    peer_addr: SocketAddr,
    outgoing: mpsc::UnboundedSender<Bytes>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: Arc<watch::Sender<bool>>,
    loss_filter: Mutex<Option<LossFilter>>,
    log: FrameLog,
}

/// `a` is the link as seen from `addr_a`, i.e. its peer is `addr_b`
pub fn memory_link_pair(addr_a: SocketAddr, addr_b: SocketAddr) -> (MemoryLink, MemoryLink) {
    let (a_to_b, b_from_a) = mpsc::unbounded_channel();
    let (b_to_a, a_from_b) = mpsc::unbounded_channel();
    let closed = Arc::new(watch::Sender::new(false));

    let a = MemoryLink {
        peer_addr: addr_b,
        outgoing: a_to_b,
        incoming: tokio::sync::Mutex::new(a_from_b),
        closed: closed.clone(),
        loss_filter: Mutex::new(None),
        log: FrameLog::default(),
    };
    let b = MemoryLink {
        peer_addr: addr_a,
        outgoing: b_to_a,
        incoming: tokio::sync::Mutex::new(b_from_a),
        closed,
        loss_filter: Mutex::new(None),
        log: FrameLog::default(),
    };
    (a, b)
}

impl MemoryLink {
    /// Frames sent through this end are lost if `filter` returns `true` for them
    pub fn with_loss(self, filter: impl FnMut(&[u8]) -> bool + Send + 'static) -> MemoryLink {
        *self.loss_filter.lock().unwrap() = Some(Box::new(filter));
        self
    }

    pub fn frame_log(&self) -> FrameLog {
        self.log.clone()
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        if *self.closed.borrow() {
            bail!("link is closed");
        }

        let frame = Bytes::copy_from_slice(frame);
        self.log.0.lock().unwrap().push(frame.clone());

        if let Some(filter) = self.loss_filter.lock().unwrap().as_mut() {
            if filter(&frame) {
                return Ok(());
            }
        }

        // the peer end was dropped: the frame is lost, which is what UDP would do as well
        let _ = self.outgoing.send(frame);
        Ok(())
    }

    async fn recv_frame(&self) -> anyhow::Result<Option<Bytes>> {
        let mut closed = self.closed.subscribe();
        let mut incoming = self.incoming.lock().await;
        select! {
            biased;
            _ = closed.wait_for(|&is_closed| is_closed) => Ok(None),
            frame = incoming.recv() => Ok(frame),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// Records all messages it receives, in order
pub struct RecordingDispatcher {
    messages: watch::Sender<Vec<(SocketAddr, Vec<u8>)>>,
}

impl Default for RecordingDispatcher {
    fn default() -> Self {
        RecordingDispatcher {
            messages: watch::Sender::new(Vec::new()),
        }
    }
}

impl RecordingDispatcher {
    pub fn messages(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.messages.borrow().clone()
    }

    pub async fn wait_for_messages(&self, num_messages: usize) {
        let _ = self.messages.subscribe()
            .wait_for(|messages| messages.len() >= num_messages)
            .await;
    }
}

#[async_trait]
impl MessageDispatcher for RecordingDispatcher {
    async fn on_message(&self, sender: SocketAddr, msg_buf: &[u8]) {
        self.messages.send_modify(|messages| messages.push((sender, msg_buf.to_vec())));
    }
}

/// Shared view of a [TestChannel], for checking on it or killing it from test code
pub struct TestChannelState {
    pub id: usize,
    peer_addr: SocketAddr,
    fail_start: bool,
    close_after_messages: Option<usize>,
    closed: watch::Sender<bool>,
    started: AtomicBool,
    shut_down: AtomicBool,
    sent: Mutex<Vec<Bytes>>,
}

impl TestChannelState {
    /// simulates the channel dying
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn was_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }
}

/// A [RetryableChannel] that acknowledges every message immediately
pub struct TestChannel {
    state: Arc<TestChannelState>,
}

impl TestChannel {
    pub fn id(&self) -> usize {
        self.state.id
    }
}

#[async_trait]
impl RetryableChannel for TestChannel {
    async fn start(&self) -> anyhow::Result<()> {
        if self.state.fail_start {
            bail!("channel #{} failed to start", self.state.id);
        }
        self.state.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.state.shut_down.store(true, Ordering::Release);
        self.state.close();
        Ok(())
    }

    async fn closed(&self) {
        let _ = self.state.closed.subscribe()
            .wait_for(|&is_closed| is_closed)
            .await;
    }

    fn send(&self, msg: Bytes) -> Result<WriteCompletion, ChannelError> {
        if self.state.is_closed() {
            return Err(ChannelError::ChannelClosed);
        }

        let num_sent = {
            let mut sent = self.state.sent.lock().unwrap();
            sent.push(msg);
            sent.len()
        };
        if Some(num_sent) == self.state.close_after_messages {
            self.state.close();
        }

        let (completer, completion) = WriteCompletion::new();
        let _ = completer.send(Ok(()));
        Ok(completion)
    }

    async fn receive(&self, _sender: SocketAddr, _msg_buf: &[u8]) {
    }

    fn accept(&self, recipient: SocketAddr) -> bool {
        !self.state.is_closed() && recipient == self.state.peer_addr
    }

    fn is_writable(&self) -> bool {
        !self.state.is_closed()
    }
}

/// Creates [TestChannel]s numbered 0, 1, 2, ... in creation order. Their peer is `test_addr(2)`.
#[derive(Default)]
pub struct TestChannelFactory {
    failing_starts: HashSet<usize>,
    fail_all_starts: bool,
    close_after_messages: Option<usize>,
    channels: Mutex<Vec<Arc<TestChannelState>>>,
}

impl TestChannelFactory {
    pub fn new() -> TestChannelFactory {
        Default::default()
    }

    /// channels with these ids fail in `start()`
    pub fn with_failing_starts(mut self, ids: impl IntoIterator<Item = usize>) -> TestChannelFactory {
        self.failing_starts.extend(ids);
        self
    }

    pub fn with_all_starts_failing(mut self) -> TestChannelFactory {
        self.fail_all_starts = true;
        self
    }

    /// every channel closes itself after it sent this many messages
    pub fn closing_after_messages(mut self, num_messages: usize) -> TestChannelFactory {
        self.close_after_messages = Some(num_messages);
        self
    }

    pub fn channels(&self) -> Vec<Arc<TestChannelState>> {
        self.channels.lock().unwrap().clone()
    }

    pub fn num_created(&self) -> usize {
        self.channels.lock().unwrap().len()
    }
}

#[async_trait]
impl ChannelFactory for Arc<TestChannelFactory> {
    type Channel = TestChannel;

    async fn create_channel(&self) -> anyhow::Result<TestChannel> {
        let mut channels = self.channels.lock().unwrap();
        let id = channels.len();
        let state = Arc::new(TestChannelState {
            id,
            peer_addr: test_addr(2),
            fail_start: self.fail_all_starts || self.failing_starts.contains(&id),
            close_after_messages: self.close_after_messages,
            closed: watch::Sender::new(false),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        });
        channels.push(state.clone());
        Ok(TestChannel { state })
    }
}
