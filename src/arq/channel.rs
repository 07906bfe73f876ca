use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use anyhow::bail;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};
use crate::arq::frame::ArqFrame;
use crate::arq::link::{Link, UdpLink};
use crate::arq::session::ArqSession;
use crate::arq::write_budget::WriteBudget;
use crate::channel::{ChannelFactory, MessageDispatcher, RetryableChannel, WriteCompleter, WriteCompletion};
use crate::config::ChannelConfig;
use crate::error::ChannelError;

enum Command {
    Send { payload: Bytes, completion: WriteCompleter },
    SendUnsequenced(Bytes),
    Shutdown,
}

/// Parts that are moved into the driver task when the channel is started
struct Unstarted<L> {
    link: L,
    commands: mpsc::UnboundedReceiver<Command>,
}

/// A [RetryableChannel] that runs stop-and-wait ARQ over a [Link].
///
/// All protocol state lives in an [ArqSession] that is owned by a single driver task. The
///  driver multiplexes commands from this handle, frames from the link and the retransmission
///  timer; nothing else touches the session, and the handle talks to it through a command queue.
///
/// The channel closes for good when the link fails or closes, or when it is shut down. Pending
///  writes fail with [ChannelError::ChannelClosed] at that point. There is no reconnect at this
///  level - replacing a dead channel is a supervisor's job.
pub struct ArqChannel<L: Link> {
    config: Arc<ChannelConfig>,
    peer_addr: SocketAddr,
    dispatcher: Arc<dyn MessageDispatcher>,
    commands: mpsc::UnboundedSender<Command>,
    unstarted: Mutex<Option<Unstarted<L>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    write_budget: Arc<WriteBudget>,
    closed: Arc<watch::Sender<bool>>,
}

impl<L: Link> ArqChannel<L> {
    pub fn new(config: Arc<ChannelConfig>, link: L, dispatcher: Arc<dyn MessageDispatcher>) -> anyhow::Result<ArqChannel<L>> {
        config.validate()?;

        let (commands, command_receiver) = mpsc::unbounded_channel();
        let write_budget = Arc::new(WriteBudget::from_config(&config));

        Ok(ArqChannel {
            peer_addr: link.peer_addr(),
            config,
            dispatcher,
            commands,
            unstarted: Mutex::new(Some(Unstarted {
                link,
                commands: command_receiver,
            })),
            driver: Mutex::new(None),
            write_budget,
            closed: Arc::new(watch::Sender::new(false)),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Sends a message outside of ARQ: it is neither acknowledged nor retransmitted, and it
    ///  may overtake reliable messages that are waiting for an ACK.
    pub fn send_unsequenced(&self, msg: Bytes) -> Result<(), ChannelError> {
        self.check_payload_len(&msg)?;
        self.commands.send(Command::SendUnsequenced(msg))
            .map_err(|_| ChannelError::ChannelClosed)
    }

    pub fn write_budget(&self) -> &WriteBudget {
        &self.write_budget
    }

    fn check_payload_len(&self, msg: &[u8]) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::ChannelClosed);
        }
        let max = self.config.max_payload_len();
        if msg.len() > max {
            return Err(ChannelError::MessageTooLarge { len: msg.len(), max });
        }
        Ok(())
    }

    fn take_unstarted(&self) -> Option<Unstarted<L>> {
        self.unstarted.lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

#[async_trait]
impl<L: Link> RetryableChannel for ArqChannel<L> {
    async fn start(&self) -> anyhow::Result<()> {
        let Some(unstarted) = self.take_unstarted() else {
            bail!("channel to {:?} was started before", self.peer_addr);
        };
        debug!("starting ARQ channel to {:?}", self.peer_addr);

        let session = ArqSession::new(&self.config, self.write_budget.clone());
        let driver = ArqDriver {
            session,
            link: unstarted.link,
            commands: unstarted.commands,
            dispatcher: self.dispatcher.clone(),
            write_budget: self.write_budget.clone(),
            closed: self.closed.clone(),
        };

        let handle = tokio::spawn(driver.run());
        *self.driver.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(unstarted) = self.take_unstarted() {
            // never started
            unstarted.link.close().await;
            self.closed.send_replace(true);
            return Ok(());
        }

        let _ = self.commands.send(Command::Shutdown);
        self.closed().await;
        Ok(())
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        // NB: the sender is owned by `self`, so this can not fail
        let _ = closed.wait_for(|&is_closed| is_closed).await;
    }

    fn send(&self, msg: Bytes) -> Result<WriteCompletion, ChannelError> {
        self.check_payload_len(&msg)?;

        let len = msg.len();
        self.write_budget.reserve(len);

        let (completer, completion) = WriteCompletion::new();
        if self.commands.send(Command::Send { payload: msg, completion: completer }).is_err() {
            self.write_budget.release(len);
            return Err(ChannelError::ChannelClosed);
        }
        Ok(completion)
    }

    async fn receive(&self, sender: SocketAddr, msg_buf: &[u8]) {
        self.dispatcher.on_message(sender, msg_buf).await;
    }

    fn accept(&self, recipient: SocketAddr) -> bool {
        !self.is_closed() && recipient == self.peer_addr
    }

    fn is_writable(&self) -> bool {
        !self.is_closed() && self.write_budget.is_writable()
    }
}

struct ArqDriver<L: Link> {
    session: ArqSession,
    link: L,
    commands: mpsc::UnboundedReceiver<Command>,
    dispatcher: Arc<dyn MessageDispatcher>,
    write_budget: Arc<WriteBudget>,
    closed: Arc<watch::Sender<bool>>,
}

impl<L: Link> ArqDriver<L> {
    async fn run(mut self) {
        let peer_addr = self.link.peer_addr();
        info!("ARQ channel to {:?} is active", peer_addr);

        loop {
            let retransmit_deadline = self.session.retransmit_deadline();

            select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Send { payload, completion }) => {
                            self.session.enqueue(payload, completion, Instant::now());
                        }
                        Some(Command::SendUnsequenced(payload)) => {
                            self.session.send_unsequenced(payload);
                        }
                        Some(Command::Shutdown) | None => {
                            debug!("shutting down ARQ channel to {:?}", peer_addr);
                            break;
                        }
                    }
                }
                received = self.link.recv_frame() => {
                    match received {
                        Ok(Some(mut buf)) => {
                            match ArqFrame::deser(&mut buf) {
                                Ok(frame) => {
                                    trace!("received {:?} from {:?}", frame, peer_addr);
                                    if let Some(payload) = self.session.on_frame_received(frame, Instant::now()) {
                                        self.dispatcher.on_message(peer_addr, &payload).await;
                                    }
                                }
                                Err(e) => {
                                    warn!("received unparseable frame from {:?} - dropping: {}", peer_addr, e);
                                }
                            }
                        }
                        Ok(None) => {
                            info!("link to {:?} was closed", peer_addr);
                            break;
                        }
                        Err(e) => {
                            error!("link to {:?} failed: {}", peer_addr, e);
                            break;
                        }
                    }
                }
                _ = sleep_until(retransmit_deadline.unwrap_or_else(Instant::now)), if retransmit_deadline.is_some() => {
                    self.session.on_flush_tick(Instant::now());
                }
            }

            self.write_outbox().await;
        }

        self.link.close().await;
        info!("ARQ channel to {:?} is closed", peer_addr);
    }

    async fn write_outbox(&mut self) {
        for frame in self.session.take_outbox() {
            let mut buf = BytesMut::with_capacity(frame.serialized_len());
            frame.ser(&mut buf);

            trace!("sending {:?} to {:?}", frame, self.link.peer_addr());
            //NB: a failed write is covered by retransmission, or it shows up on the receive side
            if let Err(e) = self.link.send_frame(&buf).await {
                warn!("unable to send {:?} to {:?}: {}", frame, self.link.peer_addr(), e);
            }
        }
    }

    /// commands that were queued after the driver decided to stop
    fn fail_queued_commands(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Send { payload, completion } = command {
                self.write_budget.release(payload.len());
                let _ = completion.send(Err(ChannelError::ChannelClosed));
            }
        }
    }
}

/// Closing the channel happens on drop, so that a driver that panics (e.g. in a
///  [MessageDispatcher]) still fails its writes and fires the close signal.
impl<L: Link> Drop for ArqDriver<L> {
    fn drop(&mut self) {
        self.session.close();
        self.fail_queued_commands();
        self.closed.send_replace(true);
    }
}

/// Creates [ArqChannel]s over fresh [UdpLink]s to a fixed peer
pub struct UdpChannelFactory {
    pub config: Arc<ChannelConfig>,
    pub self_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub dispatcher: Arc<dyn MessageDispatcher>,
}

#[async_trait]
impl ChannelFactory for UdpChannelFactory {
    type Channel = ArqChannel<UdpLink>;

    async fn create_channel(&self) -> anyhow::Result<ArqChannel<UdpLink>> {
        self.config.validate()?;
        let link = UdpLink::connect(self.self_addr, self.peer_addr, self.config.max_frame_len).await?;
        ArqChannel::new(self.config.clone(), link, self.dispatcher.clone())
    }
}
