use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::oneshot;
use crate::error::ChannelError;

/// Upcall for application messages that arrive on a channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    /// This is awaited by the channel's receive loop, holding it up. Non-trivial work should
    ///  be offloaded by the implementation.
    async fn on_message(&self, sender: SocketAddr, msg_buf: &[u8]);
}

/// The capability every channel variant provides, regardless of the transport underneath it.
///
/// Implementations are expected to be usable from several threads at the same time: `send` and
///  `accept` are called by application code while the channel's own task drives its state.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RetryableChannel: Send + Sync + 'static {
    async fn start(&self) -> anyhow::Result<()>;

    async fn shutdown(&self) -> anyhow::Result<()>;

    /// resolves once the channel became unusable, for whatever reason
    async fn closed(&self);

    /// NB: This never blocks. The returned [WriteCompletion] resolves once the peer has
    ///  acknowledged the message, or fails if the channel closes first.
    fn send(&self, msg: Bytes) -> Result<WriteCompletion, ChannelError>;

    /// Hands an inbound application message to this channel's [MessageDispatcher]
    async fn receive(&self, sender: SocketAddr, msg_buf: &[u8]);

    /// can this channel currently route messages to the given recipient?
    fn accept(&self, recipient: SocketAddr) -> bool;

    /// `false` while the channel is closed or backed up with unacknowledged writes - producers
    ///  should hold off sending until this turns `true` again
    fn is_writable(&self) -> bool;
}

/// Creates fresh, not yet started channel instances - it is invoked once per retry attempt.
#[async_trait]
pub trait ChannelFactory: Send + Sync + 'static {
    type Channel: RetryableChannel;

    async fn create_channel(&self) -> anyhow::Result<Self::Channel>;
}

pub(crate) type WriteCompleter = oneshot::Sender<Result<(), ChannelError>>;

/// Handle for a single message written to a channel.
///
/// Dropping this handle abandons the write: if the message was not put on the wire yet, it is
///  discarded.
#[derive(Debug)]
pub struct WriteCompletion {
    receiver: oneshot::Receiver<Result<(), ChannelError>>,
}

impl WriteCompletion {
    pub(crate) fn new() -> (WriteCompleter, WriteCompletion) {
        let (sender, receiver) = oneshot::channel();
        (sender, WriteCompletion { receiver })
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<Result<(), ChannelError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ChannelError::ChannelClosed)),
        }
    }
}

impl Future for WriteCompletion {
    type Output = Result<(), ChannelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // the completer is dropped without a result only if the owning session went away
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ChannelError::ChannelClosed)))
    }
}
