use std::io::ErrorKind;
use std::net::SocketAddr;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// An unreliable duplex link that carries whole frames: frames may get lost, but they are
///  never split or merged.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Link: Send + Sync + 'static {
    fn peer_addr(&self) -> SocketAddr;

    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()>;

    /// Returns `None` once the link is closed.
    ///
    /// NB: This must be cancel safe - it is polled in a `select!` loop
    async fn recv_frame(&self) -> anyhow::Result<Option<Bytes>>;

    async fn close(&self);
}

/// A [Link] over a connected UDP socket, one frame per datagram.
pub struct UdpLink {
    socket: UdpSocket,
    peer_addr: SocketAddr,
    max_frame_len: usize,
    closed: watch::Sender<bool>,
}

impl UdpLink {
    pub async fn connect(self_addr: SocketAddr, peer_addr: SocketAddr, max_frame_len: usize) -> anyhow::Result<UdpLink> {
        //TODO "don't fragment" flag
        let socket = UdpSocket::bind(self_addr).await?;
        socket.connect(peer_addr).await?;
        info!("bound UDP link {:?} -> {:?}", socket.local_addr()?, peer_addr);

        Ok(UdpLink {
            socket,
            peer_addr,
            max_frame_len,
            closed: watch::Sender::new(false),
        })
    }

    pub fn self_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Link for UdpLink {
    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        if *self.closed.borrow() {
            anyhow::bail!("link to {:?} is closed", self.peer_addr);
        }
        self.socket.send(frame).await?;
        Ok(())
    }

    async fn recv_frame(&self) -> anyhow::Result<Option<Bytes>> {
        let mut closed = self.closed.subscribe();

        loop {
            if *closed.borrow_and_update() {
                return Ok(None);
            }

            // one extra byte to detect datagrams that were truncated
            let mut buf = BytesMut::zeroed(self.max_frame_len + 1);
            select! {
                received = self.socket.recv(&mut buf) => {
                    let len = match received {
                        Ok(len) => len,
                        // ICMP 'port unreachable' for an earlier datagram: the peer is not up (yet)
                        Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                            debug!("peer {:?} is unreachable: {}", self.peer_addr, e);
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    };
                    if len > self.max_frame_len {
                        warn!("received datagram from {:?} exceeds the maximum frame length of {} bytes - skipping", self.peer_addr, self.max_frame_len);
                        continue;
                    }
                    buf.truncate(len);
                    return Ok(Some(buf.freeze()));
                }
                _ = closed.changed() => {
                    continue;
                }
            }
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}
