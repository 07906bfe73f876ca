use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use clap_derive::Parser;
use overlay_channel::arq::channel::UdpChannelFactory;
use overlay_channel::channel::{MessageDispatcher, RetryableChannel};
use overlay_channel::config::ChannelConfig;
use overlay_channel::error::ChannelError;
use overlay_channel::supervisor::channel_supervisor::ChannelSupervisor;
use tokio::select;
use tracing::{info, warn, Level};

/// Start two of these with swapped addresses, e.g.
///  `udp_ping 127.0.0.1:9810 127.0.0.1:9811` and `udp_ping 127.0.0.1:9811 127.0.0.1:9810`
#[derive(Parser)]
struct Args {
    local_address: String,
    peer_address: String,

    #[clap(long, default_value_t = 1000)]
    interval_millis: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct PingLogger;

#[async_trait]
impl MessageDispatcher for PingLogger {
    async fn on_message(&self, sender: SocketAddr, msg_buf: &[u8]) {
        info!("received {:?} from {:?}", String::from_utf8_lossy(msg_buf), sender);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = ChannelConfig::new();
    config.validate()?;
    let config = Arc::new(config);

    let factory = UdpChannelFactory {
        config: config.clone(),
        self_addr: args.local_address.parse()?,
        peer_addr: args.peer_address.parse()?,
        dispatcher: Arc::new(PingLogger),
    };

    let supervisor = ChannelSupervisor::from_config(&config, factory)?;
    supervisor.start().await?;

    select! {
        result = send_pings(&supervisor, Duration::from_millis(args.interval_millis)) => { result }
        _ = tokio::signal::ctrl_c() => {
            supervisor.shutdown().await
        }
    }
}

async fn send_pings(channel: &impl RetryableChannel, interval: Duration) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(interval);

    for counter in 0u64.. {
        interval.tick().await;

        let msg = format!("ping #{}", counter);
        match channel.send(Bytes::from(msg.clone())) {
            Ok(completion) => {
                tokio::spawn(async move {
                    match completion.await {
                        Ok(()) => info!("{:?} was acknowledged", msg),
                        Err(e) => warn!("{:?} was lost: {}", msg, e),
                    }
                });
            }
            Err(e) if e.is_terminal() => return Err(e.into()),
            Err(ChannelError::NoChannelAvailable) => info!("no channel right now - skipping {:?}", msg),
            Err(e) => warn!("error sending {:?}: {}", msg, e),
        }
    }
    Ok(())
}
