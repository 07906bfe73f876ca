//! Resilience layer for point-to-point channels of a P2P overlay.
//!
//! Two building blocks stack on top of an unreliable datagram link:
//! * [arq] makes a single channel reliable: stop-and-wait ARQ delivers every message exactly
//!   once and in order, retransmitting until the peer acknowledges it
//! * [supervisor] keeps a channel available: when the current channel dies, a replacement is
//!   created and started after a delay, within a retry budget
//!
//! Both are exposed through the same [channel::RetryableChannel] abstraction, so application
//!  code does not care whether it talks to a single channel or to a supervised one.

pub mod arq;
pub mod channel;
pub mod config;
pub mod error;
pub mod supervisor;

#[cfg(test)]
mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
