//! Reliable delivery over an unreliable frame link, using stop-and-wait ARQ (the
//!  alternating-bit protocol).
//!
//! With only one DATA frame in flight, a single sequence bit is enough to tell a new frame from a
//!  retransmission. The price is throughput - one round trip per message.

pub mod channel;
pub mod frame;
pub mod link;
pub mod session;
pub mod write_budget;
