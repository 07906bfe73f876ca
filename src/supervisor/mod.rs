//! Failover: a [channel_supervisor::ChannelSupervisor] keeps a usable channel in place,
//!  replacing it through a [retry_strategy::RetryStrategy] whenever it closes.

pub mod channel_supervisor;
pub mod retry_agent;
pub mod retry_strategy;
