use std::sync::Arc;
use async_trait::async_trait;
use tracing::{debug, warn};
use crate::channel::{ChannelFactory, RetryableChannel};
use crate::error::ChannelError;
use crate::supervisor::retry_agent::RetryAgent;

/// Decides when and how a failed channel is replaced
#[async_trait]
pub trait RetryStrategy: Send + Sync + 'static {
    type Channel: RetryableChannel;

    /// Returns a fresh, started channel to replace `old`.
    ///
    /// Fails with [ChannelError::StartFailed] if the new channel did not come up - callers may
    ///  try again as long as [RetryStrategy::next_channel_available] says so - and with
    ///  [ChannelError::TooManyRetries] once the strategy gave up.
    async fn next_channel(&self, old: Option<Arc<Self::Channel>>) -> Result<Arc<Self::Channel>, ChannelError>;

    fn next_channel_available(&self) -> bool;

    /// failed or successful attempts that currently count against the retry budget
    fn attempt_count(&self) -> u32;
}

/// Shuts down the old channel and waits for the [RetryAgent]'s delay - both at the same time -
///  before creating a replacement.
pub struct DelayedSwitchRetryStrategy<F: ChannelFactory> {
    agent: RetryAgent,
    factory: F,
}

impl<F: ChannelFactory> DelayedSwitchRetryStrategy<F> {
    pub fn new(agent: RetryAgent, factory: F) -> DelayedSwitchRetryStrategy<F> {
        DelayedSwitchRetryStrategy {
            agent,
            factory,
        }
    }

    pub fn agent(&self) -> &RetryAgent {
        &self.agent
    }

    async fn shutdown_old(old: Option<Arc<F::Channel>>) {
        if let Some(old) = old {
            debug!("shutting down the previous channel");
            if let Err(e) = old.shutdown().await {
                warn!("error shutting down the previous channel - ignoring: {}", e);
            }
        }
    }
}

#[async_trait]
impl<F: ChannelFactory> RetryStrategy for DelayedSwitchRetryStrategy<F> {
    type Channel = F::Channel;

    async fn next_channel(&self, old: Option<Arc<F::Channel>>) -> Result<Arc<F::Channel>, ChannelError> {
        if self.agent.too_many_retries() {
            return Err(ChannelError::TooManyRetries { attempts: self.agent.attempt_count() });
        }

        tokio::join!(Self::shutdown_old(old), self.agent.retry());

        let channel = self.factory.create_channel().await
            .map_err(ChannelError::StartFailed)?;

        if let Err(e) = channel.start().await {
            if let Err(shutdown_error) = channel.shutdown().await {
                debug!("error shutting down channel that failed to start: {}", shutdown_error);
            }
            return Err(ChannelError::StartFailed(e));
        }

        debug!("new channel is started");
        Ok(Arc::new(channel))
    }

    fn next_channel_available(&self) -> bool {
        !self.agent.too_many_retries()
    }

    fn attempt_count(&self) -> u32 {
        self.agent.attempt_count()
    }
}
