use thiserror::Error;

/// Failures that are visible to code sending through a channel.
///
/// Most of these are transient and handled inside the crate: an ARQ session never surfaces a
///  lost frame, and a supervisor retries a replacement channel that fails to come up. Only
///  [ChannelError::TooManyRetries] is terminal.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The underlying channel died. Writes that were pending on it fail with this error, and
    ///  they are not retried by the ARQ session - failover is the supervisor's business.
    #[error("channel is closed")]
    ChannelClosed,

    /// The supervisor has no usable channel at the moment, typically because it is looking for
    ///  a replacement. Callers should back off and try again.
    #[error("no channel available")]
    NoChannelAvailable,

    /// The message does not fit into a single frame
    #[error("message of {len} bytes exceeds the maximum payload of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },

    /// A freshly created replacement channel failed to come up
    #[error("replacement channel failed to start: {0}")]
    StartFailed(#[source] anyhow::Error),

    /// The retry budget is exhausted. A supervisor that reports this stays dead.
    #[error("giving up after {attempts} failed attempts to establish a channel")]
    TooManyRetries { attempts: u32 },

    /// The supervisor was shut down explicitly
    #[error("channel supervisor was shut down")]
    ShutDown,
}

impl ChannelError {
    /// terminal errors will keep occurring for every subsequent call
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelError::TooManyRetries { .. } | ChannelError::ShutDown)
    }
}
