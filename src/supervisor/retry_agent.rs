use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;
use crate::config::ChannelConfig;

struct RetryState {
    attempt_count: u32,
    last_attempt_at: Option<Instant>,
}

impl RetryState {
    fn forget_if_quiet(&mut self, now: Instant, forget_delay: Duration) {
        if let Some(last_attempt_at) = self.last_attempt_at {
            if now.saturating_duration_since(last_attempt_at) > forget_delay && self.attempt_count > 0 {
                debug!("no retry for {:?} - forgetting {} previous attempts", now - last_attempt_at, self.attempt_count);
                self.attempt_count = 0;
            }
        }
    }
}

/// Fixed-delay backoff with a budget of consecutive attempts.
///
/// Every attempt waits `retry_delay` and is counted; after `max_retries` attempts, there is no
///  budget left. Attempts are forgotten after a quiet period of `forget_delay`, so a channel that
///  was stable for a while gets its full budget back.
///
/// The state is owned by each agent, so independent supervisors never share a budget.
pub struct RetryAgent {
    retry_delay: Duration,
    max_retries: u32,
    forget_delay: Duration,
    state: Mutex<RetryState>,
}

impl RetryAgent {
    pub fn new(retry_delay: Duration, max_retries: u32, forget_delay: Duration) -> RetryAgent {
        RetryAgent {
            retry_delay,
            max_retries,
            forget_delay,
            state: Mutex::new(RetryState {
                attempt_count: 0,
                last_attempt_at: None,
            }),
        }
    }

    pub fn from_config(config: &ChannelConfig) -> RetryAgent {
        RetryAgent::new(config.retry_delay, config.max_retries, config.forget_delay)
    }

    /// Waits for `retry_delay`, then counts an attempt
    pub async fn retry(&self) {
        sleep(self.retry_delay).await;

        let now = Instant::now();
        let mut state = self.lock_state();
        state.forget_if_quiet(now, self.forget_delay);
        state.attempt_count += 1;
        state.last_attempt_at = Some(now);
        debug!("retry attempt #{} of {}", state.attempt_count, self.max_retries);
    }

    pub fn too_many_retries(&self) -> bool {
        let mut state = self.lock_state();
        state.forget_if_quiet(Instant::now(), self.forget_delay);
        state.attempt_count >= self.max_retries
    }

    /// attempts since the last quiet period
    pub fn attempt_count(&self) -> u32 {
        let mut state = self.lock_state();
        state.forget_if_quiet(Instant::now(), self.forget_delay);
        state.attempt_count
    }

    fn lock_state(&self) -> MutexGuard<'_, RetryState> {
        // the state is consistent after every individual update
        self.state.lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}
