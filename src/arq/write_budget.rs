use tokio::sync::watch;
use crate::config::ChannelConfig;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct BudgetState {
    pending_bytes: usize,
    writable: bool,
}

/// Accounts for the payload bytes that were written to a channel but are not acknowledged yet,
///  deriving the channel's writability from them.
///
/// An ARQ session holds on to every frame until the peer acknowledges it, possibly
///  retransmitting it many times. Looking only at what the socket accepted would let producers
///  pile up an unbounded queue while ARQ silently retries, so writability is based on this
///  budget instead.
///
/// There is hysteresis between a high and a low water mark to avoid flapping.
pub struct WriteBudget {
    high_water_mark: usize,
    low_water_mark: usize,
    state: watch::Sender<BudgetState>,
}

impl WriteBudget {
    pub fn new(high_water_mark: usize, low_water_mark: usize) -> WriteBudget {
        assert!(low_water_mark <= high_water_mark);

        WriteBudget {
            high_water_mark,
            low_water_mark,
            state: watch::Sender::new(BudgetState {
                pending_bytes: 0,
                writable: true,
            }),
        }
    }

    pub fn from_config(config: &ChannelConfig) -> WriteBudget {
        Self::new(config.write_buffer_high_water_mark, config.write_buffer_low_water_mark)
    }

    pub fn reserve(&self, len: usize) {
        self.state.send_if_modified(|state| {
            state.pending_bytes += len;
            if state.writable && state.pending_bytes > self.high_water_mark {
                state.writable = false;
                return true;
            }
            false
        });
    }

    pub fn release(&self, len: usize) {
        self.state.send_if_modified(|state| {
            debug_assert!(state.pending_bytes >= len);
            state.pending_bytes = state.pending_bytes.saturating_sub(len);
            if !state.writable && state.pending_bytes <= self.low_water_mark {
                state.writable = true;
                return true;
            }
            false
        });
    }

    pub fn pending_bytes(&self) -> usize {
        self.state.borrow().pending_bytes
    }

    pub fn is_writable(&self) -> bool {
        self.state.borrow().writable
    }

    /// resolves as soon as the budget is writable
    pub async fn writable(&self) {
        let mut receiver = self.state.subscribe();
        // NB: the sender is owned by `self`, so waiting can not fail
        let _ = receiver.wait_for(|state| state.writable).await;
    }
}
