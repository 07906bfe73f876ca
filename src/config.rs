use std::time::Duration;
use anyhow::bail;
use crate::arq::frame::{ArqFrame, SequenceBit};

pub struct ChannelConfig {
    /// Time to wait for an ACK before a DATA frame is sent again. This should not be smaller
    ///  than the round trip time to the peer, otherwise frames are resent needlessly.
    pub retry_timeout: Duration,

    /// Wait enforced before each attempt to establish a replacement channel
    pub retry_delay: Duration,
    /// Number of consecutive failed attempts after which a supervisor gives up for good
    pub max_retries: u32,
    /// If there was no attempt for this long, previous failures are forgotten and the full
    ///  retry budget is available again
    pub forget_delay: Duration,

    /// A channel becomes unwritable when the payload bytes that are queued but not yet
    ///  acknowledged exceed this threshold...
    pub write_buffer_high_water_mark: usize,
    /// ... and it becomes writable again once they drop to this threshold.
    pub write_buffer_low_water_mark: usize,

    /// NB: Both peers must agree on these, otherwise the first DATA frame is lost as a
    ///  presumed duplicate
    pub initial_inbound_sequence_bit: SequenceBit,
    pub initial_outbound_sequence_bit: SequenceBit,

    /// Upper bound for an encoded frame. For UDP links, this is the payload size inside a UDP
    ///  packet: `1500 - 20 - 8 = 1472` for IPV4 with full Ethernet frames.
    pub max_frame_len: usize,
}

impl ChannelConfig {
    pub fn new() -> ChannelConfig {
        ChannelConfig {
            retry_timeout: Duration::from_millis(500),
            retry_delay: Duration::from_secs(1),
            max_retries: 5,
            forget_delay: Duration::from_secs(60),
            write_buffer_high_water_mark: 64*1024,
            write_buffer_low_water_mark: 32*1024,
            initial_inbound_sequence_bit: SequenceBit::ZERO,
            initial_outbound_sequence_bit: SequenceBit::ZERO,
            max_frame_len: 1472,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry_timeout.is_zero() {
            bail!("retry timeout must be positive");
        }
        if self.retry_delay.is_zero() {
            bail!("retry delay must be positive");
        }
        if self.forget_delay.is_zero() {
            bail!("forget delay must be positive");
        }
        if self.max_retries == 0 {
            bail!("max retries must be at least 1");
        }
        if self.write_buffer_low_water_mark > self.write_buffer_high_water_mark {
            bail!("write buffer low water mark {} is above the high water mark {}", self.write_buffer_low_water_mark, self.write_buffer_high_water_mark);
        }
        if self.max_frame_len <= ArqFrame::HEADER_LEN {
            bail!("max frame length {} leaves no room for payload", self.max_frame_len);
        }
        Ok(())
    }

    /// the biggest payload that fits into a single DATA frame
    pub fn max_payload_len(&self) -> usize {
        self.max_frame_len.saturating_sub(ArqFrame::HEADER_LEN)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}
