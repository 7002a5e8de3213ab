use std::time::Duration;
use anyhow::bail;

/// Per-session protocol configuration. Both peers of a session must agree on these values
///  out-of-band - the protocol has no handshake to negotiate them.
pub struct SessionConfig {
    /// The maximum number of *packets* (not bytes) that may be inflight on the sender side,
    ///  and equally the number of out-of-order packets the receiver buffers ahead of the
    ///  contiguous prefix. Window buffers on both sides are preallocated to this size.
    pub window_size: u32,

    /// The age at which the oldest unacknowledged packet is re-sent. This should be comfortably
    ///  above the expected round-trip time - too small a value floods the wire with spurious
    ///  retransmissions, too big a value stalls recovery after a loss.
    pub retransmit_timeout: Duration,

    /// The interval at which the event loop wakes up to check for expired packets (and to poll
    ///  the data source / drain the consumer). This is a coarse periodic check, not a precise
    ///  timer: it should be well below `retransmit_timeout` for the expiry check to be
    ///  meaningful.
    pub timer_tick_interval: Duration,
}

impl SessionConfig {
    /// A config with a tick granularity of a fifth of the timeout, which is fine-grained
    ///  enough for the expiry check while keeping idle wakeups cheap.
    pub fn new(window_size: u32, retransmit_timeout: Duration) -> SessionConfig {
        SessionConfig {
            window_size,
            retransmit_timeout,
            timer_tick_interval: (retransmit_timeout / 5).max(Duration::from_millis(1)),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_size == 0 {
            bail!("window size must be at least one packet");
        }
        // only one cycle of sequence numbers may be live at a time for modular slot
        //  indexing to be unambiguous
        if self.window_size > u32::MAX / 2 {
            bail!("window size {} is too big for modular slot indexing", self.window_size);
        }
        if self.retransmit_timeout.is_zero() {
            bail!("retransmission timeout must be non-zero");
        }
        if self.timer_tick_interval.is_zero() {
            bail!("timer tick interval must be non-zero");
        }
        if self.timer_tick_interval > self.retransmit_timeout {
            bail!("timer tick interval must not exceed the retransmission timeout");
        }
        Ok(())
    }
}
