use std::time::Duration;
use anyhow::bail;

/// Tunable protocol constants, shared by client and server endpoints.
///
/// All intervals are polled: an endpoint checks them against wall-clock timestamps on its
///  periodic tick rather than arming per-entry timers, so the effective resolution of every
///  other interval is bounded by [`tick_interval`](SnpConfig::tick_interval).
#[derive(Debug, Clone)]
pub struct SnpConfig {
    /// If no acknowledgement for a reliable envelope has arrived after this interval, the
    ///  envelope is retransmitted. There is no upper bound on the number of retransmissions -
    ///  the connection timeout is the only backstop for a peer that never answers.
    ///
    /// This is also the retry cadence for pending connection requests on the client side.
    pub retransmit_interval: Duration,

    /// A client keeps retrying an unanswered connection request for this long. After that the
    ///  pending request is silently discarded - no connection and no error. (Inherited source
    ///  behavior; callers that need a failure signal have to track their own deadline.)
    pub connection_open_attempt_duration: Duration,

    /// A connection that has not received any envelope (including keepalives) for this long
    ///  is closed unilaterally.
    pub connection_timeout: Duration,

    /// If nothing has been sent on a connection for this long, the next tick emits a
    ///  keepalive so the peer's inactivity timer is reset.
    pub keep_alive_interval: Duration,

    /// Cadence of the per-endpoint maintenance tick. Must be smaller than
    ///  [`retransmit_interval`](SnpConfig::retransmit_interval), otherwise retransmission
    ///  timing degenerates.
    pub tick_interval: Duration,

    /// Lower bound (inclusive) for randomly generated connection ids.
    pub connection_id_min: u32,

    /// Upper bound (inclusive) for randomly generated connection ids.
    ///
    /// NB: The default range is 1..=65536, which is 2^16 values but does *not* fit u16 -
    ///  connection ids are u32 on the wire.
    pub connection_id_max: u32,

    /// Size of the buffer that inbound datagrams are received into. Envelopes bigger than
    ///  this are truncated by the OS and will fail to decode; choose this to comfortably fit
    ///  the UDP payloads the application produces.
    pub receive_buffer_size: usize,
}

impl Default for SnpConfig {
    fn default() -> SnpConfig {
        SnpConfig {
            retransmit_interval: Duration::from_millis(200),
            connection_open_attempt_duration: Duration::from_millis(5000),
            connection_timeout: Duration::from_millis(10000),
            keep_alive_interval: Duration::from_millis(500),
            tick_interval: Duration::from_millis(100),
            connection_id_min: 1,
            connection_id_max: 65536,
            receive_buffer_size: 1500,
        }
    }
}

impl SnpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval >= self.retransmit_interval {
            bail!("tick interval must be smaller than the retransmit interval");
        }
        if self.connection_id_min < 1 {
            bail!("connection id 0 is reserved, the id range must start at 1 or above");
        }
        if self.connection_id_min > self.connection_id_max {
            bail!("connection id range is empty");
        }
        if self.receive_buffer_size < 64 {
            bail!("receive buffer is too small to hold any useful envelope");
        }
        Ok(())
    }
}
