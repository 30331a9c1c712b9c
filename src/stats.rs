//! Point-in-time stream statistics.

/// Snapshot of one connection's counters, taken once per supervision tick
/// and pushed to [`StreamListener::on_statistics_update`].
///
/// [`StreamListener::on_statistics_update`]: crate::events::StreamListener::on_statistics_update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Current jitter buffer fill in milliseconds.
    pub buffer_level_ms: u64,
    /// Current jitter buffer fill as a percentage of capacity.
    pub buffer_fill_percent: u32,
    pub underrun_count: u32,
    pub overrun_count: u32,
    pub crc_errors: u32,
    /// TX bytes the peer submitted for arbitration (server sessions only).
    pub tx_bytes_submitted: u64,
    /// TX bytes that won arbitration and were played (server sessions only).
    pub tx_bytes_accepted: u64,
    /// TX submissions rejected because another client held the channel.
    pub tx_denied_count: u32,
    /// Half-RTT estimate from the last latency probe, in milliseconds.
    pub latency_ms: u64,
    /// Age of the connection in milliseconds.
    pub connection_time_ms: u64,
    pub streaming: bool,
}
