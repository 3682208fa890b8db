/// Running per-peer traffic counters, exposed read-only for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Last smoothed round-trip estimate reported by the transport, seconds.
    pub rtt: Option<f32>,
}
