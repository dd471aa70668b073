//! Stream counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operational counters for one process.
///
/// All counters are monotonically increasing (reset only on restart).
/// Thread-safe via `AtomicU64` so pipelines and drivers share one instance
/// through an `Arc`.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    /// SDUs accepted by the transport on the source side.
    pub sdus_sent: AtomicU64,
    /// Filler bytes padded into outgoing payloads on underrun.
    pub filler_bytes: AtomicU64,
    /// Cadence ticks aborted because no flow token arrived in time.
    pub token_timeouts: AtomicU64,
    /// Submissions the transport refused.
    pub send_failures: AtomicU64,
    /// Received payloads stored in the ring.
    pub deliveries_accepted: AtomicU64,
    /// Received payloads discarded as invalid or empty.
    pub deliveries_discarded: AtomicU64,
    /// Bytes lost because a ring was full.
    pub ring_overflow_bytes: AtomicU64,
    /// Payloads the relay forwarded downstream.
    pub relay_forwarded: AtomicU64,
    /// Payloads the relay dropped.
    pub relay_dropped: AtomicU64,
    /// Live groups lost (either role).
    pub link_losses: AtomicU64,
    /// Groups that went live (either role).
    pub sessions_started: AtomicU64,
}

impl StreamMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            sdus_sent: load(&self.sdus_sent),
            filler_bytes: load(&self.filler_bytes),
            token_timeouts: load(&self.token_timeouts),
            send_failures: load(&self.send_failures),
            deliveries_accepted: load(&self.deliveries_accepted),
            deliveries_discarded: load(&self.deliveries_discarded),
            ring_overflow_bytes: load(&self.ring_overflow_bytes),
            relay_forwarded: load(&self.relay_forwarded),
            relay_dropped: load(&self.relay_dropped),
            link_losses: load(&self.link_losses),
            sessions_started: load(&self.sessions_started),
        }
    }
}

/// Plain copy of [`StreamMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// See [`StreamMetrics::sdus_sent`].
    pub sdus_sent: u64,
    /// See [`StreamMetrics::filler_bytes`].
    pub filler_bytes: u64,
    /// See [`StreamMetrics::token_timeouts`].
    pub token_timeouts: u64,
    /// See [`StreamMetrics::send_failures`].
    pub send_failures: u64,
    /// See [`StreamMetrics::deliveries_accepted`].
    pub deliveries_accepted: u64,
    /// See [`StreamMetrics::deliveries_discarded`].
    pub deliveries_discarded: u64,
    /// See [`StreamMetrics::ring_overflow_bytes`].
    pub ring_overflow_bytes: u64,
    /// See [`StreamMetrics::relay_forwarded`].
    pub relay_forwarded: u64,
    /// See [`StreamMetrics::relay_dropped`].
    pub relay_dropped: u64,
    /// See [`StreamMetrics::link_losses`].
    pub link_losses: u64,
    /// See [`StreamMetrics::sessions_started`].
    pub sessions_started: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={} filler={}B token_timeouts={} send_failures={} accepted={} discarded={} \
             overflow={}B forwarded={} relay_dropped={} sessions={} losses={}",
            self.sdus_sent,
            self.filler_bytes,
            self.token_timeouts,
            self.send_failures,
            self.deliveries_accepted,
            self.deliveries_discarded,
            self.ring_overflow_bytes,
            self.relay_forwarded,
            self.relay_dropped,
            self.sessions_started,
            self.link_losses,
        )
    }
}
