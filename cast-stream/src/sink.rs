//! Receive side of the data path: payloads into a byte ring.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use cast_core::{depacketize, ByteProducer, Delivery};
use cast_types::{GroupHandle, RecvInfo};

use crate::driver::DeliveryHandler;
use crate::metrics::StreamMetrics;

/// Stores every valid payload from a joined group in a byte ring.
///
/// Bytes that do not fit are dropped; the ring is never blocked on.
pub struct RingSink {
    ring: ByteProducer,
    metrics: Arc<StreamMetrics>,
}

impl RingSink {
    /// Create a sink writing into `ring`.
    pub fn new(ring: ByteProducer, metrics: Arc<StreamMetrics>) -> Self {
        Self { ring, metrics }
    }
}

impl DeliveryHandler for RingSink {
    fn on_payload(&mut self, group: GroupHandle, index: usize, info: RecvInfo, data: &[u8]) {
        match depacketize(info, data, &mut self.ring) {
            Delivery::Stored { dropped, .. } => {
                self.metrics
                    .deliveries_accepted
                    .fetch_add(1, Ordering::Relaxed);
                if dropped > 0 {
                    self.metrics
                        .ring_overflow_bytes
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                    tracing::debug!(
                        "ring full, dropped {} bytes from member {} of {}",
                        dropped,
                        index,
                        group
                    );
                }
            }
            Delivery::Discarded(reason) => {
                self.metrics
                    .deliveries_discarded
                    .fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    "discarded payload {} on member {}: {:?}",
                    info.sequence,
                    index,
                    reason
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cast_core::byte_ring;
    use cast_types::SequenceNumber;

    fn info(valid: bool) -> RecvInfo {
        RecvInfo {
            valid,
            sequence: SequenceNumber::new(1),
        }
    }

    #[test]
    fn stores_valid_payloads_and_counts_overflow() {
        let metrics = Arc::new(StreamMetrics::new());
        let (producer, mut consumer) = byte_ring(4);
        let mut sink = RingSink::new(producer, metrics.clone());
        let group = GroupHandle::new(1);

        sink.on_payload(group, 0, info(true), &[1, 2, 3]);
        sink.on_payload(group, 0, info(true), &[4, 5, 6]);

        let mut out = [0u8; 8];
        let n = consumer.pop_into(&mut out);
        assert_eq!(&out[..n], &[1, 2, 3, 4]);

        let snap = metrics.snapshot();
        assert_eq!(snap.deliveries_accepted, 2);
        assert_eq!(snap.ring_overflow_bytes, 2);
    }

    #[test]
    fn invalid_and_empty_payloads_leave_ring_untouched() {
        let metrics = Arc::new(StreamMetrics::new());
        let (producer, consumer) = byte_ring(16);
        let mut sink = RingSink::new(producer, metrics.clone());

        sink.on_payload(GroupHandle::new(1), 0, info(false), &[9, 9]);
        sink.on_payload(GroupHandle::new(1), 0, info(true), &[]);

        assert_eq!(consumer.occupied(), 0);
        assert_eq!(metrics.snapshot().deliveries_discarded, 2);
    }
}
