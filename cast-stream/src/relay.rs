//! Relay: forward payloads from a joined group into a hosted one.
//!
//! The forwarder is the upstream link driver's delivery handler. It never
//! waits: anything it cannot submit right away is dropped and counted.
//! Forwarded SDUs keep the sequence number they arrived with.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use cast_types::{GroupHandle, RecvInfo, SequenceNumber};
use thiserror::Error;
use tokio::sync::watch;

use crate::driver::{DeliveryHandler, LinkStatus};
use crate::metrics::StreamMetrics;
use crate::transport::{Transport, TransportError};

/// Why a payload was not forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayDrop {
    /// The downstream group is not live.
    #[error("downstream not live")]
    NotLive,

    /// The downstream group has no such member.
    #[error("downstream has no member {0}")]
    NoSuchMember(usize),

    /// Every transmit token is in flight.
    #[error("no transmit buffer available")]
    NoBuffer,

    /// The downstream transport refused the SDU.
    #[error("downstream rejected: {0}")]
    Rejected(TransportError),
}

/// Forwards upstream deliveries to the downstream group's matching member.
pub struct RelayForwarder<T: ?Sized> {
    downstream: Arc<T>,
    status: watch::Receiver<LinkStatus>,
    metrics: Arc<StreamMetrics>,
}

impl<T: Transport + ?Sized> RelayForwarder<T> {
    /// Forward into `downstream` whenever `status` shows it live.
    pub fn new(
        downstream: Arc<T>,
        status: watch::Receiver<LinkStatus>,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        Self {
            downstream,
            status,
            metrics,
        }
    }

    /// Submit one payload downstream on member `index`.
    pub fn forward(
        &self,
        index: usize,
        sequence: SequenceNumber,
        data: &[u8],
    ) -> Result<(), RelayDrop> {
        let live = self
            .status
            .borrow()
            .live()
            .cloned()
            .ok_or(RelayDrop::NotLive)?;
        if index >= live.descriptor.member_count as usize {
            return Err(RelayDrop::NoSuchMember(index));
        }
        let tokens = live.tokens.as_ref().ok_or(RelayDrop::NotLive)?;
        let submission = tokens
            .try_acquire()
            .ok_or(RelayDrop::NoBuffer)?
            .submit();

        self.downstream
            .send(live.group, index, data.to_vec(), sequence)
            .map_err(|e| {
                submission.rollback();
                RelayDrop::Rejected(e)
            })
    }
}

impl<T: Transport + ?Sized> DeliveryHandler for RelayForwarder<T> {
    fn on_payload(&mut self, group: GroupHandle, index: usize, info: RecvInfo, data: &[u8]) {
        if !info.valid || data.is_empty() {
            self.metrics
                .deliveries_discarded
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.metrics
            .deliveries_accepted
            .fetch_add(1, Ordering::Relaxed);

        match self.forward(index, info.sequence, data) {
            Ok(()) => {
                self.metrics.relay_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(reason) => {
                self.metrics.relay_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "dropped {} from member {} of {}: {}",
                    info.sequence,
                    index,
                    group,
                    reason
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LiveGroup;
    use crate::tokens::FlowTokens;
    use crate::transport::MockTransport;
    use cast_core::{GroupSession, HostPolicy};
    use cast_types::MemberMask;

    const UPSTREAM: GroupHandle = GroupHandle::new(1);
    const DOWNSTREAM: GroupHandle = GroupHandle::new(2);

    fn live(members: u8, max_in_flight: usize) -> (LinkStatus, Arc<FlowTokens>) {
        let mut policy = HostPolicy::default();
        policy.group.member_count = members;
        let tokens = Arc::new(FlowTokens::new(max_in_flight));
        let status = LinkStatus::Live(Arc::new(LiveGroup {
            group: DOWNSTREAM,
            descriptor: policy.group.descriptor(),
            session: GroupSession::new(members as usize, MemberMask::first(members as usize)),
            tokens: Some(tokens.clone()),
        }));
        (status, tokens)
    }

    fn forwarder(
        status: LinkStatus,
    ) -> (
        RelayForwarder<MockTransport>,
        MockTransport,
        Arc<StreamMetrics>,
        watch::Sender<LinkStatus>,
    ) {
        let mock = MockTransport::new();
        let metrics = Arc::new(StreamMetrics::new());
        let (tx, rx) = watch::channel(status);
        (
            RelayForwarder::new(Arc::new(mock.clone()), rx, metrics.clone()),
            mock,
            metrics,
            tx,
        )
    }

    fn info(sequence: u16) -> RecvInfo {
        RecvInfo {
            valid: true,
            sequence: SequenceNumber::new(sequence),
        }
    }

    #[test]
    fn forwards_with_upstream_sequence() {
        let (status, tokens) = live(2, 4);
        let (mut relay, mock, metrics, _tx) = forwarder(status);

        relay.on_payload(UPSTREAM, 1, info(4711), &[1, 2, 3]);
        relay.on_payload(UPSTREAM, 0, info(65535), &[4]);

        let sent = mock.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].group, DOWNSTREAM);
        assert_eq!(sent[0].index, 1);
        assert_eq!(sent[0].sequence, SequenceNumber::new(4711));
        assert_eq!(sent[0].payload, vec![1, 2, 3]);
        assert_eq!(sent[1].sequence, SequenceNumber::new(65535));

        assert_eq!(tokens.in_flight(), 2);
        assert_eq!(metrics.snapshot().relay_forwarded, 2);
    }

    #[test]
    fn drops_when_downstream_not_live() {
        let (mut relay, mock, metrics, _tx) =
            forwarder(LinkStatus::Searching { phase: "advertising" });
        relay.on_payload(UPSTREAM, 0, info(1), &[1]);

        assert!(mock.sent().is_empty());
        assert_eq!(metrics.snapshot().relay_dropped, 1);
        assert_eq!(relay.forward(0, SequenceNumber::ZERO, &[1]), Err(RelayDrop::NotLive));
    }

    #[test]
    fn drops_out_of_range_member() {
        let (status, _) = live(1, 4);
        let (relay, _, _, _tx) = forwarder(status);
        assert_eq!(
            relay.forward(3, SequenceNumber::ZERO, &[1]),
            Err(RelayDrop::NoSuchMember(3))
        );
    }

    #[test]
    fn drops_without_blocking_when_tokens_exhausted() {
        let (status, tokens) = live(1, 1);
        let (mut relay, mock, metrics, _tx) = forwarder(status);

        relay.on_payload(UPSTREAM, 0, info(1), &[1]);
        relay.on_payload(UPSTREAM, 0, info(2), &[2]);
        assert_eq!(mock.sent().len(), 1);
        assert_eq!(metrics.snapshot().relay_dropped, 1);

        tokens.complete();
        relay.on_payload(UPSTREAM, 0, info(3), &[3]);
        assert_eq!(mock.sent()[1].sequence, SequenceNumber::new(3));
    }

    #[test]
    fn completion_inside_send_returns_token() {
        let (status, tokens) = live(1, 1);
        let (mut relay, mock, metrics, _tx) = forwarder(status);
        mock.complete_within_send(tokens.clone());

        for sequence in 1..=3 {
            relay.on_payload(UPSTREAM, 0, info(sequence), &[1]);
        }

        assert_eq!(mock.sent().len(), 3);
        assert_eq!(metrics.snapshot().relay_dropped, 0);
        assert_eq!(tokens.available(), 1);
        assert_eq!(tokens.acquired(), tokens.released());
    }

    #[test]
    fn rejected_send_releases_token() {
        let (status, tokens) = live(1, 1);
        let (relay, mock, _, _tx) = forwarder(status);
        mock.fail_next_send("busy");

        assert!(matches!(
            relay.forward(0, SequenceNumber::ZERO, &[1]),
            Err(RelayDrop::Rejected(_))
        ));
        assert_eq!(tokens.available(), 1);
        assert_eq!(tokens.acquired(), tokens.released());
    }

    #[test]
    fn invalid_upstream_payloads_are_not_forwarded() {
        let (status, _) = live(1, 1);
        let (mut relay, mock, metrics, _tx) = forwarder(status);

        relay.on_payload(
            UPSTREAM,
            0,
            RecvInfo {
                valid: false,
                sequence: SequenceNumber::ZERO,
            },
            &[1],
        );
        relay.on_payload(UPSTREAM, 0, info(1), &[]);

        assert!(mock.sent().is_empty());
        let snap = metrics.snapshot();
        assert_eq!(snap.deliveries_discarded, 2);
        assert_eq!(snap.relay_dropped, 0);
    }
}
