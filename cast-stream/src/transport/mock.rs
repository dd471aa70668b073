//! Mock transport for testing.
//!
//! Records every request, lets tests inject transport events and script
//! failures of individual requests.

use super::{EventReceiver, Transport, TransportError};
use crate::tokens::FlowTokens;
use async_trait::async_trait;
use cast_types::{
    AdvertisingParams, DataPathDirection, GroupHandle, GroupParams, IdentityFilter, JoinParams,
    PeerInfo, SequenceNumber, SyncHandle, TransportEvent,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A request the mock received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `start_scan`
    StartScan,
    /// `stop_scan`
    StopScan,
    /// `create_sync`
    CreateSync {
        /// Requested peer.
        peer: PeerInfo,
        /// Supervision timeout.
        timeout: Duration,
    },
    /// `delete_sync`
    DeleteSync(SyncHandle),
    /// `enable_group_info`
    EnableGroupInfo(SyncHandle),
    /// `join_group`
    JoinGroup {
        /// Sync the join was issued on.
        sync: SyncHandle,
        /// Join parameters.
        params: JoinParams,
    },
    /// `terminate_group`
    TerminateGroup(GroupHandle),
    /// `start_advertising`
    StartAdvertising(AdvertisingParams),
    /// `stop_advertising`
    StopAdvertising,
    /// `create_group`
    CreateGroup(GroupParams),
    /// `setup_data_path`
    SetupDataPath {
        /// The group.
        group: GroupHandle,
        /// Member index.
        index: usize,
        /// Direction.
        direction: DataPathDirection,
    },
}

/// An SDU submitted through `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSdu {
    /// The group.
    pub group: GroupHandle,
    /// Member index.
    pub index: usize,
    /// Sequence number it was submitted with.
    pub sequence: SequenceNumber,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// Mock transport for testing.
///
/// Sync and group handles are allocated from 1 upwards. Submissions
/// complete immediately (a `SendComplete` event is queued) unless
/// auto-completion is turned off.
#[derive(Debug)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug)]
struct MockTransportInner {
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Option<EventReceiver>,
    calls: Vec<MockCall>,
    sent: Vec<SentSdu>,
    next_handle: u32,
    auto_complete: bool,
    fail_next_start_scan: Option<String>,
    fail_next_create_sync: Option<String>,
    fail_next_enable_group_info: Option<String>,
    fail_next_join: Option<String>,
    fail_next_start_advertising: Option<String>,
    fail_next_create_group: Option<String>,
    fail_next_setup_data_path: Option<String>,
    fail_next_send: Option<String>,
    complete_within_send: Option<Arc<FlowTokens>>,
}

impl Default for MockTransportInner {
    fn default() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx: Some(events_rx),
            calls: Vec::new(),
            sent: Vec::new(),
            next_handle: 1,
            auto_complete: true,
            fail_next_start_scan: None,
            fail_next_create_sync: None,
            fail_next_enable_group_info: None,
            fail_next_join: None,
            fail_next_start_advertising: None,
            fail_next_create_group: None,
            fail_next_setup_data_path: None,
            fail_next_send: None,
            complete_within_send: None,
        }
    }
}

impl MockTransportInner {
    fn allocate(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockTransportInner::default())),
        }
    }

    /// Queue a transport event, as if the controller reported it.
    pub fn inject(&self, event: TransportEvent) {
        let inner = self.inner.lock().unwrap();
        let _ = inner.events_tx.send(event);
    }

    /// Get all requests received so far.
    pub fn calls(&self) -> Vec<MockCall> {
        let inner = self.inner.lock().unwrap();
        inner.calls.clone()
    }

    /// Count requests matching `pred`.
    pub fn count_calls(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.calls.iter().filter(|c| pred(c)).count()
    }

    /// Get all SDUs submitted so far.
    pub fn sent(&self) -> Vec<SentSdu> {
        let inner = self.inner.lock().unwrap();
        inner.sent.clone()
    }

    /// The handle the next sync or group will get.
    pub fn next_handle(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.next_handle
    }

    /// Whether `send` queues a completion immediately.
    pub fn set_auto_complete(&self, enabled: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.auto_complete = enabled;
    }

    /// Cause the next start_scan() to fail.
    pub fn fail_next_start_scan(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_start_scan = Some(error.to_string());
    }

    /// Cause the next create_sync() to fail.
    pub fn fail_next_create_sync(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_create_sync = Some(error.to_string());
    }

    /// Cause the next enable_group_info() to fail.
    pub fn fail_next_enable_group_info(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_enable_group_info = Some(error.to_string());
    }

    /// Cause the next join_group() to fail.
    pub fn fail_next_join(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_join = Some(error.to_string());
    }

    /// Cause the next start_advertising() to fail.
    pub fn fail_next_start_advertising(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_start_advertising = Some(error.to_string());
    }

    /// Cause the next create_group() to fail.
    pub fn fail_next_create_group(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_create_group = Some(error.to_string());
    }

    /// Cause the next setup_data_path() to fail.
    pub fn fail_next_setup_data_path(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_setup_data_path = Some("data path refused".to_string());
    }

    /// Close the event stream, as if the controller went away.
    pub fn close_events(&self) {
        let mut inner = self.inner.lock().unwrap();
        let (closed, _) = mpsc::unbounded_channel();
        inner.events_tx = closed;
    }

    /// Cause the next send() to fail.
    pub fn fail_next_send(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_send = Some(error.to_string());
    }

    /// Return a token to `tokens` from inside every accepted `send`,
    /// before `send` returns.
    pub fn complete_within_send(&self, tokens: Arc<FlowTokens>) {
        let mut inner = self.inner.lock().unwrap();
        inner.complete_within_send = Some(tokens);
    }

    fn record(&self, call: MockCall) {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn take_events(&self) -> Result<EventReceiver, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.events_rx.take().ok_or(TransportError::EventsTaken)
    }

    async fn start_scan(&self, _filter: &IdentityFilter) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(MockCall::StartScan);

        // Check for forced failure
        if let Some(error) = inner.fail_next_start_scan.take() {
            return Err(TransportError::Rejected(error));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(MockCall::StopScan);
        Ok(())
    }

    async fn create_sync(
        &self,
        peer: &PeerInfo,
        timeout: Duration,
    ) -> Result<SyncHandle, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(MockCall::CreateSync {
            peer: *peer,
            timeout,
        });

        if let Some(error) = inner.fail_next_create_sync.take() {
            return Err(TransportError::Rejected(error));
        }
        Ok(SyncHandle::new(inner.allocate()))
    }

    async fn delete_sync(&self, sync: SyncHandle) -> Result<(), TransportError> {
        self.record(MockCall::DeleteSync(sync));
        Ok(())
    }

    async fn enable_group_info(&self, sync: SyncHandle) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(MockCall::EnableGroupInfo(sync));

        if let Some(error) = inner.fail_next_enable_group_info.take() {
            return Err(TransportError::Rejected(error));
        }
        Ok(())
    }

    async fn join_group(
        &self,
        sync: SyncHandle,
        params: &JoinParams,
    ) -> Result<GroupHandle, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(MockCall::JoinGroup {
            sync,
            params: *params,
        });

        if let Some(error) = inner.fail_next_join.take() {
            return Err(TransportError::Rejected(error));
        }
        Ok(GroupHandle::new(inner.allocate()))
    }

    async fn terminate_group(&self, group: GroupHandle) -> Result<(), TransportError> {
        self.record(MockCall::TerminateGroup(group));
        Ok(())
    }

    async fn start_advertising(&self, params: &AdvertisingParams) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(MockCall::StartAdvertising(params.clone()));

        if let Some(error) = inner.fail_next_start_advertising.take() {
            return Err(TransportError::Rejected(error));
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), TransportError> {
        self.record(MockCall::StopAdvertising);
        Ok(())
    }

    async fn create_group(&self, params: &GroupParams) -> Result<GroupHandle, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(MockCall::CreateGroup(*params));

        if let Some(error) = inner.fail_next_create_group.take() {
            return Err(TransportError::Rejected(error));
        }
        Ok(GroupHandle::new(inner.allocate()))
    }

    async fn setup_data_path(
        &self,
        group: GroupHandle,
        index: usize,
        direction: DataPathDirection,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(MockCall::SetupDataPath {
            group,
            index,
            direction,
        });

        if let Some(error) = inner.fail_next_setup_data_path.take() {
            return Err(TransportError::Rejected(error));
        }
        Ok(())
    }

    fn send(
        &self,
        group: GroupHandle,
        index: usize,
        payload: Vec<u8>,
        sequence: SequenceNumber,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::Rejected(error));
        }

        inner.sent.push(SentSdu {
            group,
            index,
            sequence,
            payload,
        });
        if inner.auto_complete {
            let _ = inner
                .events_tx
                .send(TransportEvent::SendComplete { group, index });
        }
        let inline = inner.complete_within_send.clone();
        drop(inner);
        if let Some(tokens) = inline {
            tokens.complete();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cast_types::{AddressKind, PeerAddress, SecondaryId};

    fn peer() -> PeerInfo {
        PeerInfo {
            address: PeerAddress::new(AddressKind::Random, [0xC0, 0, 0, 0, 0, 1]),
            sid: SecondaryId::default(),
            interval: Duration::from_millis(60),
        }
    }

    #[tokio::test]
    async fn events_can_be_taken_once() {
        let transport = MockTransport::new();
        assert!(transport.take_events().is_ok());
        assert_eq!(
            transport.take_events().unwrap_err(),
            TransportError::EventsTaken
        );
    }

    #[tokio::test]
    async fn injected_events_arrive_in_order() {
        let transport = MockTransport::new();
        let mut events = transport.take_events().unwrap();

        transport.inject(TransportEvent::Synced {
            sync: SyncHandle::new(1),
        });
        transport.inject(TransportEvent::SendComplete {
            group: GroupHandle::new(2),
            index: 0,
        });

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Synced { .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::SendComplete { .. })
        ));
    }

    #[tokio::test]
    async fn handles_are_allocated_in_sequence() {
        let transport = MockTransport::new();
        let sync = transport
            .create_sync(&peer(), Duration::from_secs(4))
            .await
            .unwrap();
        assert_eq!(sync, SyncHandle::new(1));
        assert_eq!(transport.next_handle(), 2);
    }

    #[tokio::test]
    async fn forced_create_sync_failure() {
        let transport = MockTransport::new();
        transport.fail_next_create_sync("busy");

        let result = transport.create_sync(&peer(), Duration::from_secs(4)).await;
        assert!(matches!(result, Err(TransportError::Rejected(_))));

        // Next call should work
        assert!(transport
            .create_sync(&peer(), Duration::from_secs(4))
            .await
            .is_ok());
        assert_eq!(
            transport.count_calls(|c| matches!(c, MockCall::CreateSync { .. })),
            2
        );
    }

    #[tokio::test]
    async fn send_records_and_completes() {
        let transport = MockTransport::new();
        let mut events = transport.take_events().unwrap();
        let group = GroupHandle::new(5);

        transport
            .send(group, 0, vec![1, 2], SequenceNumber::new(9))
            .unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sequence, SequenceNumber::new(9));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::SendComplete { group, index: 0 })
        );
    }

    #[tokio::test]
    async fn forced_send_failure_records_nothing() {
        let transport = MockTransport::new();
        transport.fail_next_send("no buffer");

        let result = transport.send(GroupHandle::new(1), 0, vec![0], SequenceNumber::ZERO);
        assert!(result.is_err());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let transport1 = MockTransport::new();
        let transport2 = transport1.clone();

        transport1.stop_scan().await.unwrap();
        transport2.stop_advertising().await.unwrap();

        assert_eq!(
            transport1.calls(),
            vec![MockCall::StopScan, MockCall::StopAdvertising]
        );
    }
}
