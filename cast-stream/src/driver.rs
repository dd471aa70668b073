//! Drivers: run the pure lifecycle machines from cast-core against a
//! [`Transport`].
//!
//! A driver owns one machine. It feeds it transport events, executes the
//! actions it returns, and turns the outcome of every transport call into
//! a follow-up event. Follow-ups are processed before the next transport
//! event is read, so a call's result always lands before anything the
//! call itself caused.
//!
//! Each driver publishes a [`LinkStatus`] on a watch channel. Pipelines
//! only ever look at that channel; they never see the machines.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use cast_core::{
    Action, Event, GroupSession, HostAction, HostEvent, HostNotice, HostPolicy, HostState,
    LinkEvent, LinkPolicy, LinkState,
};
use cast_types::{
    DataPathDirection, GroupDescriptor, GroupHandle, RecvInfo, TransportEvent,
};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Result, StreamError};
use crate::metrics::StreamMetrics;
use crate::tokens::FlowTokens;
use crate::transport::{EventReceiver, Transport};

/// What a driver currently offers to the data path.
#[derive(Debug, Clone)]
pub enum LinkStatus {
    /// No live group; the machine is in the named phase.
    Searching {
        /// Phase name.
        phase: &'static str,
    },
    /// A group is live.
    Live(Arc<LiveGroup>),
    /// The driver has stopped.
    Stopped,
}

impl LinkStatus {
    /// The live group, if any.
    pub fn live(&self) -> Option<&Arc<LiveGroup>> {
        match self {
            Self::Live(live) => Some(live),
            _ => None,
        }
    }
}

/// A group that just went live.
///
/// A new value is published every time a group goes live, so comparing
/// `Arc`s tells a pipeline that a fresh session started.
#[derive(Debug)]
pub struct LiveGroup {
    /// The group handle.
    pub group: GroupHandle,
    /// Group shape.
    pub descriptor: GroupDescriptor,
    /// Member state at the moment the group went live.
    pub session: GroupSession,
    /// Transmit tokens, on the sending side only.
    pub tokens: Option<Arc<FlowTokens>>,
}

/// Receives payloads from a live joined group.
///
/// Called on the driver task; implementations must not block.
pub trait DeliveryHandler: Send {
    /// One payload arrived on member `index`.
    fn on_payload(&mut self, group: GroupHandle, index: usize, info: RecvInfo, data: &[u8]);
}

/// Wait until `deadline`, or forever if there is none.
async fn wait(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drives a [`LinkState`] machine: find, sync to and join a broadcaster.
pub struct LinkDriver<T, H> {
    transport: Arc<T>,
    events: EventReceiver,
    policy: LinkPolicy,
    handler: H,
    metrics: Arc<StreamMetrics>,
    status: watch::Sender<LinkStatus>,
    state: LinkState,
    deadline: Option<Instant>,
}

impl<T: Transport, H: DeliveryHandler> LinkDriver<T, H> {
    /// Create a driver. Takes the transport's event stream.
    pub fn new(
        transport: Arc<T>,
        policy: LinkPolicy,
        handler: H,
        metrics: Arc<StreamMetrics>,
    ) -> Result<(Self, watch::Receiver<LinkStatus>)> {
        let events = transport.take_events()?;
        let (status, status_rx) = watch::channel(LinkStatus::Searching {
            phase: LinkState::Idle.phase().as_str(),
        });
        Ok((
            Self {
                transport,
                events,
                policy,
                handler,
                metrics,
                status,
                state: LinkState::new(),
                deadline: None,
            },
            status_rx,
        ))
    }

    /// Run until `shutdown` turns true (or its sender goes away).
    ///
    /// On shutdown everything held is released before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut pending = VecDeque::from([Event::Start]);
        let mut stopping = *shutdown.borrow();
        if stopping {
            pending = VecDeque::new();
        }

        loop {
            while let Some(event) = pending.pop_front() {
                self.step(event, &mut pending).await;
            }
            if stopping {
                self.status.send_replace(LinkStatus::Stopped);
                tracing::info!("link driver stopped");
                return Ok(());
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        stopping = true;
                        pending.push_back(Event::StopRequested);
                    }
                }
                _ = wait(self.deadline) => {
                    self.deadline = None;
                    pending.push_back(Event::Timeout);
                }
                event = self.events.recv() => match event {
                    Some(event) => pending.extend(self.route(event)),
                    None => {
                        self.status.send_replace(LinkStatus::Stopped);
                        return Err(StreamError::EventsClosed);
                    }
                },
            }
        }
    }

    fn route(&mut self, event: TransportEvent) -> Option<Event> {
        match event {
            TransportEvent::AdvertisingReport(report) => Some(Event::Report(report)),
            TransportEvent::Synced { sync } => Some(Event::Synced { sync }),
            TransportEvent::SyncLost { sync, reason } => Some(Event::SyncLost { sync, reason }),
            TransportEvent::GroupInfo { sync, descriptor } => {
                Some(Event::GroupInfo { sync, descriptor })
            }
            TransportEvent::MemberConnected { group, index } => {
                Some(Event::MemberConnected { group, index })
            }
            TransportEvent::MemberDisconnected {
                group,
                index,
                reason,
            } => Some(Event::MemberDisconnected {
                group,
                index,
                reason,
            }),
            TransportEvent::Payload {
                group,
                index,
                info,
                data,
            } => {
                match &self.state {
                    LinkState::GroupLive { group: live, .. } if *live == group => {
                        self.handler.on_payload(group, index, info, &data);
                    }
                    _ => tracing::trace!("payload for {} outside a live group", group),
                }
                None
            }
            TransportEvent::SendComplete { .. } => None,
        }
    }

    async fn step(&mut self, event: Event, pending: &mut VecDeque<Event>) {
        let before = self.state.phase();
        let state = std::mem::take(&mut self.state);
        let (state, actions) = state.on_event(event, &self.policy);
        self.state = state;

        let phase = self.state.phase();
        if phase != before {
            tracing::debug!("link {} -> {}", before, phase);
            if !self.state.is_live() {
                self.status.send_replace(LinkStatus::Searching {
                    phase: phase.as_str(),
                });
            }
        }

        for action in actions {
            pending.extend(self.execute(action).await);
        }
    }

    async fn execute(&mut self, action: Action) -> Option<Event> {
        match action {
            Action::StartScan => match self.transport.start_scan(&self.policy.filter).await {
                Ok(()) => {
                    tracing::debug!("scanning for {}", self.policy.filter);
                    None
                }
                Err(e) => {
                    tracing::warn!("start scan failed: {}", e);
                    Some(Event::ScanFailed)
                }
            },
            Action::StopScan => {
                if let Err(e) = self.transport.stop_scan().await {
                    tracing::debug!("stop scan: {}", e);
                }
                None
            }
            Action::CreateSync { peer, timeout } => {
                match self.transport.create_sync(&peer, timeout).await {
                    Ok(sync) => Some(Event::SyncCreated { sync }),
                    Err(e) => {
                        tracing::warn!("sync to {} failed: {}", peer.address, e);
                        Some(Event::SyncCreateFailed)
                    }
                }
            }
            Action::DeleteSync { sync } => {
                if let Err(e) = self.transport.delete_sync(sync).await {
                    tracing::debug!("delete {}: {}", sync, e);
                }
                None
            }
            Action::EnableGroupInfo { sync } => {
                match self.transport.enable_group_info(sync).await {
                    Ok(()) => Some(Event::GroupInfoEnabled),
                    Err(e) => {
                        tracing::warn!("group info on {} failed: {}", sync, e);
                        Some(Event::GroupInfoFailed)
                    }
                }
            }
            Action::JoinGroup { sync, params } => {
                match self.transport.join_group(sync, &params).await {
                    Ok(group) => Some(Event::JoinAccepted { group }),
                    Err(e) => {
                        tracing::warn!("join on {} rejected: {}", sync, e);
                        Some(Event::JoinRejected)
                    }
                }
            }
            Action::TerminateGroup { group } => {
                if let Err(e) = self.transport.terminate_group(group).await {
                    tracing::debug!("terminate {}: {}", group, e);
                }
                Some(Event::GroupTerminated)
            }
            Action::ArmTimeout { after } => {
                self.deadline = Some(Instant::now() + after);
                None
            }
            Action::DisarmTimeout => {
                self.deadline = None;
                None
            }
            Action::Emit(event) => {
                self.emit(event);
                None
            }
        }
    }

    fn emit(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::PeerFound { peer } => {
                tracing::info!("found broadcaster {} (sid {:?})", peer.address, peer.sid);
            }
            LinkEvent::Live {
                group,
                descriptor,
                session,
            } => {
                self.metrics.sessions_started.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    "joined {}: {} of {} members, {} byte SDUs every {:?}",
                    group,
                    session.required().count(),
                    descriptor.member_count,
                    descriptor.max_sdu,
                    descriptor.sdu_interval,
                );
                self.status.send_replace(LinkStatus::Live(Arc::new(LiveGroup {
                    group,
                    descriptor,
                    session,
                    tokens: None,
                })));
            }
            LinkEvent::Lost {
                group,
                index,
                reason,
            } => {
                self.metrics.link_losses.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("lost member {} of {}: {:?}", index, group, reason);
            }
            LinkEvent::Retrying { phase, cause } => {
                tracing::info!("link retrying after {} ({:?})", phase, cause);
            }
        }
    }
}

/// Drives a [`HostState`] machine: advertise, create the group, and keep
/// it alive. Owns the flow tokens of the live group.
pub struct HostDriver<T> {
    transport: Arc<T>,
    events: EventReceiver,
    policy: HostPolicy,
    max_in_flight: usize,
    metrics: Arc<StreamMetrics>,
    status: watch::Sender<LinkStatus>,
    state: HostState,
    live: Option<Arc<LiveGroup>>,
    deadline: Option<Instant>,
}

impl<T: Transport> HostDriver<T> {
    /// Create a driver. Takes the transport's event stream.
    pub fn new(
        transport: Arc<T>,
        policy: HostPolicy,
        max_in_flight: usize,
        metrics: Arc<StreamMetrics>,
    ) -> Result<(Self, watch::Receiver<LinkStatus>)> {
        let events = transport.take_events()?;
        let (status, status_rx) = watch::channel(LinkStatus::Searching {
            phase: HostState::Idle.phase().as_str(),
        });
        Ok((
            Self {
                transport,
                events,
                policy,
                max_in_flight,
                metrics,
                status,
                state: HostState::new(),
                live: None,
                deadline: None,
            },
            status_rx,
        ))
    }

    /// Run until `shutdown` turns true (or its sender goes away).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut pending = VecDeque::from([HostEvent::Start]);
        let mut stopping = *shutdown.borrow();
        if stopping {
            pending = VecDeque::new();
        }

        loop {
            while let Some(event) = pending.pop_front() {
                self.step(event, &mut pending).await;
            }
            if stopping {
                self.status.send_replace(LinkStatus::Stopped);
                tracing::info!("host driver stopped");
                return Ok(());
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        stopping = true;
                        pending.push_back(HostEvent::StopRequested);
                    }
                }
                _ = wait(self.deadline) => {
                    self.deadline = None;
                    pending.push_back(HostEvent::Timeout);
                }
                event = self.events.recv() => match event {
                    Some(event) => pending.extend(self.route(event)),
                    None => {
                        self.status.send_replace(LinkStatus::Stopped);
                        return Err(StreamError::EventsClosed);
                    }
                },
            }
        }
    }

    fn route(&mut self, event: TransportEvent) -> Option<HostEvent> {
        match event {
            TransportEvent::MemberConnected { group, index } => {
                Some(HostEvent::MemberConnected { group, index })
            }
            TransportEvent::MemberDisconnected {
                group,
                index,
                reason,
            } => Some(HostEvent::MemberDisconnected {
                group,
                index,
                reason,
            }),
            TransportEvent::SendComplete { group, .. } => {
                match self.live.as_ref().filter(|live| live.group == group) {
                    Some(live) => {
                        if let Some(tokens) = &live.tokens {
                            tokens.complete();
                        }
                    }
                    None => tracing::trace!("completion for stale {}", group),
                }
                None
            }
            _ => None,
        }
    }

    async fn step(&mut self, event: HostEvent, pending: &mut VecDeque<HostEvent>) {
        let before = self.state.phase();
        let state = std::mem::take(&mut self.state);
        let (state, actions) = state.on_event(event, &self.policy);
        self.state = state;

        let phase = self.state.phase();
        if phase != before {
            tracing::debug!("host {} -> {}", before, phase);
            if !self.state.is_live() {
                self.live = None;
                self.status.send_replace(LinkStatus::Searching {
                    phase: phase.as_str(),
                });
            }
        }

        for action in actions {
            pending.extend(self.execute(action).await);
        }
    }

    async fn execute(&mut self, action: HostAction) -> Option<HostEvent> {
        match action {
            HostAction::StartAdvertising(params) => {
                match self.transport.start_advertising(&params).await {
                    Ok(()) => Some(HostEvent::AdvertisingStarted),
                    Err(e) => {
                        tracing::warn!("advertising as {:?} failed: {}", params.name, e);
                        Some(HostEvent::AdvertisingFailed)
                    }
                }
            }
            HostAction::StopAdvertising => {
                if let Err(e) = self.transport.stop_advertising().await {
                    tracing::debug!("stop advertising: {}", e);
                }
                None
            }
            HostAction::CreateGroup(params) => match self.transport.create_group(&params).await {
                Ok(group) => Some(HostEvent::GroupCreated { group }),
                Err(e) => {
                    tracing::warn!("group creation failed: {}", e);
                    Some(HostEvent::GroupCreateFailed)
                }
            },
            HostAction::SetupDataPath { group, index } => {
                match self
                    .transport
                    .setup_data_path(group, index, DataPathDirection::HostToController)
                    .await
                {
                    Ok(()) => None,
                    Err(e) => {
                        tracing::warn!("data path for member {} of {}: {}", index, group, e);
                        Some(HostEvent::DataPathFailed { group, index })
                    }
                }
            }
            HostAction::TerminateGroup { group } => {
                if let Err(e) = self.transport.terminate_group(group).await {
                    tracing::debug!("terminate {}: {}", group, e);
                }
                Some(HostEvent::GroupTerminated)
            }
            HostAction::ArmTimeout { after } => {
                self.deadline = Some(Instant::now() + after);
                None
            }
            HostAction::DisarmTimeout => {
                self.deadline = None;
                None
            }
            HostAction::Emit(notice) => {
                self.emit(notice);
                None
            }
        }
    }

    fn emit(&mut self, notice: HostNotice) {
        match notice {
            HostNotice::Advertising => {
                tracing::info!("advertising as {:?}", self.policy.advertising.name);
            }
            HostNotice::Live { group, session } => {
                self.metrics.sessions_started.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    "{} live with {} members",
                    group,
                    session.member_count()
                );
                let live = Arc::new(LiveGroup {
                    group,
                    descriptor: self.policy.group.descriptor(),
                    session,
                    tokens: Some(Arc::new(FlowTokens::new(self.max_in_flight))),
                });
                self.live = Some(live.clone());
                self.status.send_replace(LinkStatus::Live(live));
            }
            HostNotice::Lost {
                group,
                index,
                reason,
            } => {
                self.metrics.link_losses.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("member {} of {} lost: {:?}", index, group, reason);
            }
            HostNotice::Retrying { phase, cause } => {
                tracing::info!("host retrying after {} ({:?})", phase, cause);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockCall, MockTransport};
    use cast_types::{
        AdvertisingParams, AdvertisingReport, DisconnectReason, SecondaryId, SequenceNumber,
        SyncHandle,
    };
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<(usize, SequenceNumber, Vec<u8>)>>>);

    impl DeliveryHandler for Collect {
        fn on_payload(&mut self, _group: GroupHandle, index: usize, info: RecvInfo, data: &[u8]) {
            self.0
                .lock()
                .unwrap()
                .push((index, info.sequence, data.to_vec()));
        }
    }

    fn report() -> AdvertisingReport {
        let params = AdvertisingParams {
            name: "AliceISO".into(),
            sid: SecondaryId::default(),
            ext_interval: Duration::from_millis(50),
            periodic_interval: Duration::from_millis(60),
        };
        AdvertisingReport {
            address: cast_types::PeerAddress::random(),
            sid: params.sid,
            periodic_interval: cast_types::adv::interval_units(params.periodic_interval),
            data: params.advertising_data().unwrap(),
        }
    }

    /// Let spawned tasks run until they block.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    /// Walk a link driver on a mock transport into GroupLive.
    async fn live_link(
        mock: &MockTransport,
        status: &mut watch::Receiver<LinkStatus>,
    ) -> GroupHandle {
        settle().await;
        let sync = SyncHandle::new(mock.next_handle());
        mock.inject(TransportEvent::AdvertisingReport(report()));
        settle().await;
        mock.inject(TransportEvent::Synced { sync });
        settle().await;
        mock.inject(TransportEvent::GroupInfo {
            sync,
            descriptor: HostPolicy::default().group.descriptor(),
        });
        settle().await;
        let group = GroupHandle::new(mock.next_handle() - 1);
        mock.inject(TransportEvent::MemberConnected { group, index: 0 });
        settle().await;
        assert!(status.borrow_and_update().live().is_some());
        group
    }

    #[tokio::test(start_paused = true)]
    async fn link_driver_joins_and_delivers() {
        let mock = MockTransport::new();
        let sink = Collect::default();
        let metrics = Arc::new(StreamMetrics::new());
        let (driver, mut status) = LinkDriver::new(
            Arc::new(mock.clone()),
            LinkPolicy::default(),
            sink.clone(),
            metrics.clone(),
        )
        .unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(driver.run(stop_rx));

        let group = live_link(&mock, &mut status).await;
        assert_eq!(metrics.snapshot().sessions_started, 1);

        mock.inject(TransportEvent::Payload {
            group,
            index: 0,
            info: RecvInfo {
                valid: true,
                sequence: SequenceNumber::new(9),
            },
            data: vec![1, 2, 3],
        });
        // Payloads for other groups are not ours.
        mock.inject(TransportEvent::Payload {
            group: GroupHandle::new(999),
            index: 0,
            info: RecvInfo {
                valid: true,
                sequence: SequenceNumber::ZERO,
            },
            data: vec![0xEE],
        });
        settle().await;
        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![(0, SequenceNumber::new(9), vec![1, 2, 3])]
        );

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(matches!(*status.borrow(), LinkStatus::Stopped));
        assert_eq!(
            mock.count_calls(|c| matches!(c, MockCall::TerminateGroup(g) if *g == group)),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn link_driver_rescans_after_loss() {
        let mock = MockTransport::new();
        let metrics = Arc::new(StreamMetrics::new());
        let (driver, mut status) = LinkDriver::new(
            Arc::new(mock.clone()),
            LinkPolicy::default(),
            Collect::default(),
            metrics.clone(),
        )
        .unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(driver.run(stop_rx));

        let group = live_link(&mock, &mut status).await;
        mock.inject(TransportEvent::MemberDisconnected {
            group,
            index: 0,
            reason: DisconnectReason::SupervisionTimeout,
        });
        settle().await;
        assert!(status.borrow().live().is_none());
        assert_eq!(metrics.snapshot().link_losses, 1);

        let scans = mock.count_calls(|c| matches!(c, MockCall::StartScan));
        tokio::time::sleep(LinkPolicy::default().settle_delay).await;
        settle().await;
        assert_eq!(
            mock.count_calls(|c| matches!(c, MockCall::StartScan)),
            scans + 1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn link_driver_retries_when_sync_never_establishes() {
        let mock = MockTransport::new();
        let (driver, _status) = LinkDriver::new(
            Arc::new(mock.clone()),
            LinkPolicy::default(),
            Collect::default(),
            Arc::new(StreamMetrics::new()),
        )
        .unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(driver.run(stop_rx));

        settle().await;
        mock.inject(TransportEvent::AdvertisingReport(report()));
        settle().await;
        tokio::time::sleep(LinkPolicy::default().sync_timeout).await;
        settle().await;

        assert_eq!(mock.count_calls(|c| matches!(c, MockCall::DeleteSync(_))), 1);
        assert_eq!(mock.count_calls(|c| matches!(c, MockCall::StartScan)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn host_driver_completions_return_tokens() {
        let mock = MockTransport::new();
        mock.set_auto_complete(false);
        let (driver, mut status) = HostDriver::new(
            Arc::new(mock.clone()),
            HostPolicy::default(),
            1,
            Arc::new(StreamMetrics::new()),
        )
        .unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(driver.run(stop_rx));

        settle().await;
        let group = GroupHandle::new(mock.next_handle() - 1);
        mock.inject(TransportEvent::MemberConnected { group, index: 0 });
        settle().await;

        let live = status.borrow_and_update().live().cloned().unwrap();
        let tokens = live.tokens.clone().unwrap();
        tokens.try_acquire().unwrap().submit();
        assert_eq!(tokens.available(), 0);

        mock.inject(TransportEvent::SendComplete { group, index: 0 });
        settle().await;
        assert_eq!(tokens.available(), 1);

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(mock.count_calls(|c| matches!(c, MockCall::StopAdvertising)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn host_driver_recreates_group_after_data_path_failure() {
        let mock = MockTransport::new();
        let (driver, _status) = HostDriver::new(
            Arc::new(mock.clone()),
            HostPolicy::default(),
            1,
            Arc::new(StreamMetrics::new()),
        )
        .unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(driver.run(stop_rx));

        settle().await;
        let group = GroupHandle::new(mock.next_handle() - 1);
        mock.fail_next_setup_data_path();
        mock.inject(TransportEvent::MemberConnected { group, index: 0 });
        settle().await;
        assert_eq!(
            mock.count_calls(|c| matches!(c, MockCall::TerminateGroup(g) if *g == group)),
            1
        );

        tokio::time::sleep(HostPolicy::default().settle_delay).await;
        settle().await;
        assert_eq!(mock.count_calls(|c| matches!(c, MockCall::CreateGroup(_))), 2);
    }

    #[tokio::test]
    async fn closed_event_stream_is_an_error() {
        let mock = MockTransport::new();
        let (driver, _status) = HostDriver::new(
            Arc::new(mock.clone()),
            HostPolicy::default(),
            1,
            Arc::new(StreamMetrics::new()),
        )
        .unwrap();
        mock.close_events();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let result = driver.run(stop_rx).await;
        assert!(matches!(result, Err(StreamError::EventsClosed)));
    }
}
