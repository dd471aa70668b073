//! Link state machine for isocast receivers.
//!
//! This module provides a pure, side-effect-free state machine that finds
//! a broadcaster, follows its periodic schedule, joins its group and keeps
//! doing so across any number of losses. The state machine takes events as
//! input and produces a new state plus a list of actions to execute.
//!
//! The actual I/O (scanning, syncing, joining) is performed by cast-stream,
//! not by this module. This enables instant unit testing without a radio.
//!
//! ```text
//! Idle -> Scanning -> PeerFound -> PaSyncing -> PaSynced -> AwaitingGroupInfo
//!      -> GroupJoining -> GroupLive -> GroupLost -> Teardown -> Scanning ...
//! ```
//!
//! Failures before the join go straight back to `Scanning`. Failures after
//! the join go through `Teardown`, which waits the settle delay first.

use std::time::Duration;

use cast_types::{
    AdvertisingReport, DisconnectReason, GroupDescriptor, GroupHandle, IdentityFilter,
    JoinParams, MemberMask, PeerInfo, SyncHandle,
};

use crate::session::{GroupSession, MemberUpdate};

/// Timeouts and targets for one receiving link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPolicy {
    /// Identity of the broadcaster to follow.
    pub filter: IdentityFilter,
    /// Members to join.
    pub required: MemberMask,
    /// How long to wait for a requested sync to establish.
    pub sync_timeout: Duration,
    /// Supervision timeout handed to the transport with the sync request.
    pub sync_supervision: Duration,
    /// How long to wait for a group descriptor once synced.
    pub group_info_timeout: Duration,
    /// How long to wait for the next member to connect during a join.
    pub member_timeout: Duration,
    /// Group synchronization timeout handed to the transport with the join.
    pub group_sync_timeout: Duration,
    /// Pause between tearing a group down and scanning again.
    pub settle_delay: Duration,
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self {
            filter: IdentityFilter::name("AliceISO"),
            required: MemberMask::first(1),
            sync_timeout: Duration::from_secs(2),
            sync_supervision: Duration::from_secs(4),
            group_info_timeout: Duration::from_secs(2),
            member_timeout: Duration::from_secs(10),
            group_sync_timeout: Duration::from_secs(3),
            settle_delay: Duration::from_secs(1),
        }
    }
}

/// Link state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Not looking for anything.
    Idle,
    /// Scanning for an advertiser matching the filter.
    Scanning,
    /// A match was found; the sync request is being issued.
    PeerFound {
        /// The matching advertiser.
        peer: PeerInfo,
    },
    /// Waiting for the periodic sync to establish.
    PaSyncing {
        /// The advertiser being synced to.
        peer: PeerInfo,
        /// Sync handle returned by the transport.
        sync: SyncHandle,
    },
    /// Synced; descriptor reports are being enabled.
    PaSynced {
        /// The advertiser.
        peer: PeerInfo,
        /// Established sync.
        sync: SyncHandle,
    },
    /// Waiting for the group descriptor.
    AwaitingGroupInfo {
        /// The advertiser.
        peer: PeerInfo,
        /// Established sync.
        sync: SyncHandle,
    },
    /// Join requested; waiting for every required member to connect.
    GroupJoining {
        /// Sync the group was found on.
        sync: SyncHandle,
        /// Descriptor the join is based on.
        descriptor: GroupDescriptor,
        /// Group handle, once the transport accepted the join.
        group: Option<GroupHandle>,
        /// Per-member readiness.
        session: GroupSession,
        /// Whether the sync was lost while joining.
        sync_lost: bool,
    },
    /// Every required member is connected; payloads flow.
    GroupLive {
        /// Sync the group was found on.
        sync: SyncHandle,
        /// Joined group.
        group: GroupHandle,
        /// Per-member state.
        session: GroupSession,
        /// Whether the sync was lost since the join.
        sync_lost: bool,
    },
    /// A required member was lost; the group is being terminated.
    GroupLost {
        /// Sync the group was found on.
        sync: SyncHandle,
        /// Group being terminated.
        group: GroupHandle,
        /// Whether the sync is already gone.
        sync_lost: bool,
    },
    /// Resources released; waiting out the settle delay.
    Teardown,
}

/// Fieldless view of [`LinkState`], for logs and status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    /// See [`LinkState::Idle`].
    Idle,
    /// See [`LinkState::Scanning`].
    Scanning,
    /// See [`LinkState::PeerFound`].
    PeerFound,
    /// See [`LinkState::PaSyncing`].
    PaSyncing,
    /// See [`LinkState::PaSynced`].
    PaSynced,
    /// See [`LinkState::AwaitingGroupInfo`].
    AwaitingGroupInfo,
    /// See [`LinkState::GroupJoining`].
    GroupJoining,
    /// See [`LinkState::GroupLive`].
    GroupLive,
    /// See [`LinkState::GroupLost`].
    GroupLost,
    /// See [`LinkState::Teardown`].
    Teardown,
}

impl SyncPhase {
    /// Short lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::PeerFound => "peer-found",
            Self::PaSyncing => "pa-syncing",
            Self::PaSynced => "pa-synced",
            Self::AwaitingGroupInfo => "awaiting-group-info",
            Self::GroupJoining => "group-joining",
            Self::GroupLive => "group-live",
            Self::GroupLost => "group-lost",
            Self::Teardown => "teardown",
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a link attempt is being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCause {
    /// A bounded wait expired.
    Timeout,
    /// The periodic sync was lost.
    SyncLost,
    /// The transport refused a request (or the descriptor did not fit).
    Rejected,
    /// A required member went away.
    MemberLost(DisconnectReason),
    /// A transport call failed outright.
    TransportFailure,
}

impl LinkState {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// The fieldless phase of this state.
    pub fn phase(&self) -> SyncPhase {
        match self {
            Self::Idle => SyncPhase::Idle,
            Self::Scanning => SyncPhase::Scanning,
            Self::PeerFound { .. } => SyncPhase::PeerFound,
            Self::PaSyncing { .. } => SyncPhase::PaSyncing,
            Self::PaSynced { .. } => SyncPhase::PaSynced,
            Self::AwaitingGroupInfo { .. } => SyncPhase::AwaitingGroupInfo,
            Self::GroupJoining { .. } => SyncPhase::GroupJoining,
            Self::GroupLive { .. } => SyncPhase::GroupLive,
            Self::GroupLost { .. } => SyncPhase::GroupLost,
            Self::Teardown => SyncPhase::Teardown,
        }
    }

    /// Check if payloads are flowing.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::GroupLive { .. })
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (cast-stream)
    /// is responsible for executing the returned actions, and for feeding
    /// the outcome of each transport call back in as an event.
    pub fn on_event(self, event: Event, policy: &LinkPolicy) -> (Self, Vec<Action>) {
        match (self, event) {
            // Stop wins from anywhere
            (state, Event::StopRequested) => (Self::Idle, state.release()),

            // From Idle
            (Self::Idle, Event::Start) => (Self::Scanning, vec![Action::StartScan]),

            // From Scanning
            (Self::Scanning, Event::Report(report)) => match matching_peer(&report, policy) {
                Some(peer) => (
                    Self::PeerFound { peer },
                    vec![
                        Action::StopScan,
                        Action::CreateSync {
                            peer,
                            timeout: policy.sync_supervision,
                        },
                        Action::Emit(LinkEvent::PeerFound { peer }),
                    ],
                ),
                None => (Self::Scanning, vec![]),
            },
            (Self::Scanning, Event::ScanFailed) => {
                teardown(policy, SyncPhase::Scanning, RetryCause::TransportFailure, vec![])
            }

            // From PeerFound
            (Self::PeerFound { peer }, Event::SyncCreated { sync }) => (
                Self::PaSyncing { peer, sync },
                vec![Action::ArmTimeout {
                    after: policy.sync_timeout,
                }],
            ),
            (Self::PeerFound { .. }, Event::SyncCreateFailed) => {
                rescan(SyncPhase::PeerFound, RetryCause::TransportFailure, None)
            }

            // From PaSyncing
            (Self::PaSyncing { peer, sync }, Event::Synced { sync: s }) if s == sync => (
                Self::PaSynced { peer, sync },
                vec![Action::DisarmTimeout, Action::EnableGroupInfo { sync }],
            ),
            (Self::PaSyncing { sync, .. }, Event::Timeout) => {
                rescan(SyncPhase::PaSyncing, RetryCause::Timeout, Some(sync))
            }
            (Self::PaSyncing { sync, .. }, Event::SyncLost { sync: s, .. }) if s == sync => {
                rescan(SyncPhase::PaSyncing, RetryCause::SyncLost, None)
            }

            // From PaSynced
            (Self::PaSynced { peer, sync }, Event::GroupInfoEnabled) => (
                Self::AwaitingGroupInfo { peer, sync },
                vec![Action::ArmTimeout {
                    after: policy.group_info_timeout,
                }],
            ),
            (Self::PaSynced { sync, .. }, Event::GroupInfoFailed) => {
                rescan(SyncPhase::PaSynced, RetryCause::TransportFailure, Some(sync))
            }
            (Self::PaSynced { sync, .. }, Event::SyncLost { sync: s, .. }) if s == sync => {
                rescan(SyncPhase::PaSynced, RetryCause::SyncLost, None)
            }

            // From AwaitingGroupInfo
            (Self::AwaitingGroupInfo { sync, .. }, Event::GroupInfo { sync: s, descriptor })
                if s == sync =>
            {
                if (descriptor.member_count as usize) < policy.required.span() {
                    return rescan(
                        SyncPhase::AwaitingGroupInfo,
                        RetryCause::Rejected,
                        Some(sync),
                    );
                }
                let session = GroupSession::new(descriptor.member_count as usize, policy.required);
                let params = JoinParams {
                    members: session.required(),
                    descriptor,
                    sync_timeout: policy.group_sync_timeout,
                };
                (
                    Self::GroupJoining {
                        sync,
                        descriptor,
                        group: None,
                        session,
                        sync_lost: false,
                    },
                    vec![Action::DisarmTimeout, Action::JoinGroup { sync, params }],
                )
            }
            (Self::AwaitingGroupInfo { sync, .. }, Event::Timeout) => {
                rescan(SyncPhase::AwaitingGroupInfo, RetryCause::Timeout, Some(sync))
            }
            (Self::AwaitingGroupInfo { sync, .. }, Event::SyncLost { sync: s, .. })
                if s == sync =>
            {
                rescan(SyncPhase::AwaitingGroupInfo, RetryCause::SyncLost, None)
            }

            // From GroupJoining
            (
                Self::GroupJoining {
                    sync,
                    descriptor,
                    group: None,
                    session,
                    sync_lost,
                },
                Event::JoinAccepted { group },
            ) => (
                Self::GroupJoining {
                    sync,
                    descriptor,
                    group: Some(group),
                    session,
                    sync_lost,
                },
                vec![Action::ArmTimeout {
                    after: policy.member_timeout,
                }],
            ),
            (
                Self::GroupJoining {
                    sync,
                    group: None,
                    sync_lost,
                    ..
                },
                Event::JoinRejected,
            ) => rescan(
                SyncPhase::GroupJoining,
                RetryCause::Rejected,
                (!sync_lost).then_some(sync),
            ),
            (
                Self::GroupJoining {
                    sync,
                    descriptor,
                    group: Some(group),
                    mut session,
                    sync_lost,
                },
                Event::MemberConnected { group: g, index },
            ) if g == group => match session.mark_connected(index) {
                MemberUpdate::BecameLive => (
                    Self::GroupLive {
                        sync,
                        group,
                        session: session.clone(),
                        sync_lost,
                    },
                    vec![
                        Action::DisarmTimeout,
                        Action::Emit(LinkEvent::Live {
                            group,
                            descriptor,
                            session,
                        }),
                    ],
                ),
                MemberUpdate::Connected => (
                    Self::GroupJoining {
                        sync,
                        descriptor,
                        group: Some(group),
                        session,
                        sync_lost,
                    },
                    vec![Action::ArmTimeout {
                        after: policy.member_timeout,
                    }],
                ),
                _ => (
                    Self::GroupJoining {
                        sync,
                        descriptor,
                        group: Some(group),
                        session,
                        sync_lost,
                    },
                    vec![],
                ),
            },
            (
                Self::GroupJoining {
                    sync,
                    descriptor,
                    group: Some(group),
                    mut session,
                    sync_lost,
                },
                Event::MemberDisconnected {
                    group: g,
                    index,
                    reason,
                },
            ) if g == group => match session.mark_disconnected(index, reason) {
                MemberUpdate::BecameLost => teardown(
                    policy,
                    SyncPhase::GroupJoining,
                    RetryCause::MemberLost(reason),
                    release_group(group, sync, sync_lost),
                ),
                _ => (
                    Self::GroupJoining {
                        sync,
                        descriptor,
                        group: Some(group),
                        session,
                        sync_lost,
                    },
                    vec![],
                ),
            },
            (
                Self::GroupJoining {
                    sync,
                    group,
                    sync_lost,
                    ..
                },
                Event::Timeout,
            ) => {
                let mut release = Vec::new();
                if let Some(group) = group {
                    release.push(Action::TerminateGroup { group });
                }
                if !sync_lost {
                    release.push(Action::DeleteSync { sync });
                }
                teardown(policy, SyncPhase::GroupJoining, RetryCause::Timeout, release)
            }
            (
                Self::GroupJoining {
                    sync,
                    descriptor,
                    group,
                    session,
                    ..
                },
                Event::SyncLost { sync: s, .. },
            ) if s == sync => (
                Self::GroupJoining {
                    sync,
                    descriptor,
                    group,
                    session,
                    sync_lost: true,
                },
                vec![],
            ),

            // From GroupLive
            (
                Self::GroupLive {
                    sync,
                    group,
                    mut session,
                    sync_lost,
                },
                Event::MemberDisconnected {
                    group: g,
                    index,
                    reason,
                },
            ) if g == group => match session.mark_disconnected(index, reason) {
                MemberUpdate::BecameLost => (
                    Self::GroupLost {
                        sync,
                        group,
                        sync_lost,
                    },
                    vec![
                        Action::TerminateGroup { group },
                        Action::Emit(LinkEvent::Lost {
                            group,
                            index,
                            reason,
                        }),
                    ],
                ),
                _ => (
                    Self::GroupLive {
                        sync,
                        group,
                        session,
                        sync_lost,
                    },
                    vec![],
                ),
            },
            (
                Self::GroupLive {
                    sync,
                    group,
                    session,
                    ..
                },
                Event::SyncLost { sync: s, .. },
            ) if s == sync => (
                Self::GroupLive {
                    sync,
                    group,
                    session,
                    sync_lost: true,
                },
                vec![],
            ),

            // From GroupLost
            (Self::GroupLost { sync, sync_lost, .. }, Event::GroupTerminated) => {
                let mut actions = Vec::new();
                if !sync_lost {
                    actions.push(Action::DeleteSync { sync });
                }
                actions.push(Action::ArmTimeout {
                    after: policy.settle_delay,
                });
                (Self::Teardown, actions)
            }
            (Self::GroupLost { sync, group, .. }, Event::SyncLost { sync: s, .. })
                if s == sync =>
            {
                (
                    Self::GroupLost {
                        sync,
                        group,
                        sync_lost: true,
                    },
                    vec![],
                )
            }

            // From Teardown: back through Idle into a fresh scan
            (Self::Teardown, Event::Timeout) => (Self::Scanning, vec![Action::StartScan]),

            // Invalid or stale transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Actions releasing whatever this state holds, for a stop request.
    fn release(self) -> Vec<Action> {
        match self {
            Self::Idle | Self::PeerFound { .. } => vec![],
            Self::Scanning => vec![Action::StopScan],
            Self::PaSyncing { sync, .. }
            | Self::PaSynced { sync, .. }
            | Self::AwaitingGroupInfo { sync, .. } => {
                vec![Action::DisarmTimeout, Action::DeleteSync { sync }]
            }
            Self::GroupJoining {
                sync,
                group,
                sync_lost,
                ..
            } => {
                let mut actions = vec![Action::DisarmTimeout];
                if let Some(group) = group {
                    actions.push(Action::TerminateGroup { group });
                }
                if !sync_lost {
                    actions.push(Action::DeleteSync { sync });
                }
                actions
            }
            Self::GroupLive {
                sync,
                group,
                sync_lost,
                ..
            } => release_group(group, sync, sync_lost),
            Self::GroupLost {
                sync, sync_lost, ..
            } => {
                if sync_lost {
                    vec![]
                } else {
                    vec![Action::DeleteSync { sync }]
                }
            }
            Self::Teardown => vec![Action::DisarmTimeout],
        }
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

/// Peer info for `report` if it matches the policy's filter.
fn matching_peer(report: &AdvertisingReport, policy: &LinkPolicy) -> Option<PeerInfo> {
    if policy.filter.matches(report) {
        report.peer_info()
    } else {
        None
    }
}

fn release_group(group: GroupHandle, sync: SyncHandle, sync_lost: bool) -> Vec<Action> {
    let mut actions = vec![Action::TerminateGroup { group }];
    if !sync_lost {
        actions.push(Action::DeleteSync { sync });
    }
    actions
}

/// Abandon a pre-join attempt and scan again right away.
fn rescan(
    phase: SyncPhase,
    cause: RetryCause,
    delete: Option<SyncHandle>,
) -> (LinkState, Vec<Action>) {
    let mut actions = vec![Action::DisarmTimeout];
    if let Some(sync) = delete {
        actions.push(Action::DeleteSync { sync });
    }
    actions.push(Action::Emit(LinkEvent::Retrying { phase, cause }));
    actions.push(Action::StartScan);
    (LinkState::Scanning, actions)
}

/// Release `release`, then wait out the settle delay before scanning again.
fn teardown(
    policy: &LinkPolicy,
    phase: SyncPhase,
    cause: RetryCause,
    release: Vec<Action>,
) -> (LinkState, Vec<Action>) {
    let mut actions = release;
    actions.push(Action::Emit(LinkEvent::Retrying { phase, cause }));
    actions.push(Action::ArmTimeout {
        after: policy.settle_delay,
    });
    (LinkState::Teardown, actions)
}

/// Events that drive the link lifecycle.
///
/// Transport notifications map onto these directly; the remaining ones are
/// the outcomes of the transport calls requested by [`Action`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Begin looking for the broadcaster.
    Start,
    /// A scan report arrived.
    Report(AdvertisingReport),
    /// The scan could not be started.
    ScanFailed,
    /// The transport accepted a sync request.
    SyncCreated {
        /// Handle of the pending sync.
        sync: SyncHandle,
    },
    /// The transport refused a sync request.
    SyncCreateFailed,
    /// A sync was established.
    Synced {
        /// The sync.
        sync: SyncHandle,
    },
    /// A sync was lost or terminated.
    SyncLost {
        /// The sync.
        sync: SyncHandle,
        /// Why.
        reason: DisconnectReason,
    },
    /// Descriptor reports were enabled.
    GroupInfoEnabled,
    /// Descriptor reports could not be enabled.
    GroupInfoFailed,
    /// A group descriptor arrived.
    GroupInfo {
        /// Sync it arrived on.
        sync: SyncHandle,
        /// The descriptor.
        descriptor: GroupDescriptor,
    },
    /// The transport accepted a join request.
    JoinAccepted {
        /// Handle of the group being joined.
        group: GroupHandle,
    },
    /// The transport refused a join request.
    JoinRejected,
    /// A member channel connected.
    MemberConnected {
        /// The group.
        group: GroupHandle,
        /// Member index.
        index: usize,
    },
    /// A member channel disconnected.
    MemberDisconnected {
        /// The group.
        group: GroupHandle,
        /// Member index.
        index: usize,
        /// Why.
        reason: DisconnectReason,
    },
    /// A group terminate call finished (successfully or not).
    GroupTerminated,
    /// The armed timeout expired.
    Timeout,
    /// Stop following the broadcaster.
    StopRequested,
}

/// Actions to be executed by the link driver.
///
/// These are instructions, not side effects. The driver interprets these
/// and performs the actual transport calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start scanning.
    StartScan,
    /// Stop scanning.
    StopScan,
    /// Request a periodic sync to `peer`.
    CreateSync {
        /// The advertiser.
        peer: PeerInfo,
        /// Supervision timeout for the sync.
        timeout: Duration,
    },
    /// Delete a sync (established or pending).
    DeleteSync {
        /// The sync.
        sync: SyncHandle,
    },
    /// Enable descriptor reports on a sync.
    EnableGroupInfo {
        /// The sync.
        sync: SyncHandle,
    },
    /// Request to join a group.
    JoinGroup {
        /// Sync the group was found on.
        sync: SyncHandle,
        /// Join parameters.
        params: JoinParams,
    },
    /// Terminate a group (joined or pending).
    TerminateGroup {
        /// The group.
        group: GroupHandle,
    },
    /// (Re)arm the single phase timeout.
    ArmTimeout {
        /// Delay until [`Event::Timeout`].
        after: Duration,
    },
    /// Cancel the phase timeout.
    DisarmTimeout,
    /// Emit an event to the application.
    Emit(LinkEvent),
}

/// Events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A matching broadcaster was found.
    PeerFound {
        /// The advertiser.
        peer: PeerInfo,
    },
    /// Every required member connected.
    Live {
        /// Joined group.
        group: GroupHandle,
        /// Its descriptor.
        descriptor: GroupDescriptor,
        /// Member state at the moment the group went live.
        session: GroupSession,
    },
    /// A required member was lost.
    Lost {
        /// The group.
        group: GroupHandle,
        /// Member that went away.
        index: usize,
        /// Why.
        reason: DisconnectReason,
    },
    /// The current attempt was abandoned and will be retried.
    Retrying {
        /// Phase the attempt failed in.
        phase: SyncPhase,
        /// Why it failed.
        cause: RetryCause,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use cast_types::{adv, AddressKind, Framing, PeerAddress, Phy, SecondaryId};

    const SYNC: SyncHandle = SyncHandle::new(1);
    const GROUP: GroupHandle = GroupHandle::new(7);

    fn policy(members: usize) -> LinkPolicy {
        LinkPolicy {
            required: MemberMask::first(members),
            ..LinkPolicy::default()
        }
    }

    fn report(name: &str, periodic_interval: u16) -> AdvertisingReport {
        let mut data = vec![0x02, adv::AD_FLAGS, 0x06];
        adv::push_name(&mut data, name).unwrap();
        AdvertisingReport {
            address: PeerAddress::new(AddressKind::Random, [0xC0, 1, 2, 3, 4, 5]),
            sid: SecondaryId::new(0).unwrap(),
            periodic_interval,
            data,
        }
    }

    fn descriptor(member_count: u8) -> GroupDescriptor {
        GroupDescriptor {
            member_count,
            sdu_interval: Duration::from_millis(10),
            max_sdu: 160,
            iso_interval: Duration::from_millis(10),
            framing: Framing::Unframed,
            phy: Phy::Le2M,
            encrypted: false,
        }
    }

    fn drive(
        state: LinkState,
        events: impl IntoIterator<Item = Event>,
        policy: &LinkPolicy,
    ) -> (LinkState, Vec<Action>) {
        let mut state = state;
        let mut all = Vec::new();
        for event in events {
            let (next, actions) = state.on_event(event, policy);
            state = next;
            all.extend(actions);
        }
        (state, all)
    }

    /// Drive a fresh machine up to GroupJoining with the join accepted.
    fn joining(policy: &LinkPolicy, member_count: u8) -> LinkState {
        let (state, _) = drive(
            LinkState::new(),
            [
                Event::Start,
                Event::Report(report("AliceISO", 48)),
                Event::SyncCreated { sync: SYNC },
                Event::Synced { sync: SYNC },
                Event::GroupInfoEnabled,
                Event::GroupInfo {
                    sync: SYNC,
                    descriptor: descriptor(member_count),
                },
                Event::JoinAccepted { group: GROUP },
            ],
            policy,
        );
        assert_eq!(state.phase(), SyncPhase::GroupJoining);
        state
    }

    fn live(policy: &LinkPolicy, member_count: u8) -> LinkState {
        let events = (0..member_count as usize).map(|index| Event::MemberConnected {
            group: GROUP,
            index,
        });
        let (state, _) = drive(joining(policy, member_count), events, policy);
        assert!(state.is_live());
        state
    }

    #[test]
    fn starts_idle() {
        assert_eq!(LinkState::new(), LinkState::Idle);
    }

    #[test]
    fn start_begins_scanning() {
        let (state, actions) = LinkState::Idle.on_event(Event::Start, &policy(1));
        assert_eq!(state, LinkState::Scanning);
        assert_eq!(actions, vec![Action::StartScan]);
    }

    #[test]
    fn first_matching_report_wins() {
        let policy = policy(1);
        let (state, actions) =
            LinkState::Scanning.on_event(Event::Report(report("AliceISO", 48)), &policy);

        let LinkState::PeerFound { peer } = state else {
            panic!("expected PeerFound, got {:?}", state);
        };
        assert_eq!(peer.interval, Duration::from_millis(60));
        assert_eq!(actions[0], Action::StopScan);
        assert!(matches!(actions[1], Action::CreateSync { timeout, .. } if timeout == Duration::from_secs(4)));

        // A repeat advert from the same peer is not processed again.
        let (state, actions) = state.on_event(Event::Report(report("AliceISO", 48)), &policy);
        assert_eq!(state.phase(), SyncPhase::PeerFound);
        assert!(actions.is_empty());
    }

    #[test]
    fn peer_never_found_stays_scanning() {
        let policy = policy(1);
        let mut state = LinkState::Scanning;
        for i in 0..1000u16 {
            let event = match i % 4 {
                0 => Event::Report(report("Mallory", 48)),
                1 => Event::Report(report("AliceISO", 0)),
                2 => Event::Report(report("AliceISO2", 48)),
                _ => Event::Synced { sync: SYNC },
            };
            let (next, actions) = state.on_event(event, &policy);
            assert_eq!(next, LinkState::Scanning);
            assert!(actions.is_empty());
            state = next;
        }
    }

    #[test]
    fn sync_create_failure_rescans() {
        let policy = policy(1);
        let (state, actions) = drive(
            LinkState::Scanning,
            [Event::Report(report("AliceISO", 48)), Event::SyncCreateFailed],
            &policy,
        );
        assert_eq!(state, LinkState::Scanning);
        assert_eq!(actions.last(), Some(&Action::StartScan));
    }

    #[test]
    fn sync_timeout_deletes_half_open_sync() {
        let policy = policy(1);
        let (state, actions) = drive(
            LinkState::Scanning,
            [
                Event::Report(report("AliceISO", 48)),
                Event::SyncCreated { sync: SYNC },
                Event::Timeout,
            ],
            &policy,
        );
        assert_eq!(state, LinkState::Scanning);
        assert!(actions.contains(&Action::DeleteSync { sync: SYNC }));
        assert!(actions.contains(&Action::Emit(LinkEvent::Retrying {
            phase: SyncPhase::PaSyncing,
            cause: RetryCause::Timeout,
        })));
    }

    #[test]
    fn synced_enables_group_info() {
        let policy = policy(1);
        let (state, actions) = drive(
            LinkState::Scanning,
            [
                Event::Report(report("AliceISO", 48)),
                Event::SyncCreated { sync: SYNC },
                Event::Synced { sync: SYNC },
            ],
            &policy,
        );
        assert_eq!(state.phase(), SyncPhase::PaSynced);
        assert!(actions.contains(&Action::EnableGroupInfo { sync: SYNC }));

        let (state, actions) = state.on_event(Event::GroupInfoEnabled, &policy);
        assert_eq!(state.phase(), SyncPhase::AwaitingGroupInfo);
        assert_eq!(
            actions,
            vec![Action::ArmTimeout {
                after: Duration::from_secs(2)
            }]
        );
    }

    #[test]
    fn sync_lost_while_awaiting_info_abandons_without_delete() {
        let policy = policy(1);
        let state = LinkState::AwaitingGroupInfo {
            peer: report("AliceISO", 48).peer_info().unwrap(),
            sync: SYNC,
        };
        let (state, actions) = state.on_event(
            Event::SyncLost {
                sync: SYNC,
                reason: DisconnectReason::SupervisionTimeout,
            },
            &policy,
        );
        assert_eq!(state, LinkState::Scanning);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::DeleteSync { .. })));
    }

    #[test]
    fn group_info_timeout_rescans() {
        let policy = policy(1);
        let state = LinkState::AwaitingGroupInfo {
            peer: report("AliceISO", 48).peer_info().unwrap(),
            sync: SYNC,
        };
        let (state, actions) = state.on_event(Event::Timeout, &policy);
        assert_eq!(state, LinkState::Scanning);
        assert!(actions.contains(&Action::DeleteSync { sync: SYNC }));
    }

    #[test]
    fn undersized_descriptor_is_rejected() {
        let policy = policy(2);
        let state = LinkState::AwaitingGroupInfo {
            peer: report("AliceISO", 48).peer_info().unwrap(),
            sync: SYNC,
        };
        let (state, actions) = state.on_event(
            Event::GroupInfo {
                sync: SYNC,
                descriptor: descriptor(1),
            },
            &policy,
        );
        assert_eq!(state, LinkState::Scanning);
        assert!(actions.contains(&Action::Emit(LinkEvent::Retrying {
            phase: SyncPhase::AwaitingGroupInfo,
            cause: RetryCause::Rejected,
        })));
    }

    #[test]
    fn descriptor_requests_join_of_required_members() {
        let policy = policy(2);
        let state = LinkState::AwaitingGroupInfo {
            peer: report("AliceISO", 48).peer_info().unwrap(),
            sync: SYNC,
        };
        let (state, actions) = state.on_event(
            Event::GroupInfo {
                sync: SYNC,
                descriptor: descriptor(3),
            },
            &policy,
        );
        assert_eq!(state.phase(), SyncPhase::GroupJoining);
        let join = actions.iter().find_map(|a| match a {
            Action::JoinGroup { params, .. } => Some(*params),
            _ => None,
        });
        let params = join.unwrap();
        assert_eq!(params.members, MemberMask::first(2));
        assert_eq!(params.sync_timeout, Duration::from_secs(3));
    }

    #[test]
    fn join_rejection_rescans() {
        let policy = policy(1);
        let state = LinkState::GroupJoining {
            sync: SYNC,
            descriptor: descriptor(1),
            group: None,
            session: GroupSession::new(1, MemberMask::first(1)),
            sync_lost: false,
        };
        let (state, actions) = state.on_event(Event::JoinRejected, &policy);
        assert_eq!(state, LinkState::Scanning);
        assert!(actions.contains(&Action::DeleteSync { sync: SYNC }));
    }

    #[test]
    fn live_exactly_once_in_any_connect_order() {
        let policy = policy(3);
        for order in [[0, 1, 2], [2, 1, 0], [1, 2, 0], [0, 2, 1]] {
            let mut state = joining(&policy, 3);
            let mut live_events = 0;
            for index in order.into_iter().chain([1, 0]) {
                let (next, actions) =
                    state.on_event(Event::MemberConnected { group: GROUP, index }, &policy);
                live_events += actions
                    .iter()
                    .filter(|a| matches!(a, Action::Emit(LinkEvent::Live { .. })))
                    .count();
                state = next;
            }
            assert_eq!(live_events, 1, "order {:?}", order);
            assert!(state.is_live());
        }
    }

    #[test]
    fn each_connect_rearms_member_timeout() {
        let policy = policy(2);
        let (state, actions) = joining(&policy, 2)
            .on_event(Event::MemberConnected { group: GROUP, index: 0 }, &policy);
        assert_eq!(state.phase(), SyncPhase::GroupJoining);
        assert_eq!(
            actions,
            vec![Action::ArmTimeout {
                after: Duration::from_secs(10)
            }]
        );
    }

    #[test]
    fn partial_join_timeout_tears_down_whole_group() {
        let policy = policy(2);
        let (state, actions) = drive(
            joining(&policy, 2),
            [
                Event::MemberConnected { group: GROUP, index: 0 },
                Event::Timeout,
            ],
            &policy,
        );
        assert_eq!(state, LinkState::Teardown);
        assert!(actions.contains(&Action::TerminateGroup { group: GROUP }));
        assert!(actions.contains(&Action::DeleteSync { sync: SYNC }));
        assert_eq!(
            actions.last(),
            Some(&Action::ArmTimeout {
                after: Duration::from_secs(1)
            })
        );

        let (state, actions) = state.on_event(Event::Timeout, &policy);
        assert_eq!(state, LinkState::Scanning);
        assert_eq!(actions, vec![Action::StartScan]);
    }

    #[test]
    fn loss_while_live_goes_through_teardown_to_scanning() {
        let policy = policy(2);
        let state = live(&policy, 2);

        let (state, actions) = state.on_event(
            Event::MemberDisconnected {
                group: GROUP,
                index: 1,
                reason: DisconnectReason::SupervisionTimeout,
            },
            &policy,
        );
        assert_eq!(state.phase(), SyncPhase::GroupLost);
        assert!(actions.contains(&Action::TerminateGroup { group: GROUP }));

        let (state, actions) = state.on_event(Event::GroupTerminated, &policy);
        assert_eq!(state, LinkState::Teardown);
        assert!(actions.contains(&Action::DeleteSync { sync: SYNC }));

        let (state, _) = state.on_event(Event::Timeout, &policy);
        assert_eq!(state, LinkState::Scanning);
    }

    #[test]
    fn local_cancel_does_not_lose_group() {
        let policy = policy(1);
        let (state, actions) = live(&policy, 1).on_event(
            Event::MemberDisconnected {
                group: GROUP,
                index: 0,
                reason: DisconnectReason::LocalCancel,
            },
            &policy,
        );
        assert!(state.is_live());
        assert!(actions.is_empty());
    }

    #[test]
    fn sync_lost_while_live_skips_delete() {
        let policy = policy(1);
        let (state, actions) = drive(
            live(&policy, 1),
            [
                Event::SyncLost {
                    sync: SYNC,
                    reason: DisconnectReason::SupervisionTimeout,
                },
                Event::MemberDisconnected {
                    group: GROUP,
                    index: 0,
                    reason: DisconnectReason::RemoteTerminated,
                },
                Event::GroupTerminated,
            ],
            &policy,
        );
        assert_eq!(state, LinkState::Teardown);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::DeleteSync { .. })));
    }

    #[test]
    fn stale_handles_are_ignored() {
        let policy = policy(1);
        let other_sync = SyncHandle::new(99);
        let other_group = GroupHandle::new(99);

        let state = joining(&policy, 1);
        let stale = [
            Event::Synced { sync: other_sync },
            Event::SyncLost {
                sync: other_sync,
                reason: DisconnectReason::SupervisionTimeout,
            },
            Event::GroupInfo {
                sync: other_sync,
                descriptor: descriptor(1),
            },
            Event::MemberConnected {
                group: other_group,
                index: 0,
            },
            Event::MemberDisconnected {
                group: other_group,
                index: 0,
                reason: DisconnectReason::SupervisionTimeout,
            },
        ];
        for event in stale {
            let (next, actions) = state.clone().on_event(event, &policy);
            assert_eq!(next, state);
            assert!(actions.is_empty());
        }

        let live_state = live(&policy, 1);
        let (next, actions) = live_state.clone().on_event(
            Event::MemberDisconnected {
                group: other_group,
                index: 0,
                reason: DisconnectReason::SupervisionTimeout,
            },
            &policy,
        );
        assert_eq!(next, live_state);
        assert!(actions.is_empty());
    }

    #[test]
    fn stop_from_every_state_ends_idle() {
        let policy = policy(1);
        let peer = report("AliceISO", 48).peer_info().unwrap();
        let states = vec![
            LinkState::Idle,
            LinkState::Scanning,
            LinkState::PeerFound { peer },
            LinkState::PaSyncing { peer, sync: SYNC },
            LinkState::PaSynced { peer, sync: SYNC },
            LinkState::AwaitingGroupInfo { peer, sync: SYNC },
            joining(&policy, 1),
            live(&policy, 1),
            LinkState::GroupLost {
                sync: SYNC,
                group: GROUP,
                sync_lost: false,
            },
            LinkState::Teardown,
        ];
        for state in states {
            let phase = state.phase();
            let (next, actions) = state.on_event(Event::StopRequested, &policy);
            assert_eq!(next, LinkState::Idle, "from {}", phase);
            match phase {
                SyncPhase::Scanning => assert_eq!(actions, vec![Action::StopScan]),
                SyncPhase::PaSyncing | SyncPhase::PaSynced | SyncPhase::AwaitingGroupInfo => {
                    assert!(actions.contains(&Action::DeleteSync { sync: SYNC }))
                }
                SyncPhase::GroupJoining | SyncPhase::GroupLive => {
                    assert!(actions.contains(&Action::TerminateGroup { group: GROUP }));
                    assert!(actions.contains(&Action::DeleteSync { sync: SYNC }));
                }
                _ => {}
            }
        }
    }

    #[test]
    fn idle_ignores_everything_but_start() {
        let policy = policy(1);
        for event in [
            Event::Timeout,
            Event::Report(report("AliceISO", 48)),
            Event::GroupTerminated,
        ] {
            let (state, actions) = LinkState::Idle.on_event(event, &policy);
            assert_eq!(state, LinkState::Idle);
            assert!(actions.is_empty());
        }
    }

    #[test]
    fn phase_names() {
        assert_eq!(SyncPhase::AwaitingGroupInfo.to_string(), "awaiting-group-info");
        assert_eq!(LinkState::Teardown.phase().as_str(), "teardown");
    }
}
