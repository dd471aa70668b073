//! Host lifecycle machine for isocast broadcasters.
//!
//! Pure counterpart of [`crate::state`] for the sending side: advertise the
//! identity, create the group, wait for every member, stream until a member
//! is lost, then recreate the group. Advertising keeps running across group
//! recreations.

use std::time::Duration;

use cast_types::{
    AdvertisingParams, DisconnectReason, GroupHandle, GroupParams, MemberMask, SecondaryId,
};

use crate::session::{GroupSession, MemberUpdate};
use crate::state::RetryCause;

/// Identity, group shape and timeouts for one broadcasting host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPolicy {
    /// Advertising set to run.
    pub advertising: AdvertisingParams,
    /// Group to create.
    pub group: GroupParams,
    /// How long to wait for the next member to connect.
    pub member_timeout: Duration,
    /// Pause before retrying after a failure or loss.
    pub settle_delay: Duration,
}

impl Default for HostPolicy {
    fn default() -> Self {
        Self {
            advertising: AdvertisingParams {
                name: "AliceISO".to_string(),
                sid: SecondaryId::default(),
                ext_interval: Duration::from_millis(50),
                periodic_interval: Duration::from_millis(60),
            },
            group: GroupParams {
                member_count: 1,
                sdu_interval: Duration::from_millis(10),
                max_sdu: 160,
                latency: Duration::from_millis(10),
                retransmissions: 1,
                phy: cast_types::Phy::Le2M,
                packing: cast_types::Packing::Sequential,
                framing: cast_types::Framing::Unframed,
            },
            member_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(1),
        }
    }
}

/// Host state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostState {
    /// Not advertising.
    Idle,
    /// Advertising requested or running; the group is being created.
    Advertising,
    /// Group created; waiting for every member to connect.
    GroupCreating {
        /// The group.
        group: GroupHandle,
        /// Per-member readiness.
        session: GroupSession,
    },
    /// Every member connected; SDUs may be sent.
    GroupLive {
        /// The group.
        group: GroupHandle,
        /// Per-member state.
        session: GroupSession,
    },
    /// The group is being terminated.
    GroupLost {
        /// Group being terminated.
        group: GroupHandle,
    },
    /// Waiting out the settle delay.
    Teardown {
        /// Whether advertising is still running.
        advertising: bool,
    },
}

/// Fieldless view of [`HostState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostPhase {
    /// See [`HostState::Idle`].
    Idle,
    /// See [`HostState::Advertising`].
    Advertising,
    /// See [`HostState::GroupCreating`].
    GroupCreating,
    /// See [`HostState::GroupLive`].
    GroupLive,
    /// See [`HostState::GroupLost`].
    GroupLost,
    /// See [`HostState::Teardown`].
    Teardown,
}

impl HostPhase {
    /// Short lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Advertising => "advertising",
            Self::GroupCreating => "group-creating",
            Self::GroupLive => "group-live",
            Self::GroupLost => "group-lost",
            Self::Teardown => "teardown",
        }
    }
}

impl std::fmt::Display for HostPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl HostState {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// The fieldless phase of this state.
    pub fn phase(&self) -> HostPhase {
        match self {
            Self::Idle => HostPhase::Idle,
            Self::Advertising => HostPhase::Advertising,
            Self::GroupCreating { .. } => HostPhase::GroupCreating,
            Self::GroupLive { .. } => HostPhase::GroupLive,
            Self::GroupLost { .. } => HostPhase::GroupLost,
            Self::Teardown { .. } => HostPhase::Teardown,
        }
    }

    /// Check if SDUs may be sent.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::GroupLive { .. })
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects.
    pub fn on_event(self, event: HostEvent, policy: &HostPolicy) -> (Self, Vec<HostAction>) {
        match (self, event) {
            (state, HostEvent::StopRequested) => (Self::Idle, state.release()),

            // From Idle
            (Self::Idle, HostEvent::Start) => (
                Self::Advertising,
                vec![HostAction::StartAdvertising(policy.advertising.clone())],
            ),

            // From Advertising
            (Self::Advertising, HostEvent::AdvertisingStarted) => (
                Self::Advertising,
                vec![
                    HostAction::Emit(HostNotice::Advertising),
                    HostAction::CreateGroup(policy.group),
                ],
            ),
            (Self::Advertising, HostEvent::AdvertisingFailed) => settle(
                policy,
                false,
                HostPhase::Advertising,
                RetryCause::TransportFailure,
            ),
            (Self::Advertising, HostEvent::GroupCreated { group }) => {
                let count = policy.group.member_count as usize;
                (
                    Self::GroupCreating {
                        group,
                        session: GroupSession::new(count, MemberMask::first(count)),
                    },
                    vec![HostAction::ArmTimeout {
                        after: policy.member_timeout,
                    }],
                )
            }
            (Self::Advertising, HostEvent::GroupCreateFailed) => settle(
                policy,
                true,
                HostPhase::Advertising,
                RetryCause::TransportFailure,
            ),

            // From GroupCreating
            (
                Self::GroupCreating { group, mut session },
                HostEvent::MemberConnected { group: g, index },
            ) if g == group => match session.mark_connected(index) {
                MemberUpdate::BecameLive => (
                    Self::GroupLive {
                        group,
                        session: session.clone(),
                    },
                    vec![
                        HostAction::SetupDataPath { group, index },
                        HostAction::DisarmTimeout,
                        HostAction::Emit(HostNotice::Live { group, session }),
                    ],
                ),
                MemberUpdate::Connected => (
                    Self::GroupCreating { group, session },
                    vec![
                        HostAction::SetupDataPath { group, index },
                        HostAction::ArmTimeout {
                            after: policy.member_timeout,
                        },
                    ],
                ),
                _ => (Self::GroupCreating { group, session }, vec![]),
            },
            (
                Self::GroupCreating { group, mut session },
                HostEvent::MemberDisconnected {
                    group: g,
                    index,
                    reason,
                },
            ) if g == group => match session.mark_disconnected(index, reason) {
                MemberUpdate::BecameLost => lose(
                    group,
                    HostNotice::Retrying {
                        phase: HostPhase::GroupCreating,
                        cause: RetryCause::MemberLost(reason),
                    },
                ),
                _ => (Self::GroupCreating { group, session }, vec![]),
            },
            (Self::GroupCreating { group, .. }, HostEvent::Timeout) => lose(
                group,
                HostNotice::Retrying {
                    phase: HostPhase::GroupCreating,
                    cause: RetryCause::Timeout,
                },
            ),
            (Self::GroupCreating { group, .. }, HostEvent::DataPathFailed { group: g, .. })
                if g == group =>
            {
                lose(
                    group,
                    HostNotice::Retrying {
                        phase: HostPhase::GroupCreating,
                        cause: RetryCause::TransportFailure,
                    },
                )
            }

            // From GroupLive
            (
                Self::GroupLive { group, mut session },
                HostEvent::MemberDisconnected {
                    group: g,
                    index,
                    reason,
                },
            ) if g == group => match session.mark_disconnected(index, reason) {
                MemberUpdate::BecameLost => lose(
                    group,
                    HostNotice::Lost {
                        group,
                        index,
                        reason,
                    },
                ),
                _ => (Self::GroupLive { group, session }, vec![]),
            },
            (Self::GroupLive { group, .. }, HostEvent::DataPathFailed { group: g, .. })
                if g == group =>
            {
                lose(
                    group,
                    HostNotice::Retrying {
                        phase: HostPhase::GroupLive,
                        cause: RetryCause::TransportFailure,
                    },
                )
            }

            // From GroupLost
            (Self::GroupLost { .. }, HostEvent::GroupTerminated) => (
                Self::Teardown { advertising: true },
                vec![HostAction::ArmTimeout {
                    after: policy.settle_delay,
                }],
            ),

            // From Teardown
            (Self::Teardown { advertising: true }, HostEvent::Timeout) => (
                Self::Advertising,
                vec![HostAction::CreateGroup(policy.group)],
            ),
            (Self::Teardown { advertising: false }, HostEvent::Timeout) => (
                Self::Advertising,
                vec![HostAction::StartAdvertising(policy.advertising.clone())],
            ),

            // Invalid or stale transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    fn release(self) -> Vec<HostAction> {
        match self {
            Self::Idle => vec![],
            Self::Advertising | Self::GroupLost { .. } => vec![HostAction::StopAdvertising],
            Self::GroupCreating { group, .. } | Self::GroupLive { group, .. } => vec![
                HostAction::DisarmTimeout,
                HostAction::TerminateGroup { group },
                HostAction::StopAdvertising,
            ],
            Self::Teardown { advertising } => {
                let mut actions = vec![HostAction::DisarmTimeout];
                if advertising {
                    actions.push(HostAction::StopAdvertising);
                }
                actions
            }
        }
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminate `group` and report why.
fn lose(group: GroupHandle, notice: HostNotice) -> (HostState, Vec<HostAction>) {
    (
        HostState::GroupLost { group },
        vec![
            HostAction::DisarmTimeout,
            HostAction::TerminateGroup { group },
            HostAction::Emit(notice),
        ],
    )
}

fn settle(
    policy: &HostPolicy,
    advertising: bool,
    phase: HostPhase,
    cause: RetryCause,
) -> (HostState, Vec<HostAction>) {
    (
        HostState::Teardown { advertising },
        vec![
            HostAction::Emit(HostNotice::Retrying { phase, cause }),
            HostAction::ArmTimeout {
                after: policy.settle_delay,
            },
        ],
    )
}

/// Events that drive the host lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Begin advertising.
    Start,
    /// Advertising is running.
    AdvertisingStarted,
    /// Advertising could not be started.
    AdvertisingFailed,
    /// The transport created the group.
    GroupCreated {
        /// The new group.
        group: GroupHandle,
    },
    /// The transport could not create the group.
    GroupCreateFailed,
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
    /// A member's data path could not be set up.
    DataPathFailed {
        /// The group.
        group: GroupHandle,
        /// Member index.
        index: usize,
    },
    /// A group terminate call finished.
    GroupTerminated,
    /// The armed timeout expired.
    Timeout,
    /// Stop broadcasting.
    StopRequested,
}

/// Actions to be executed by the host driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAction {
    /// Start extended and periodic advertising.
    StartAdvertising(AdvertisingParams),
    /// Stop advertising.
    StopAdvertising,
    /// Create the broadcast group.
    CreateGroup(GroupParams),
    /// Bind member `index` to the host-to-controller data path.
    SetupDataPath {
        /// The group.
        group: GroupHandle,
        /// Member index.
        index: usize,
    },
    /// Terminate the group.
    TerminateGroup {
        /// The group.
        group: GroupHandle,
    },
    /// (Re)arm the single phase timeout.
    ArmTimeout {
        /// Delay until [`HostEvent::Timeout`].
        after: Duration,
    },
    /// Cancel the phase timeout.
    DisarmTimeout,
    /// Emit a notice to the application.
    Emit(HostNotice),
}

/// Notices emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostNotice {
    /// Advertising is running.
    Advertising,
    /// Every member connected.
    Live {
        /// The group.
        group: GroupHandle,
        /// Member state at the moment the group went live.
        session: GroupSession,
    },
    /// A member was lost.
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
        phase: HostPhase,
        /// Why it failed.
        cause: RetryCause,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP: GroupHandle = GroupHandle::new(3);

    fn policy(members: u8) -> HostPolicy {
        let mut policy = HostPolicy::default();
        policy.group.member_count = members;
        policy
    }

    fn creating(policy: &HostPolicy) -> HostState {
        let mut state = HostState::new();
        for event in [
            HostEvent::Start,
            HostEvent::AdvertisingStarted,
            HostEvent::GroupCreated { group: GROUP },
        ] {
            state = state.on_event(event, policy).0;
        }
        assert_eq!(state.phase(), HostPhase::GroupCreating);
        state
    }

    #[test]
    fn start_advertises_then_creates_group() {
        let policy = policy(1);
        let (state, actions) = HostState::new().on_event(HostEvent::Start, &policy);
        assert_eq!(state, HostState::Advertising);
        assert_eq!(
            actions,
            vec![HostAction::StartAdvertising(policy.advertising.clone())]
        );

        let (state, actions) = state.on_event(HostEvent::AdvertisingStarted, &policy);
        assert_eq!(state, HostState::Advertising);
        assert!(actions.contains(&HostAction::CreateGroup(policy.group)));
    }

    #[test]
    fn every_connect_sets_up_data_path_before_live() {
        let policy = policy(2);
        let (state, actions) = creating(&policy)
            .on_event(HostEvent::MemberConnected { group: GROUP, index: 1 }, &policy);
        assert_eq!(state.phase(), HostPhase::GroupCreating);
        assert_eq!(actions[0], HostAction::SetupDataPath { group: GROUP, index: 1 });

        let (state, actions) =
            state.on_event(HostEvent::MemberConnected { group: GROUP, index: 0 }, &policy);
        assert!(state.is_live());
        assert_eq!(actions[0], HostAction::SetupDataPath { group: GROUP, index: 0 });
        assert!(matches!(actions.last(), Some(HostAction::Emit(HostNotice::Live { .. }))));
    }

    #[test]
    fn member_timeout_recreates_group_without_restarting_advertising() {
        let policy = policy(2);
        let (state, actions) = creating(&policy).on_event(HostEvent::Timeout, &policy);
        assert_eq!(state, HostState::GroupLost { group: GROUP });
        assert!(actions.contains(&HostAction::TerminateGroup { group: GROUP }));

        let (state, _) = state.on_event(HostEvent::GroupTerminated, &policy);
        assert_eq!(state, HostState::Teardown { advertising: true });

        let (state, actions) = state.on_event(HostEvent::Timeout, &policy);
        assert_eq!(state, HostState::Advertising);
        assert_eq!(actions, vec![HostAction::CreateGroup(policy.group)]);
    }

    #[test]
    fn data_path_failure_on_last_member_drops_live_group() {
        let policy = policy(1);
        let (state, _) = creating(&policy)
            .on_event(HostEvent::MemberConnected { group: GROUP, index: 0 }, &policy);
        assert!(state.is_live());

        let (state, actions) =
            state.on_event(HostEvent::DataPathFailed { group: GROUP, index: 0 }, &policy);
        assert_eq!(state, HostState::GroupLost { group: GROUP });
        assert!(actions.contains(&HostAction::TerminateGroup { group: GROUP }));
    }

    #[test]
    fn loss_while_live_terminates_group() {
        let policy = policy(1);
        let (state, _) = creating(&policy)
            .on_event(HostEvent::MemberConnected { group: GROUP, index: 0 }, &policy);
        let (state, actions) = state.on_event(
            HostEvent::MemberDisconnected {
                group: GROUP,
                index: 0,
                reason: DisconnectReason::SupervisionTimeout,
            },
            &policy,
        );
        assert_eq!(state.phase(), HostPhase::GroupLost);
        assert!(actions.contains(&HostAction::Emit(HostNotice::Lost {
            group: GROUP,
            index: 0,
            reason: DisconnectReason::SupervisionTimeout,
        })));
    }

    #[test]
    fn local_cancel_while_live_is_not_a_loss() {
        let policy = policy(1);
        let (state, _) = creating(&policy)
            .on_event(HostEvent::MemberConnected { group: GROUP, index: 0 }, &policy);
        let (state, actions) = state.on_event(
            HostEvent::MemberDisconnected {
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
    fn advertising_failure_retries_from_scratch() {
        let policy = policy(1);
        let (state, _) = HostState::Advertising.on_event(HostEvent::AdvertisingFailed, &policy);
        assert_eq!(state, HostState::Teardown { advertising: false });

        let (state, actions) = state.on_event(HostEvent::Timeout, &policy);
        assert_eq!(state, HostState::Advertising);
        assert!(matches!(actions[0], HostAction::StartAdvertising(_)));
    }

    #[test]
    fn stale_group_events_are_ignored() {
        let policy = policy(1);
        let state = creating(&policy);
        let (next, actions) = state.clone().on_event(
            HostEvent::MemberConnected {
                group: GroupHandle::new(42),
                index: 0,
            },
            &policy,
        );
        assert_eq!(next, state);
        assert!(actions.is_empty());
    }

    #[test]
    fn stop_from_every_state_ends_idle() {
        let policy = policy(1);
        let states = vec![
            HostState::Idle,
            HostState::Advertising,
            creating(&policy),
            HostState::GroupLost { group: GROUP },
            HostState::Teardown { advertising: true },
            HostState::Teardown { advertising: false },
        ];
        for state in states {
            let phase = state.phase();
            let (next, actions) = state.on_event(HostEvent::StopRequested, &policy);
            assert_eq!(next, HostState::Idle, "from {}", phase);
            if phase == HostPhase::GroupCreating {
                assert!(actions.contains(&HostAction::TerminateGroup { group: GROUP }));
                assert!(actions.contains(&HostAction::StopAdvertising));
            }
        }
    }
}
