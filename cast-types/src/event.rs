//! Asynchronous transport events and the descriptors they carry.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::adv::AdvertisingReport;
use crate::{GroupHandle, PeerAddress, SecondaryId, SequenceNumber, SyncHandle};

/// Why a member channel or a periodic sync went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Terminated by the local host (our own terminate/delete call).
    LocalCancel,
    /// Supervision timeout: the peer stopped being received.
    SupervisionTimeout,
    /// The remote side terminated the group or schedule.
    RemoteTerminated,
    /// Any other controller reason code.
    Other(u8),
}

impl DisconnectReason {
    /// HCI "operation cancelled by host".
    pub const CODE_LOCAL_CANCEL: u8 = 0x44;
    /// HCI "connection timeout".
    pub const CODE_SUPERVISION_TIMEOUT: u8 = 0x08;
    /// HCI "remote user terminated connection".
    pub const CODE_REMOTE_TERMINATED: u8 = 0x13;

    /// Map a raw controller reason code.
    pub fn from_code(code: u8) -> Self {
        match code {
            Self::CODE_LOCAL_CANCEL => Self::LocalCancel,
            Self::CODE_SUPERVISION_TIMEOUT => Self::SupervisionTimeout,
            Self::CODE_REMOTE_TERMINATED => Self::RemoteTerminated,
            other => Self::Other(other),
        }
    }

    /// The raw controller reason code.
    pub fn code(&self) -> u8 {
        match self {
            Self::LocalCancel => Self::CODE_LOCAL_CANCEL,
            Self::SupervisionTimeout => Self::CODE_SUPERVISION_TIMEOUT,
            Self::RemoteTerminated => Self::CODE_REMOTE_TERMINATED,
            Self::Other(code) => *code,
        }
    }

    /// Whether this disconnect was caused by our own cancellation.
    pub fn is_local_cancel(&self) -> bool {
        matches!(self, Self::LocalCancel)
    }
}

/// A discovered peer that carries a periodic schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    /// Advertiser address.
    pub address: PeerAddress,
    /// Advertising set identifier.
    pub sid: SecondaryId,
    /// Periodic schedule interval.
    pub interval: Duration,
}

/// Framing mode of isochronous SDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// One SDU per isochronous interval, unsegmented.
    Unframed,
    /// SDUs may be segmented across PDUs.
    Framed,
}

/// Physical layer used for the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phy {
    /// 1 Mbit/s.
    #[serde(rename = "1m")]
    Le1M,
    /// 2 Mbit/s.
    #[serde(rename = "2m")]
    Le2M,
    /// Coded PHY (long range).
    Coded,
}

/// How member sub-events are arranged within an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Packing {
    /// All sub-events of member 0, then member 1, ...
    Sequential,
    /// Sub-events of all members interleaved.
    Interleaved,
}

/// Out-of-band group metadata delivered over the periodic schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupDescriptor {
    /// Number of member channels in the group.
    pub member_count: u8,
    /// SDU interval (the streaming cadence).
    pub sdu_interval: Duration,
    /// Largest SDU the group carries, in bytes.
    pub max_sdu: u16,
    /// Isochronous interval.
    pub iso_interval: Duration,
    /// SDU framing.
    pub framing: Framing,
    /// Physical layer.
    pub phy: Phy,
    /// Whether the group payload is encrypted. Carried, never acted on.
    pub encrypted: bool,
}

/// Metadata attached to a received SDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvInfo {
    /// Whether the controller marked the SDU as valid.
    pub valid: bool,
    /// Sequence number reported by the sender.
    pub sequence: SequenceNumber,
}

/// Direction of a member's host data path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPathDirection {
    /// Host submits SDUs for transmission.
    HostToController,
    /// Controller delivers received SDUs to the host.
    ControllerToHost,
}

/// Everything the transport reports asynchronously.
///
/// Events are produced on the transport's own execution context and
/// consumed by a link driver through a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A scan report from an advertiser.
    AdvertisingReport(AdvertisingReport),
    /// A periodic-schedule sync was established.
    Synced {
        /// The sync handle.
        sync: SyncHandle,
    },
    /// A periodic-schedule sync was lost or terminated.
    SyncLost {
        /// The sync handle.
        sync: SyncHandle,
        /// Why it was lost.
        reason: DisconnectReason,
    },
    /// A group descriptor received on a synced schedule.
    GroupInfo {
        /// The sync handle it arrived on.
        sync: SyncHandle,
        /// The descriptor.
        descriptor: GroupDescriptor,
    },
    /// A member channel became ready.
    MemberConnected {
        /// The group.
        group: GroupHandle,
        /// Member index within the group.
        index: usize,
    },
    /// A member channel went away.
    MemberDisconnected {
        /// The group.
        group: GroupHandle,
        /// Member index within the group.
        index: usize,
        /// Why it went away.
        reason: DisconnectReason,
    },
    /// The transport finished with one submitted SDU.
    SendComplete {
        /// The group.
        group: GroupHandle,
        /// Member index within the group.
        index: usize,
    },
    /// An SDU was received on a member channel.
    Payload {
        /// The group.
        group: GroupHandle,
        /// Member index within the group.
        index: usize,
        /// Reception metadata.
        info: RecvInfo,
        /// Payload bytes.
        data: Vec<u8>,
    },
}
