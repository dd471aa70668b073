//! Group session model.
//!
//! A [`GroupSession`] is an arena of member-channel slots indexed
//! `0..member_count`. Each slot carries its own connection status and the
//! sequence number of the next SDU it sends. A subset of the members is
//! *required*: the session is live once every required member is connected
//! and lost as soon as one of them disconnects for any reason other than
//! our own cancellation.

use cast_types::{DisconnectReason, MemberMask, SequenceNumber};

/// Connection status of one member channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    /// Not yet reported connected.
    Pending,
    /// Connected and usable.
    Connected,
    /// Went away after connecting (or before).
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemberChannel {
    status: MemberStatus,
    sequence: SequenceNumber,
}

impl MemberChannel {
    fn new() -> Self {
        Self {
            status: MemberStatus::Pending,
            sequence: SequenceNumber::ZERO,
        }
    }
}

/// What a member status change meant for the session as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberUpdate {
    /// Nothing changed (duplicate report or unknown index).
    Ignored,
    /// The member connected; the session is not live yet (or already was).
    Connected,
    /// This connect completed the required set: the session is now live.
    BecameLive,
    /// The member disconnected without losing the session.
    Disconnected,
    /// A required member was lost: the session is now lost.
    BecameLost,
}

/// The joined (or hosted) state of one broadcast group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSession {
    members: Vec<MemberChannel>,
    required: MemberMask,
    live: bool,
    lost: bool,
}

impl GroupSession {
    /// Create a session with `member_count` slots.
    ///
    /// Required members outside `0..member_count` are dropped from the mask.
    pub fn new(member_count: usize, required: MemberMask) -> Self {
        let member_count = member_count.min(MemberMask::MAX_MEMBERS);
        let in_range = MemberMask::first(member_count);
        Self {
            members: (0..member_count).map(|_| MemberChannel::new()).collect(),
            required: MemberMask::from_bits(required.bits() & in_range.bits()),
            live: false,
            lost: false,
        }
    }

    /// Number of member slots.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Members that must connect for the session to be live.
    pub fn required(&self) -> MemberMask {
        self.required
    }

    /// Whether every required member has connected (and none was lost since).
    pub fn is_live(&self) -> bool {
        self.live && !self.lost
    }

    /// Whether a required member was lost.
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// Status of member `index`.
    pub fn status(&self, index: usize) -> Option<MemberStatus> {
        self.members.get(index).map(|m| m.status)
    }

    /// Required members that are not connected.
    pub fn missing(&self) -> MemberMask {
        let bits = self
            .required
            .iter()
            .filter(|i| self.members[*i].status != MemberStatus::Connected)
            .fold(0u32, |acc, i| acc | (1 << i));
        MemberMask::from_bits(bits)
    }

    /// Record that member `index` connected.
    ///
    /// A fresh connection restarts the member's sequence at zero.
    pub fn mark_connected(&mut self, index: usize) -> MemberUpdate {
        let Some(member) = self.members.get_mut(index) else {
            return MemberUpdate::Ignored;
        };
        if member.status == MemberStatus::Connected {
            return MemberUpdate::Ignored;
        }
        member.status = MemberStatus::Connected;
        member.sequence = SequenceNumber::ZERO;

        if !self.live && !self.lost && self.missing().is_empty() {
            self.live = true;
            return MemberUpdate::BecameLive;
        }
        MemberUpdate::Connected
    }

    /// Record that member `index` disconnected.
    pub fn mark_disconnected(&mut self, index: usize, reason: DisconnectReason) -> MemberUpdate {
        let Some(member) = self.members.get_mut(index) else {
            return MemberUpdate::Ignored;
        };
        if matches!(member.status, MemberStatus::Disconnected(_)) {
            return MemberUpdate::Ignored;
        }
        member.status = MemberStatus::Disconnected(reason);

        if self.required.contains(index) && !reason.is_local_cancel() && !self.lost {
            self.lost = true;
            return MemberUpdate::BecameLost;
        }
        MemberUpdate::Disconnected
    }

    /// Sequence number the next SDU on member `index` will carry.
    pub fn sequence(&self, index: usize) -> Option<SequenceNumber> {
        self.members.get(index).map(|m| m.sequence)
    }

    /// Advance member `index` past a successfully submitted SDU.
    ///
    /// Returns the new next-sequence value.
    pub fn advance(&mut self, index: usize) -> Option<SequenceNumber> {
        let member = self.members.get_mut(index)?;
        member.sequence = member.sequence.next();
        Some(member.sequence)
    }
}
