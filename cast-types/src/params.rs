//! Parameters handed to the transport when advertising, creating or joining a group.

use std::time::Duration;

use crate::adv::{self, AD_FLAGS};
use crate::error::AdvDataError;
use crate::{Framing, GroupDescriptor, MemberMask, Packing, Phy, SecondaryId};

/// LE General Discoverable, BR/EDR not supported.
const FLAGS_GENERAL_DISCOVERABLE: u8 = 0x06;

/// Extended plus periodic advertising for a broadcast source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingParams {
    /// Advertised complete local name (the identity token scanners filter on).
    pub name: String,
    /// Advertising set identifier.
    pub sid: SecondaryId,
    /// Extended advertising interval.
    pub ext_interval: Duration,
    /// Periodic advertising interval.
    pub periodic_interval: Duration,
}

impl AdvertisingParams {
    /// Build the extended advertising data: flags followed by the name.
    pub fn advertising_data(&self) -> Result<Vec<u8>, AdvDataError> {
        let mut data = vec![0x02, AD_FLAGS, FLAGS_GENERAL_DISCOVERABLE];
        adv::push_name(&mut data, &self.name)?;
        Ok(data)
    }
}

/// Broadcast group creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupParams {
    /// Number of member channels.
    pub member_count: u8,
    /// SDU interval (the streaming cadence).
    pub sdu_interval: Duration,
    /// SDU size in bytes.
    pub max_sdu: u16,
    /// Maximum transport latency.
    pub latency: Duration,
    /// Retransmissions per SDU.
    pub retransmissions: u8,
    /// Physical layer.
    pub phy: Phy,
    /// Sub-event arrangement.
    pub packing: Packing,
    /// SDU framing.
    pub framing: Framing,
}

impl GroupParams {
    /// The descriptor a receiver will see for a group created with these parameters.
    pub fn descriptor(&self) -> GroupDescriptor {
        GroupDescriptor {
            member_count: self.member_count,
            sdu_interval: self.sdu_interval,
            max_sdu: self.max_sdu,
            iso_interval: self.sdu_interval,
            framing: self.framing,
            phy: self.phy,
            encrypted: false,
        }
    }
}

/// Request to join a broadcast group found over a periodic sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinParams {
    /// Members to join.
    pub members: MemberMask,
    /// Descriptor the join is based on.
    pub descriptor: GroupDescriptor,
    /// Group synchronization timeout.
    pub sync_timeout: Duration,
}
