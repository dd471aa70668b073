//! # cast-types
//!
//! Shared types for the isocast broadcast streaming engine.
//!
//! This crate provides the foundational types used across all isocast crates:
//! - [`PeerAddress`], [`SecondaryId`], [`SyncHandle`], [`GroupHandle`] - link identities
//! - [`SequenceNumber`], [`MemberMask`] - per-member ordering and selection
//! - [`TransportEvent`] - everything the radio transport reports asynchronously
//! - [`adv`] - advertising data parsing and identity filtering
//! - [`AdvDataError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adv;
mod error;
mod event;
mod ids;
mod params;

pub use adv::{AdvertisingReport, IdentityFilter};
pub use error::AdvDataError;
pub use params::{AdvertisingParams, GroupParams, JoinParams};
pub use event::{
    DataPathDirection, DisconnectReason, Framing, GroupDescriptor, Packing, PeerInfo, Phy,
    RecvInfo, TransportEvent,
};
pub use ids::{
    AddressKind, GroupHandle, MemberMask, PeerAddress, SecondaryId, SequenceNumber, SyncHandle,
};
