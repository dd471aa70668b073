//! Transport abstraction for isocast.
//!
//! This module provides a pluggable transport layer that abstracts the
//! broadcast radio (a real controller, the in-process loopback medium, or
//! a mock for testing).
//!
//! # Design
//!
//! Requests are async calls that return once the controller has accepted
//! (or refused) them. Everything that happens later is reported as a
//! [`TransportEvent`] on the channel handed out once by
//! [`Transport::take_events`]:
//! - `start_scan()` leads to advertising reports
//! - `create_sync()` leads to `Synced` / `SyncLost`
//! - `enable_group_info()` leads to `GroupInfo`
//! - `join_group()` / `create_group()` lead to `MemberConnected` per member
//! - `send()` leads to `SendComplete`, which releases one flow token
//!
//! `send()` is a plain function: it only queues the SDU and never waits,
//! so it may be called from inside a delivery callback.

mod loopback;
mod mock;

pub use loopback::{LoopbackMedium, LoopbackRadio};
pub use mock::{MockCall, MockTransport, SentSdu};

use std::time::Duration;

use async_trait::async_trait;
use cast_types::{
    AdvertisingParams, DataPathDirection, GroupHandle, GroupParams, IdentityFilter, JoinParams,
    PeerInfo, SequenceNumber, SyncHandle, TransportEvent,
};
use thiserror::Error;
use tokio::sync::mpsc;

/// Receiving end of a transport's event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The event receiver was already handed out.
    #[error("event stream already taken")]
    EventsTaken,

    /// The controller refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The handle does not name a live sync or group.
    #[error("unknown handle: {0}")]
    UnknownHandle(String),

    /// Member index outside the group.
    #[error("no member {index} in {group}")]
    NoSuchMember {
        /// The group.
        group: GroupHandle,
        /// The index asked for.
        index: usize,
    },

    /// No transmit buffer was available.
    #[error("no transmit buffer available")]
    NoBuffer,

    /// The transport has shut down.
    #[error("transport closed")]
    Closed,
}

/// Transport trait for the broadcast radio.
///
/// Implementations report asynchronous outcomes through the event channel
/// and must never block while doing so.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand out the event receiver. Succeeds once.
    fn take_events(&self) -> Result<EventReceiver, TransportError>;

    /// Start scanning for advertisers.
    ///
    /// The filter is a hint; reports that do not match may still arrive.
    async fn start_scan(&self, filter: &IdentityFilter) -> Result<(), TransportError>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Request a periodic sync to `peer` with the given supervision timeout.
    async fn create_sync(
        &self,
        peer: &PeerInfo,
        timeout: Duration,
    ) -> Result<SyncHandle, TransportError>;

    /// Delete a sync, pending or established.
    async fn delete_sync(&self, sync: SyncHandle) -> Result<(), TransportError>;

    /// Turn on group descriptor reports for a sync.
    async fn enable_group_info(&self, sync: SyncHandle) -> Result<(), TransportError>;

    /// Request to join the group found on `sync`.
    async fn join_group(
        &self,
        sync: SyncHandle,
        params: &JoinParams,
    ) -> Result<GroupHandle, TransportError>;

    /// Terminate a joined or created group.
    async fn terminate_group(&self, group: GroupHandle) -> Result<(), TransportError>;

    /// Start extended and periodic advertising.
    async fn start_advertising(&self, params: &AdvertisingParams) -> Result<(), TransportError>;

    /// Stop advertising.
    async fn stop_advertising(&self) -> Result<(), TransportError>;

    /// Create a broadcast group.
    async fn create_group(&self, params: &GroupParams) -> Result<GroupHandle, TransportError>;

    /// Bind a member to the host data path.
    async fn setup_data_path(
        &self,
        group: GroupHandle,
        index: usize,
        direction: DataPathDirection,
    ) -> Result<(), TransportError>;

    /// Submit one SDU on a member of a created group. Never waits.
    fn send(
        &self,
        group: GroupHandle,
        index: usize,
        payload: Vec<u8>,
        sequence: SequenceNumber,
    ) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        let err = TransportError::NoSuchMember {
            group: GroupHandle::new(2),
            index: 4,
        };
        assert_eq!(err.to_string(), "no member 4 in group#2");
        assert_eq!(
            TransportError::NoBuffer.to_string(),
            "no transmit buffer available"
        );
    }
}
