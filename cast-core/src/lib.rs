//! # cast-core
//!
//! Pure logic for isocast (no I/O, instant tests).
//!
//! This crate implements the state machines and data-path algorithms for
//! broadcast streaming without any radio or clock access, enabling fast
//! unit tests.
//!
//! ## Design Philosophy
//!
//! The state machines in this crate are **pure** - they take an event and
//! produce a new state plus a list of actions, without side effects:
//! - [`LinkState`] discovers, syncs to and joins a remote group (sink, relay upstream)
//! - [`HostState`] advertises and hosts a local group (source, relay downstream)
//!
//! The actual I/O (transport calls, timers) is performed by `cast-stream`,
//! which interprets the actions produced by these state machines.
//!
//! The data path pieces ([`ring`], [`packet`], [`session`]) are plain data
//! structures shared by every role.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod host;
pub mod packet;
pub mod ring;
pub mod session;
pub mod state;

pub use host::{HostAction, HostEvent, HostNotice, HostPhase, HostPolicy, HostState};
pub use packet::{depacketize, Delivery, DiscardReason, Packetizer, Sdu};
pub use ring::{byte_ring, ByteConsumer, ByteProducer};
pub use session::{GroupSession, MemberStatus, MemberUpdate};
pub use state::{Action, Event, LinkEvent, LinkPolicy, LinkState, RetryCause, SyncPhase};
