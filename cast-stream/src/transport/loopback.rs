//! In-process broadcast medium.
//!
//! A [`LoopbackMedium`] connects any number of [`LoopbackRadio`]s. Every
//! radio is a full [`Transport`]: it can advertise and host a group, or
//! scan, sync and join someone else's. Delivery is immediate and lossless
//! unless a radio is told to [`interrupt`](LoopbackRadio::interrupt) its
//! reception.
//!
//! Handles are unique across the whole medium.

use super::{EventReceiver, Transport, TransportError};
use async_trait::async_trait;
use cast_types::{
    adv, AdvertisingParams, AdvertisingReport, DataPathDirection, DisconnectReason, GroupHandle,
    GroupParams, IdentityFilter, JoinParams, MemberMask, PeerAddress, PeerInfo, RecvInfo,
    SequenceNumber, SyncHandle, TransportEvent,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

type RadioId = u32;

/// Shared medium that loopback radios broadcast over.
#[derive(Debug, Clone, Default)]
pub struct LoopbackMedium {
    inner: Arc<Mutex<Medium>>,
}

#[derive(Debug, Default)]
struct Medium {
    radios: HashMap<RadioId, RadioState>,
    next_radio: RadioId,
    next_handle: u32,
}

#[derive(Debug)]
struct RadioState {
    address: PeerAddress,
    events: mpsc::UnboundedSender<TransportEvent>,
    scanning: bool,
    advertising: Option<Advertising>,
    hosted: Option<Hosted>,
    syncs: HashMap<SyncHandle, SyncLink>,
    joined: HashMap<GroupHandle, Membership>,
}

#[derive(Debug, Clone)]
struct Advertising {
    params: AdvertisingParams,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct Hosted {
    group: GroupHandle,
    params: GroupParams,
}

#[derive(Debug, Clone, Copy)]
struct SyncLink {
    target: RadioId,
    info_enabled: bool,
}

#[derive(Debug, Clone, Copy)]
struct Membership {
    target: RadioId,
    hosted: GroupHandle,
    members: MemberMask,
}

/// Events to post once the medium lock is released.
type Outbox = Vec<(RadioId, TransportEvent)>;

impl LoopbackMedium {
    /// Create an empty medium.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new radio with a random static address.
    pub fn radio(&self) -> LoopbackRadio {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut medium = self.lock();
        let id = medium.next_radio;
        medium.next_radio += 1;
        medium.radios.insert(
            id,
            RadioState {
                address: PeerAddress::random(),
                events: tx,
                scanning: false,
                advertising: None,
                hosted: None,
                syncs: HashMap::new(),
                joined: HashMap::new(),
            },
        );
        LoopbackRadio {
            id,
            medium: self.clone(),
            events: Mutex::new(Some(rx)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Medium> {
        // A poisoned medium only means a test panicked mid-call; the
        // bookkeeping itself is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Medium {
    fn allocate(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn radio(&self, id: RadioId) -> Result<&RadioState, TransportError> {
        self.radios.get(&id).ok_or(TransportError::Closed)
    }

    fn radio_mut(&mut self, id: RadioId) -> Result<&mut RadioState, TransportError> {
        self.radios.get_mut(&id).ok_or(TransportError::Closed)
    }

    fn post(&self, outbox: Outbox) {
        for (id, event) in outbox {
            if let Some(radio) = self.radios.get(&id) {
                let _ = radio.events.send(event);
            }
        }
    }

    fn report_from(&self, id: RadioId) -> Option<AdvertisingReport> {
        let radio = self.radios.get(&id)?;
        let advertising = radio.advertising.as_ref()?;
        Some(AdvertisingReport {
            address: radio.address,
            sid: advertising.params.sid,
            periodic_interval: adv::interval_units(advertising.params.periodic_interval),
            data: advertising.data.clone(),
        })
    }

    /// End the group hosted by `host`, notifying the host and every joiner.
    fn end_hosted(&mut self, host: RadioId, outbox: &mut Outbox) {
        let Some(hosted) = self
            .radios
            .get_mut(&host)
            .and_then(|radio| radio.hosted.take())
        else {
            return;
        };
        for index in 0..hosted.params.member_count as usize {
            outbox.push((
                host,
                TransportEvent::MemberDisconnected {
                    group: hosted.group,
                    index,
                    reason: DisconnectReason::LocalCancel,
                },
            ));
        }
        for (id, radio) in self.radios.iter_mut() {
            let ended: Vec<(GroupHandle, Membership)> = radio
                .joined
                .iter()
                .filter(|(_, m)| m.target == host && m.hosted == hosted.group)
                .map(|(g, m)| (*g, *m))
                .collect();
            for (group, membership) in ended {
                radio.joined.remove(&group);
                for index in membership.members.iter() {
                    outbox.push((
                        *id,
                        TransportEvent::MemberDisconnected {
                            group,
                            index,
                            reason: DisconnectReason::RemoteTerminated,
                        },
                    ));
                }
            }
        }
    }
}

/// One radio attached to a [`LoopbackMedium`].
#[derive(Debug)]
pub struct LoopbackRadio {
    id: RadioId,
    medium: LoopbackMedium,
    events: Mutex<Option<EventReceiver>>,
}

impl LoopbackRadio {
    /// This radio's device address.
    pub fn address(&self) -> PeerAddress {
        let medium = self.medium.lock();
        medium
            .radios
            .get(&self.id)
            .map(|r| r.address)
            .unwrap_or_else(|| PeerAddress::new(cast_types::AddressKind::Random, [0; 6]))
    }

    /// Simulate this radio losing reception: every joined group reports a
    /// supervision timeout on each member and every sync is lost.
    pub fn interrupt(&self) {
        let mut medium = self.medium.lock();
        let mut outbox = Outbox::new();
        if let Some(radio) = medium.radios.get_mut(&self.id) {
            for (group, membership) in radio.joined.drain() {
                for index in membership.members.iter() {
                    outbox.push((
                        self.id,
                        TransportEvent::MemberDisconnected {
                            group,
                            index,
                            reason: DisconnectReason::SupervisionTimeout,
                        },
                    ));
                }
            }
            for (sync, _) in radio.syncs.drain() {
                outbox.push((
                    self.id,
                    TransportEvent::SyncLost {
                        sync,
                        reason: DisconnectReason::SupervisionTimeout,
                    },
                ));
            }
        }
        medium.post(outbox);
    }
}

impl Drop for LoopbackRadio {
    fn drop(&mut self) {
        let mut medium = self.medium.lock();
        let mut outbox = Outbox::new();
        medium.end_hosted(self.id, &mut outbox);
        medium.radios.remove(&self.id);
        medium.post(outbox);
    }
}

#[async_trait]
impl Transport for LoopbackRadio {
    fn take_events(&self) -> Result<EventReceiver, TransportError> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.take().ok_or(TransportError::EventsTaken)
    }

    async fn start_scan(&self, _filter: &IdentityFilter) -> Result<(), TransportError> {
        let mut medium = self.medium.lock();
        medium.radio_mut(self.id)?.scanning = true;

        let outbox: Outbox = medium
            .radios
            .keys()
            .filter(|id| **id != self.id)
            .filter_map(|id| medium.report_from(*id))
            .map(|report| (self.id, TransportEvent::AdvertisingReport(report)))
            .collect();
        medium.post(outbox);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let mut medium = self.medium.lock();
        medium.radio_mut(self.id)?.scanning = false;
        Ok(())
    }

    async fn create_sync(
        &self,
        peer: &PeerInfo,
        _timeout: Duration,
    ) -> Result<SyncHandle, TransportError> {
        let mut medium = self.medium.lock();
        let target = medium
            .radios
            .iter()
            .find(|(id, radio)| {
                **id != self.id
                    && radio.address == peer.address
                    && radio
                        .advertising
                        .as_ref()
                        .is_some_and(|a| a.params.sid == peer.sid)
            })
            .map(|(id, _)| *id)
            .ok_or_else(|| TransportError::Rejected(format!("no advertiser at {}", peer.address)))?;

        let sync = SyncHandle::new(medium.allocate());
        medium.radio_mut(self.id)?.syncs.insert(
            sync,
            SyncLink {
                target,
                info_enabled: false,
            },
        );
        medium.post(vec![(self.id, TransportEvent::Synced { sync })]);
        Ok(sync)
    }

    async fn delete_sync(&self, sync: SyncHandle) -> Result<(), TransportError> {
        let mut medium = self.medium.lock();
        medium
            .radio_mut(self.id)?
            .syncs
            .remove(&sync)
            .map(|_| ())
            .ok_or_else(|| TransportError::UnknownHandle(sync.to_string()))
    }

    async fn enable_group_info(&self, sync: SyncHandle) -> Result<(), TransportError> {
        let mut medium = self.medium.lock();
        let link = medium
            .radio_mut(self.id)?
            .syncs
            .get_mut(&sync)
            .ok_or_else(|| TransportError::UnknownHandle(sync.to_string()))?;
        link.info_enabled = true;
        let target = link.target;

        if let Some(hosted) = medium.radio(target)?.hosted {
            medium.post(vec![(
                self.id,
                TransportEvent::GroupInfo {
                    sync,
                    descriptor: hosted.params.descriptor(),
                },
            )]);
        }
        Ok(())
    }

    async fn join_group(
        &self,
        sync: SyncHandle,
        params: &JoinParams,
    ) -> Result<GroupHandle, TransportError> {
        let mut medium = self.medium.lock();
        let link = *medium
            .radio(self.id)?
            .syncs
            .get(&sync)
            .ok_or_else(|| TransportError::UnknownHandle(sync.to_string()))?;
        let hosted = medium
            .radio(link.target)?
            .hosted
            .ok_or_else(|| TransportError::Rejected("no group on this sync".into()))?;
        if params.members.is_empty()
            || params.members.span() > hosted.params.member_count as usize
        {
            return Err(TransportError::Rejected(format!(
                "cannot join members {:?} of a {}-member group",
                params.members, hosted.params.member_count
            )));
        }

        let group = GroupHandle::new(medium.allocate());
        medium.radio_mut(self.id)?.joined.insert(
            group,
            Membership {
                target: link.target,
                hosted: hosted.group,
                members: params.members,
            },
        );
        let outbox = params
            .members
            .iter()
            .map(|index| (self.id, TransportEvent::MemberConnected { group, index }))
            .collect();
        medium.post(outbox);
        Ok(group)
    }

    async fn terminate_group(&self, group: GroupHandle) -> Result<(), TransportError> {
        let mut medium = self.medium.lock();
        let mut outbox = Outbox::new();

        let radio = medium.radio_mut(self.id)?;
        if radio.hosted.is_some_and(|h| h.group == group) {
            medium.end_hosted(self.id, &mut outbox);
        } else if let Some(membership) = radio.joined.remove(&group) {
            for index in membership.members.iter() {
                outbox.push((
                    self.id,
                    TransportEvent::MemberDisconnected {
                        group,
                        index,
                        reason: DisconnectReason::LocalCancel,
                    },
                ));
            }
        } else {
            return Err(TransportError::UnknownHandle(group.to_string()));
        }
        medium.post(outbox);
        Ok(())
    }

    async fn start_advertising(&self, params: &AdvertisingParams) -> Result<(), TransportError> {
        let data = params
            .advertising_data()
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        let mut medium = self.medium.lock();
        medium.radio_mut(self.id)?.advertising = Some(Advertising {
            params: params.clone(),
            data,
        });

        let mut outbox = Outbox::new();
        if let Some(report) = medium.report_from(self.id) {
            for (id, radio) in &medium.radios {
                if *id != self.id && radio.scanning {
                    outbox.push((*id, TransportEvent::AdvertisingReport(report.clone())));
                }
            }
        }
        medium.post(outbox);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), TransportError> {
        let mut medium = self.medium.lock();
        let mut outbox = Outbox::new();

        medium.radio_mut(self.id)?.advertising = None;
        medium.end_hosted(self.id, &mut outbox);
        for (id, radio) in medium.radios.iter_mut() {
            let lost: Vec<SyncHandle> = radio
                .syncs
                .iter()
                .filter(|(_, link)| link.target == self.id)
                .map(|(sync, _)| *sync)
                .collect();
            for sync in lost {
                radio.syncs.remove(&sync);
                outbox.push((
                    *id,
                    TransportEvent::SyncLost {
                        sync,
                        reason: DisconnectReason::RemoteTerminated,
                    },
                ));
            }
        }
        medium.post(outbox);
        Ok(())
    }

    async fn create_group(&self, params: &GroupParams) -> Result<GroupHandle, TransportError> {
        let mut medium = self.medium.lock();
        let radio = medium.radio(self.id)?;
        if radio.advertising.is_none() {
            return Err(TransportError::Rejected("not advertising".into()));
        }
        if radio.hosted.is_some() {
            return Err(TransportError::Rejected("a group is already hosted".into()));
        }
        if params.member_count == 0 || params.member_count as usize > MemberMask::MAX_MEMBERS {
            return Err(TransportError::Rejected(format!(
                "invalid member count {}",
                params.member_count
            )));
        }

        let group = GroupHandle::new(medium.allocate());
        medium.radio_mut(self.id)?.hosted = Some(Hosted {
            group,
            params: *params,
        });

        let mut outbox: Outbox = (0..params.member_count as usize)
            .map(|index| (self.id, TransportEvent::MemberConnected { group, index }))
            .collect();
        for (id, radio) in &medium.radios {
            for (sync, link) in &radio.syncs {
                if link.target == self.id && link.info_enabled {
                    outbox.push((
                        *id,
                        TransportEvent::GroupInfo {
                            sync: *sync,
                            descriptor: params.descriptor(),
                        },
                    ));
                }
            }
        }
        medium.post(outbox);
        Ok(group)
    }

    async fn setup_data_path(
        &self,
        group: GroupHandle,
        index: usize,
        _direction: DataPathDirection,
    ) -> Result<(), TransportError> {
        let medium = self.medium.lock();
        let radio = medium.radio(self.id)?;
        let in_range = match (radio.hosted, radio.joined.get(&group)) {
            (Some(hosted), _) if hosted.group == group => {
                index < hosted.params.member_count as usize
            }
            (_, Some(membership)) => membership.members.contains(index),
            _ => return Err(TransportError::UnknownHandle(group.to_string())),
        };
        if in_range {
            Ok(())
        } else {
            Err(TransportError::NoSuchMember { group, index })
        }
    }

    fn send(
        &self,
        group: GroupHandle,
        index: usize,
        payload: Vec<u8>,
        sequence: SequenceNumber,
    ) -> Result<(), TransportError> {
        let medium = self.medium.lock();
        let hosted = medium
            .radio(self.id)?
            .hosted
            .filter(|h| h.group == group)
            .ok_or_else(|| TransportError::UnknownHandle(group.to_string()))?;
        if index >= hosted.params.member_count as usize {
            return Err(TransportError::NoSuchMember { group, index });
        }

        let mut outbox = Outbox::new();
        for (id, radio) in &medium.radios {
            for (joined, membership) in &radio.joined {
                if membership.target == self.id
                    && membership.hosted == group
                    && membership.members.contains(index)
                {
                    outbox.push((
                        *id,
                        TransportEvent::Payload {
                            group: *joined,
                            index,
                            info: RecvInfo {
                                valid: true,
                                sequence,
                            },
                            data: payload.clone(),
                        },
                    ));
                }
            }
        }
        outbox.push((self.id, TransportEvent::SendComplete { group, index }));
        medium.post(outbox);
        Ok(())
    }
}
