//! Packetization and de-packetization between the byte ring and SDUs.

use cast_types::{RecvInfo, SequenceNumber};

use crate::ring::{ByteConsumer, ByteProducer};

/// A fixed-size payload bound for (or received from) one member channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdu {
    /// Member index within the group.
    pub index: usize,
    /// Sequence number of this SDU on its member channel.
    pub sequence: SequenceNumber,
    /// Payload bytes, exactly the session's payload size.
    pub payload: Vec<u8>,
}

/// Cuts the byte stream into fixed-size payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packetizer {
    payload_size: usize,
    filler: u8,
}

impl Packetizer {
    /// Filler used when none is configured.
    pub const DEFAULT_FILLER: u8 = 0x00;

    /// Create a packetizer producing `payload_size`-byte payloads.
    pub fn new(payload_size: usize, filler: u8) -> Self {
        Self {
            payload_size,
            filler,
        }
    }

    /// Payload size in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Filler byte used on underrun.
    pub fn filler(&self) -> u8 {
        self.filler
    }

    /// Drain up to one payload from `ring` without blocking.
    ///
    /// Always returns exactly `payload_size` bytes; whatever the ring could
    /// not supply is filler. The second value is the number of bytes that
    /// actually came from the ring.
    pub fn next_payload(&self, ring: &mut ByteConsumer) -> (Vec<u8>, usize) {
        let mut payload = vec![self.filler; self.payload_size];
        let drained = ring.pop_into(&mut payload);
        (payload, drained)
    }
}

/// Why an incoming payload was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The controller flagged the SDU as invalid.
    Invalid,
    /// The SDU carried no bytes.
    Empty,
}

/// Outcome of handing one received payload to the de-packetizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Payload went into the ring; `dropped` bytes did not fit.
    Stored {
        /// Bytes accepted by the ring.
        written: usize,
        /// Bytes dropped because the ring was full.
        dropped: usize,
    },
    /// Payload was ignored.
    Discarded(DiscardReason),
}

/// Push a received payload into `ring` unchanged.
///
/// Invalid and empty deliveries are discarded without touching the ring.
pub fn depacketize(info: RecvInfo, data: &[u8], ring: &mut ByteProducer) -> Delivery {
    if !info.valid {
        return Delivery::Discarded(DiscardReason::Invalid);
    }
    if data.is_empty() {
        return Delivery::Discarded(DiscardReason::Empty);
    }
    let written = ring.push(data);
    Delivery::Stored {
        written,
        dropped: data.len() - written,
    }
}
