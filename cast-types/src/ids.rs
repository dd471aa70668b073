//! Link identity and ordering types for isocast.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a device address is a public (IEEE-assigned) or random address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressKind {
    /// Public device address.
    Public,
    /// Random (static or private) device address.
    Random,
}

/// A 48-bit device address as reported by the scanner.
///
/// Bytes are stored in display order (most significant first).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    kind: AddressKind,
    bytes: [u8; 6],
}

impl PeerAddress {
    /// Create an address from its kind and display-order bytes.
    pub const fn new(kind: AddressKind, bytes: [u8; 6]) -> Self {
        Self { kind, bytes }
    }

    /// Create a new random static address.
    ///
    /// The two most significant bits are set, as required for static
    /// random addresses.
    pub fn random() -> Self {
        let mut bytes = [0u8; 6];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        bytes[0] |= 0xC0;
        Self::new(AddressKind::Random, bytes)
    }

    /// Create an address from a raw slice.
    pub fn from_bytes(kind: AddressKind, bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 6 {
            let mut arr = [0u8; 6];
            arr.copy_from_slice(bytes);
            Some(Self::new(kind, arr))
        } else {
            None
        }
    }

    /// Get the address kind.
    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    /// Get the raw bytes of this address.
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.bytes
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        let kind = match self.kind {
            AddressKind::Public => "public",
            AddressKind::Random => "random",
        };
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X} ({})",
            b[0], b[1], b[2], b[3], b[4], b[5], kind
        )
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self)
    }
}

/// Advertising set identifier (SID), 0..=15.
///
/// Distinguishes multiple advertising sets from one device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct SecondaryId(u8);

impl SecondaryId {
    /// Largest valid SID.
    pub const MAX: u8 = 0x0F;

    /// Create a SID, rejecting values above [`SecondaryId::MAX`].
    pub fn new(value: u8) -> Option<Self> {
        (value <= Self::MAX).then_some(Self(value))
    }

    /// Get the numeric value.
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Debug for SecondaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecondaryId({})", self.0)
    }
}

/// Transport handle for a periodic-schedule synchronization.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncHandle(u32);

impl SyncHandle {
    /// Wrap a transport-assigned handle value.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncHandle({})", self.0)
    }
}

impl fmt::Display for SyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync#{}", self.0)
    }
}

/// Transport handle for a broadcast group (created or joined).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupHandle(u32);

impl GroupHandle {
    /// Wrap a transport-assigned handle value.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupHandle({})", self.0)
    }
}

impl fmt::Display for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// Per-member SDU sequence number.
///
/// 16 bits wide and wrapping, matching the isochronous packet sequence field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct SequenceNumber(u16);

impl SequenceNumber {
    /// Sequence number of the first SDU of a session.
    pub const ZERO: Self = Self(0);

    /// Create a sequence number with the given value.
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u16 {
        self.0
    }

    /// The following sequence number, wrapping at 16 bits.
    pub fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Distance from `earlier` to `self`, modulo the wrap width.
    pub fn distance_from(&self, earlier: SequenceNumber) -> u16 {
        self.0.wrapping_sub(earlier.0)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SequenceNumber({})", self.0)
    }
}

/// Bitmask of group members, bit `i` selecting member index `i`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct MemberMask(u32);

impl MemberMask {
    /// Largest number of members a group can carry.
    pub const MAX_MEMBERS: usize = 31;

    /// Create a mask from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Mask selecting the first `count` members.
    pub fn first(count: usize) -> Self {
        let count = count.min(Self::MAX_MEMBERS);
        Self(((1u64 << count) - 1) as u32)
    }

    /// Get the raw bits.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Whether member `index` is selected.
    pub fn contains(&self, index: usize) -> bool {
        index < 32 && self.0 & (1 << index) != 0
    }

    /// Number of selected members.
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether no member is selected.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// One past the highest selected index.
    pub fn span(&self) -> usize {
        32 - self.0.leading_zeros() as usize
    }

    /// Iterate over the selected indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..32).filter(move |i| self.contains(*i))
    }
}

impl fmt::Debug for MemberMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberMask({:#b})", self.0)
    }
}
