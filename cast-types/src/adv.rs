//! Advertising data parsing and identity filtering.
//!
//! Advertising data is a run of AD structures, each laid out as
//! `[length][type][value...]` where `length` covers type and value.
//! A zero length byte ends the significant part of the data.

use std::time::Duration;

use crate::error::AdvDataError;
use crate::{PeerAddress, PeerInfo, SecondaryId};

/// AD type: flags.
pub const AD_FLAGS: u8 = 0x01;
/// AD type: shortened local name.
pub const AD_NAME_SHORTENED: u8 = 0x08;
/// AD type: complete local name.
pub const AD_NAME_COMPLETE: u8 = 0x09;

/// Longest local name kept from a report; longer names are truncated.
pub const MAX_NAME_LEN: usize = 29;

/// Unit of the periodic advertising interval field (1.25 ms).
const INTERVAL_UNIT_US: u64 = 1250;

/// One AD structure borrowed from a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdStructure<'a> {
    /// AD type code.
    pub ad_type: u8,
    /// Value bytes.
    pub data: &'a [u8],
}

/// Iterator over the AD structures in a report.
#[derive(Debug, Clone)]
pub struct AdIter<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Iterator for AdIter<'a> {
    type Item = Result<AdStructure<'a>, AdvDataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }
        let len = self.data[self.offset] as usize;
        if len == 0 {
            return None;
        }
        let available = self.data.len() - self.offset - 1;
        if len > available {
            self.failed = true;
            return Some(Err(AdvDataError::Truncated {
                offset: self.offset,
                declared: len,
                available,
            }));
        }
        let start = self.offset + 1;
        self.offset = start + len;
        Some(Ok(AdStructure {
            ad_type: self.data[start],
            data: &self.data[start + 1..start + len],
        }))
    }
}

/// Iterate over the AD structures in `data`.
pub fn parse(data: &[u8]) -> AdIter<'_> {
    AdIter {
        data,
        offset: 0,
        failed: false,
    }
}

/// The first local name (shortened or complete) in `data`, truncated to
/// [`MAX_NAME_LEN`].
///
/// Parsing stops at the first name structure or the first malformed one.
pub fn local_name(data: &[u8]) -> Option<&[u8]> {
    for item in parse(data) {
        let Ok(ad) = item else {
            return None;
        };
        if ad.ad_type == AD_NAME_SHORTENED || ad.ad_type == AD_NAME_COMPLETE {
            let len = ad.data.len().min(MAX_NAME_LEN);
            return Some(&ad.data[..len]);
        }
    }
    None
}

/// Append a complete-local-name structure for `name` to `out`.
pub fn push_name(out: &mut Vec<u8>, name: &str) -> Result<(), AdvDataError> {
    let bytes = name.as_bytes();
    if bytes.len() > MAX_NAME_LEN {
        return Err(AdvDataError::NameTooLong {
            len: bytes.len(),
            max: MAX_NAME_LEN,
        });
    }
    out.push(bytes.len() as u8 + 1);
    out.push(AD_NAME_COMPLETE);
    out.extend_from_slice(bytes);
    Ok(())
}

/// A scan report from one advertiser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingReport {
    /// Advertiser address.
    pub address: PeerAddress,
    /// Advertising set identifier.
    pub sid: SecondaryId,
    /// Periodic advertising interval in 1.25 ms units, 0 if the advertiser
    /// has no periodic schedule.
    pub periodic_interval: u16,
    /// Raw advertising data.
    pub data: Vec<u8>,
}

impl AdvertisingReport {
    /// The periodic schedule interval, if the advertiser has one.
    pub fn periodic_interval(&self) -> Option<Duration> {
        (self.periodic_interval != 0)
            .then(|| Duration::from_micros(self.periodic_interval as u64 * INTERVAL_UNIT_US))
    }

    /// The advertised local name, if any.
    pub fn local_name(&self) -> Option<&[u8]> {
        local_name(&self.data)
    }

    /// Peer information for a sync request, if the advertiser has a
    /// periodic schedule.
    pub fn peer_info(&self) -> Option<PeerInfo> {
        Some(PeerInfo {
            address: self.address,
            sid: self.sid,
            interval: self.periodic_interval()?,
        })
    }
}

/// Convert a periodic interval to the 1.25 ms units used in reports.
pub fn interval_units(interval: Duration) -> u16 {
    (interval.as_micros() / INTERVAL_UNIT_US as u128).min(u16::MAX as u128) as u16
}

/// Exact-match filter on the advertised identity token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityFilter {
    name: Vec<u8>,
}

impl IdentityFilter {
    /// Filter on an advertised local name.
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: name.into().into_bytes(),
        }
    }

    /// The name bytes this filter matches.
    pub fn as_bytes(&self) -> &[u8] {
        &self.name
    }

    /// Whether `report` is from a matching advertiser with a periodic schedule.
    pub fn matches(&self, report: &AdvertisingReport) -> bool {
        report.periodic_interval != 0 && report.local_name() == Some(self.name.as_slice())
    }
}

impl std::fmt::Display for IdentityFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.name))
    }
}
