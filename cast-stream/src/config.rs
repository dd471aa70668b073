//! Configuration loading for isocast.
//!
//! Configuration is loaded from a TOML file (default: `isocast.toml`).
//! Every field is optional; missing sections and fields take the defaults
//! below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cast_core::{HostPolicy, LinkPolicy};
use cast_types::{
    adv, AdvertisingParams, Framing, GroupParams, IdentityFilter, MemberMask, Packing, Phy,
    SecondaryId,
};
use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Data path settings.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Receiving side (sink, relay upstream).
    #[serde(default)]
    pub link: LinkConfig,
    /// Broadcasting side (source, relay downstream).
    #[serde(default)]
    pub host: HostConfig,
}

/// Data path configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Bytes per SDU (default: 160).
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
    /// Transmit cadence in milliseconds (default: 10).
    #[serde(default = "default_cadence_ms")]
    pub cadence_ms: u64,
    /// Byte ring capacity (default: 1600, ten payloads).
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// SDUs allowed in flight at once (default: 1).
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Byte used to pad payloads on underrun (default: 0).
    #[serde(default)]
    pub filler: u8,
    /// Ticks per statistics log line (default: 100).
    #[serde(default = "default_stats_interval_ticks")]
    pub stats_interval_ticks: u64,
}

/// Receiving link configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Advertised name of the broadcaster to follow (default: "AliceISO").
    #[serde(default = "default_name")]
    pub target_name: String,
    /// Number of members to join, starting at index 0 (default: 1).
    #[serde(default = "default_members")]
    pub members: u8,
    /// Wait for a requested sync to establish (default: 2000).
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    /// Sync supervision timeout handed to the radio (default: 4000).
    #[serde(default = "default_sync_supervision_ms")]
    pub sync_supervision_ms: u64,
    /// Wait for the group descriptor once synced (default: 2000).
    #[serde(default = "default_group_info_timeout_ms")]
    pub group_info_timeout_ms: u64,
    /// Wait for each member to connect (default: 10000).
    #[serde(default = "default_member_timeout_ms")]
    pub member_timeout_ms: u64,
    /// Group sync timeout handed to the radio (default: 3000).
    #[serde(default = "default_group_sync_timeout_ms")]
    pub group_sync_timeout_ms: u64,
    /// Pause between teardown and the next scan (default: 1000).
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

/// Broadcasting host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Advertised complete local name (default: "AliceISO").
    #[serde(default = "default_name")]
    pub name: String,
    /// Advertising set identifier, 0..=15 (default: 0).
    #[serde(default)]
    pub sid: u8,
    /// Members in the created group (default: 1).
    #[serde(default = "default_members")]
    pub member_count: u8,
    /// Periodic advertising interval (default: 60).
    #[serde(default = "default_periodic_interval_ms")]
    pub periodic_interval_ms: u64,
    /// Extended advertising interval (default: 50).
    #[serde(default = "default_ext_interval_ms")]
    pub ext_interval_ms: u64,
    /// Maximum transport latency (default: 10).
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
    /// Retransmissions per SDU (default: 1).
    #[serde(default = "default_retransmissions")]
    pub retransmissions: u8,
    /// Physical layer (default: "2m").
    #[serde(default = "default_phy")]
    pub phy: Phy,
    /// Sub-event packing (default: "sequential").
    #[serde(default = "default_packing")]
    pub packing: Packing,
    /// SDU framing (default: "unframed").
    #[serde(default = "default_framing")]
    pub framing: Framing,
    /// Wait for each member to connect (default: 10000).
    #[serde(default = "default_member_timeout_ms")]
    pub member_timeout_ms: u64,
    /// Pause before recreating a lost group (default: 1000).
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

// Default value functions
fn default_payload_size() -> usize {
    160
}

fn default_cadence_ms() -> u64 {
    10
}

fn default_ring_capacity() -> usize {
    1600
}

fn default_max_in_flight() -> usize {
    1
}

fn default_stats_interval_ticks() -> u64 {
    100 // about one second at the default cadence
}

fn default_name() -> String {
    "AliceISO".to_string()
}

fn default_members() -> u8 {
    1
}

fn default_sync_timeout_ms() -> u64 {
    2000
}

fn default_sync_supervision_ms() -> u64 {
    4000
}

fn default_group_info_timeout_ms() -> u64 {
    2000
}

fn default_member_timeout_ms() -> u64 {
    10_000
}

fn default_group_sync_timeout_ms() -> u64 {
    3000
}

fn default_settle_delay_ms() -> u64 {
    1000
}

fn default_periodic_interval_ms() -> u64 {
    60
}

fn default_ext_interval_ms() -> u64 {
    50
}

fn default_latency_ms() -> u64 {
    10
}

fn default_retransmissions() -> u8 {
    1
}

fn default_phy() -> Phy {
    Phy::Le2M
}

fn default_packing() -> Packing {
    Packing::Sequential
}

fn default_framing() -> Framing {
    Framing::Unframed
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            payload_size: default_payload_size(),
            cadence_ms: default_cadence_ms(),
            ring_capacity: default_ring_capacity(),
            max_in_flight: default_max_in_flight(),
            filler: 0,
            stats_interval_ticks: default_stats_interval_ticks(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            target_name: default_name(),
            members: default_members(),
            sync_timeout_ms: default_sync_timeout_ms(),
            sync_supervision_ms: default_sync_supervision_ms(),
            group_info_timeout_ms: default_group_info_timeout_ms(),
            member_timeout_ms: default_member_timeout_ms(),
            group_sync_timeout_ms: default_group_sync_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            sid: 0,
            member_count: default_members(),
            periodic_interval_ms: default_periodic_interval_ms(),
            ext_interval_ms: default_ext_interval_ms(),
            latency_ms: default_latency_ms(),
            retransmissions: default_retransmissions(),
            phy: default_phy(),
            packing: default_packing(),
            framing: default_framing(),
            member_timeout_ms: default_member_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a value
    /// is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value the data path and the machines depend on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let stream = &self.stream;
        if stream.payload_size == 0 {
            return Err(invalid("stream.payload_size", "must be at least 1"));
        }
        if stream.payload_size > u16::MAX as usize {
            return Err(invalid("stream.payload_size", "must fit in 16 bits"));
        }
        if stream.ring_capacity < stream.payload_size {
            return Err(invalid(
                "stream.ring_capacity",
                "must hold at least one payload",
            ));
        }
        if stream.max_in_flight == 0 {
            return Err(invalid("stream.max_in_flight", "must be at least 1"));
        }
        if stream.cadence_ms == 0 {
            return Err(invalid("stream.cadence_ms", "must be at least 1"));
        }
        check_members("link.members", self.link.members)?;
        check_members("host.member_count", self.host.member_count)?;
        check_name("link.target_name", &self.link.target_name)?;
        check_name("host.name", &self.host.name)?;
        if SecondaryId::new(self.host.sid).is_none() {
            return Err(invalid("host.sid", "must be 0..=15"));
        }
        Ok(())
    }

    /// The cadence as a duration.
    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.stream.cadence_ms)
    }

    /// Policy for a receiving link.
    pub fn link_policy(&self) -> LinkPolicy {
        let link = &self.link;
        LinkPolicy {
            filter: IdentityFilter::name(link.target_name.clone()),
            required: MemberMask::first(link.members as usize),
            sync_timeout: Duration::from_millis(link.sync_timeout_ms),
            sync_supervision: Duration::from_millis(link.sync_supervision_ms),
            group_info_timeout: Duration::from_millis(link.group_info_timeout_ms),
            member_timeout: Duration::from_millis(link.member_timeout_ms),
            group_sync_timeout: Duration::from_millis(link.group_sync_timeout_ms),
            settle_delay: Duration::from_millis(link.settle_delay_ms),
        }
    }

    /// Policy for a broadcasting host. Cadence and payload size come from
    /// the stream section.
    pub fn host_policy(&self) -> HostPolicy {
        let host = &self.host;
        HostPolicy {
            advertising: AdvertisingParams {
                name: host.name.clone(),
                sid: SecondaryId::new(host.sid).unwrap_or_default(),
                ext_interval: Duration::from_millis(host.ext_interval_ms),
                periodic_interval: Duration::from_millis(host.periodic_interval_ms),
            },
            group: GroupParams {
                member_count: host.member_count,
                sdu_interval: self.cadence(),
                max_sdu: self.stream.payload_size.min(u16::MAX as usize) as u16,
                latency: Duration::from_millis(host.latency_ms),
                retransmissions: host.retransmissions,
                phy: host.phy,
                packing: host.packing,
                framing: host.framing,
            },
            member_timeout: Duration::from_millis(host.member_timeout_ms),
            settle_delay: Duration::from_millis(host.settle_delay_ms),
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn check_members(field: &'static str, count: u8) -> Result<(), ConfigError> {
    if count == 0 || count as usize > MemberMask::MAX_MEMBERS {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("must be 1..={}", MemberMask::MAX_MEMBERS),
        });
    }
    Ok(())
}

fn check_name(field: &'static str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.len() > adv::MAX_NAME_LEN {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("must be 1..={} bytes", adv::MAX_NAME_LEN),
        });
    }
    Ok(())
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
