//! # cast-stream
//!
//! Runtime side of the isocast broadcast streaming engine.
//!
//! This crate runs the pure machines from cast-core against a radio:
//!
//! - [`transport`] - the [`Transport`] trait plus loopback and mock radios
//! - [`driver`] - [`LinkDriver`] (receive) and [`HostDriver`] (broadcast)
//! - [`source`] / [`sink`] / [`relay`] - the data path
//! - [`tokens`] - flow tokens bounding SDUs in flight
//! - [`config`] - TOML configuration
//! - [`node`] - ready-made source, sink and relay roles
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use cast_core::byte_ring;
//! use cast_stream::{node, Config, LoopbackMedium, StreamMetrics};
//!
//! let medium = LoopbackMedium::new();
//! let config = Config::default();
//! let (_bytes_in, ring) = byte_ring(config.stream.ring_capacity);
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//!
//! node::run_source(
//!     Arc::new(medium.radio()),
//!     &config,
//!     ring,
//!     Arc::new(StreamMetrics::new()),
//!     shutdown,
//! )
//! .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod driver;
pub mod error;
pub mod io;
pub mod metrics;
pub mod node;
pub mod relay;
pub mod sink;
pub mod source;
pub mod tokens;
pub mod transport;

pub use config::{Config, ConfigError};
pub use driver::{DeliveryHandler, HostDriver, LinkDriver, LinkStatus, LiveGroup};
pub use error::{PipelineFault, Result, StreamError};
pub use metrics::{MetricsSnapshot, StreamMetrics};
pub use relay::{RelayDrop, RelayForwarder};
pub use sink::RingSink;
pub use source::{SourcePipeline, TickReport};
pub use tokens::{FlowToken, FlowTokens, Submission};
pub use transport::{
    LoopbackMedium, LoopbackRadio, MockTransport, Transport, TransportError,
};
