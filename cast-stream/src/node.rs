//! Runnable roles: source, sink and relay.
//!
//! Each role runs its driver(s) and pipeline side by side until shutdown.
//! The first error ends the role.

use std::sync::Arc;

use cast_core::{ByteConsumer, ByteProducer, Packetizer};
use tokio::sync::watch;

use crate::config::Config;
use crate::driver::{HostDriver, LinkDriver};
use crate::error::Result;
use crate::metrics::StreamMetrics;
use crate::relay::RelayForwarder;
use crate::sink::RingSink;
use crate::source::SourcePipeline;
use crate::transport::Transport;

/// Broadcast the bytes arriving in `ring`.
pub async fn run_source<T: Transport>(
    transport: Arc<T>,
    config: &Config,
    ring: ByteConsumer,
    metrics: Arc<StreamMetrics>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (driver, status) = HostDriver::new(
        transport.clone(),
        config.host_policy(),
        config.stream.max_in_flight,
        metrics.clone(),
    )?;
    let pipeline = SourcePipeline::new(
        ring,
        Packetizer::new(config.stream.payload_size, config.stream.filler),
        config.cadence(),
        config.stream.stats_interval_ticks,
        metrics,
    );

    tokio::try_join!(
        driver.run(shutdown.clone()),
        pipeline.run(transport, status, shutdown)
    )?;
    Ok(())
}

/// Receive the configured broadcaster into `ring`.
pub async fn run_sink<T: Transport>(
    transport: Arc<T>,
    config: &Config,
    ring: ByteProducer,
    metrics: Arc<StreamMetrics>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let sink = RingSink::new(ring, metrics.clone());
    let (driver, _status) = LinkDriver::new(transport, config.link_policy(), sink, metrics)?;
    driver.run(shutdown).await
}

/// Receive the configured broadcaster on `upstream` and rebroadcast it on
/// `downstream` under the host identity.
pub async fn run_relay<U: Transport, D: Transport>(
    upstream: Arc<U>,
    downstream: Arc<D>,
    config: &Config,
    metrics: Arc<StreamMetrics>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (host, status) = HostDriver::new(
        downstream.clone(),
        config.host_policy(),
        config.stream.max_in_flight,
        metrics.clone(),
    )?;
    let forwarder = RelayForwarder::new(downstream, status, metrics.clone());
    let (link, _status) = LinkDriver::new(upstream, config.link_policy(), forwarder, metrics)?;

    tokio::try_join!(host.run(shutdown.clone()), link.run(shutdown))?;
    Ok(())
}
