//! Loopback demo: stdin is broadcast, optionally relayed, received and
//! written to stdout, all inside one process.

use anyhow::{Context, Result};
use cast_core::byte_ring;
use cast_stream::io::{drain_ring, pump_into_ring};
use cast_stream::{node, Config, LoopbackMedium, StreamMetrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Suffix appended to the source name to form the relay's name.
const RELAY_SUFFIX: &str = "Relay";

/// Cadence ticks allowed after end of input before stopping, on top of the
/// ticks needed to empty a full ring.
const TAIL_TICKS: u32 = 20;

/// Run the demo command.
pub async fn run(config: &Config, relay: bool, duration: Option<Duration>) -> Result<()> {
    let medium = LoopbackMedium::new();
    let metrics = Arc::new(StreamMetrics::new());
    let (stop_tx, stop_rx) = watch::channel(false);
    let cadence = config.cadence();

    let source_config = config.clone();
    let mut sink_config = config.clone();
    sink_config.link.target_name = source_config.host.name.clone();

    let relay_config = if relay {
        let mut relay_config = config.clone();
        relay_config.link.target_name = source_config.host.name.clone();
        relay_config.host.name = format!("{}{}", source_config.host.name, RELAY_SUFFIX);
        relay_config
            .validate()
            .context("Relay name derived from host.name is not usable")?;
        sink_config.link.target_name = relay_config.host.name.clone();
        Some(relay_config)
    } else {
        None
    };

    log_route(&source_config, relay_config.as_ref());

    let (bytes_in, source_ring) = byte_ring(config.stream.ring_capacity);
    let (sink_ring, bytes_out) = byte_ring(config.stream.ring_capacity);

    let source = {
        let radio = Arc::new(medium.radio());
        let metrics = metrics.clone();
        let shutdown = stop_rx.clone();
        tokio::spawn(async move {
            node::run_source(radio, &source_config, source_ring, metrics, shutdown).await
        })
    };

    let relay_task = relay_config.map(|relay_config| {
        let upstream = Arc::new(medium.radio());
        let downstream = Arc::new(medium.radio());
        let metrics = metrics.clone();
        let shutdown = stop_rx.clone();
        tokio::spawn(async move {
            node::run_relay(upstream, downstream, &relay_config, metrics, shutdown).await
        })
    });

    let sink = {
        let radio = Arc::new(medium.radio());
        let metrics = metrics.clone();
        let shutdown = stop_rx.clone();
        tokio::spawn(async move {
            node::run_sink(radio, &sink_config, sink_ring, metrics, shutdown).await
        })
    };

    let output = tokio::spawn(drain_ring(
        bytes_out,
        tokio::io::stdout(),
        cadence,
        stop_rx.clone(),
    ));
    let mut input = tokio::spawn(pump_into_ring(
        tokio::io::stdin(),
        bytes_in,
        cadence,
        stop_rx.clone(),
    ));

    let ring_ticks = config.stream.ring_capacity.div_ceil(config.stream.payload_size);
    let tail = cadence * (ring_ticks as u32 + TAIL_TICKS);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping");
        }
        _ = sleep_or_forever(duration) => {
            tracing::info!("Demo duration elapsed, stopping");
        }
        read = &mut input => {
            let read = read.context("Input task panicked")??;
            tracing::info!("Input ended after {} bytes, draining", read);
            tokio::time::sleep(tail).await;
        }
    }
    stop_tx.send_replace(true);

    source.await.context("Source task panicked")??;
    if let Some(relay_task) = relay_task {
        relay_task.await.context("Relay task panicked")??;
    }
    sink.await.context("Sink task panicked")??;
    let written = output.await.context("Output task panicked")??;

    tracing::info!("Wrote {} bytes", written);
    eprintln!("{}", metrics.snapshot());
    Ok(())
}

async fn sleep_or_forever(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

fn log_route(source: &Config, relay: Option<&Config>) {
    match relay {
        Some(relay) => tracing::info!(
            "Streaming {} -> {} -> sink",
            source.host.name,
            relay.host.name
        ),
        None => tracing::info!("Streaming {} -> sink", source.host.name),
    }
}
