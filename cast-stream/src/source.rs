//! Send side of the data path.
//!
//! On every cadence tick, for each required member: take a flow token,
//! drain one payload from the ring (padding with filler on underrun) and
//! submit it with the member's sequence number. Every failure is confined
//! to the tick it happened in; the cadence never stops or doubles up.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use cast_core::{ByteConsumer, GroupSession, Packetizer};
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::driver::{LinkStatus, LiveGroup};
use crate::error::{PipelineFault, Result};
use crate::metrics::StreamMetrics;
use crate::tokens::FlowTokens;
use crate::transport::Transport;

/// Outcome of one cadence tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// SDUs the transport accepted.
    pub sent: usize,
    /// Bytes drained from the ring.
    pub drained: usize,
    /// What went wrong, if anything.
    pub faults: Vec<PipelineFault>,
}

/// The live group a pipeline is currently feeding.
struct ActiveSession {
    live: Arc<LiveGroup>,
    tokens: Arc<FlowTokens>,
    sequences: GroupSession,
}

impl ActiveSession {
    fn start(live: Arc<LiveGroup>) -> Option<Self> {
        let tokens = live.tokens.clone()?;
        Some(Self {
            sequences: live.session.clone(),
            tokens,
            live,
        })
    }
}

#[derive(Debug, Default)]
struct StatsWindow {
    ticks: u64,
    sent: usize,
    drained: usize,
    last_drain: usize,
}

/// Cadence-driven packetizer feeding a hosted group.
pub struct SourcePipeline {
    ring: ByteConsumer,
    packetizer: Packetizer,
    cadence: Duration,
    token_wait: Duration,
    stats_interval_ticks: u64,
    metrics: Arc<StreamMetrics>,
}

impl SourcePipeline {
    /// Create a pipeline draining `ring` every `cadence`.
    ///
    /// Token waits are bounded by twice the cadence.
    pub fn new(
        ring: ByteConsumer,
        packetizer: Packetizer,
        cadence: Duration,
        stats_interval_ticks: u64,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        Self {
            ring,
            packetizer,
            cadence,
            token_wait: cadence * 2,
            stats_interval_ticks: stats_interval_ticks.max(1),
            metrics,
        }
    }

    /// Tick until `shutdown` turns true, sending whenever `status` shows a
    /// live group. Each newly live group starts from sequence zero.
    pub async fn run<T: Transport + ?Sized>(
        mut self,
        transport: Arc<T>,
        status: watch::Receiver<LinkStatus>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if *shutdown.borrow() {
            return Ok(());
        }

        let mut ticker = interval(self.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut session: Option<ActiveSession> = None;
        let mut window = StatsWindow::default();

        tracing::info!(
            "source pipeline started: {} byte payloads every {:?}",
            self.packetizer.payload_size(),
            self.cadence
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let live = status.borrow().live().cloned();
            match live {
                Some(live) if !session.as_ref().is_some_and(|s| Arc::ptr_eq(&s.live, &live)) => {
                    session = ActiveSession::start(live.clone());
                    match &session {
                        Some(_) => tracing::info!("streaming to {}", live.group),
                        None => tracing::warn!("{} has no flow tokens, not sending", live.group),
                    }
                }
                Some(_) => {}
                None => session = None,
            }
            let Some(active) = session.as_mut() else {
                continue;
            };

            let report = self.tick(transport.as_ref(), active).await;
            window.ticks += 1;
            window.sent += report.sent;
            window.drained += report.drained;
            window.last_drain = report.drained;
            if window.ticks >= self.stats_interval_ticks {
                self.log_window(&window);
                window = StatsWindow::default();
            }
        }

        tracing::info!("source pipeline stopped");
        Ok(())
    }

    async fn tick<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        session: &mut ActiveSession,
    ) -> TickReport {
        let mut report = TickReport::default();
        let group = session.live.group;
        let members: Vec<usize> = session.sequences.required().iter().collect();
        // One wait budget for the whole tick, however many members it serves.
        let deadline = Instant::now() + self.token_wait;

        for index in members {
            let token = match session.tokens.acquire_until(deadline).await {
                Some(token) => token,
                None => {
                    let fault = PipelineFault::TokenTimeout(self.token_wait);
                    self.metrics.token_timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("{} on {}, abandoning tick", fault, group);
                    report.faults.push(fault);
                    break;
                }
            };

            let (payload, drained) = self.packetizer.next_payload(&mut self.ring);
            report.drained += drained;
            let filler = payload.len() - drained;
            if filler > 0 {
                self.metrics
                    .filler_bytes
                    .fetch_add(filler as u64, Ordering::Relaxed);
            }

            let sequence = session.sequences.sequence(index).unwrap_or_default();
            let submission = token.submit();
            match transport.send(group, index, payload, sequence) {
                Ok(()) => {
                    session.sequences.advance(index);
                    report.sent += 1;
                    self.metrics.sdus_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    submission.rollback();
                    self.metrics.send_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("send {} on member {} failed: {}", sequence, index, e);
                    report.faults.push(PipelineFault::SendRejected {
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        }
        report
    }

    fn log_window(&self, window: &StatsWindow) {
        let sparse = window.last_drain < self.packetizer.payload_size() / 2;
        tracing::info!(
            "{} ticks: sent {} SDUs, drained {} bytes{}",
            window.ticks,
            window.sent,
            window.drained,
            if sparse { ", buffer sparse" } else { "" }
        );
    }
}
