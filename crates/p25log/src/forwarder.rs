// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwarder task delivering normalized events downstream.
//!
//! The listener hands events over through a bounded channel using
//! `try_send` only, so a stalled consumer never blocks datagram reception.
//! The forwarder moves them into its own bounded queue; when that queue is
//! full the oldest event is dropped. Failed deliveries are retried with
//! exponential backoff. Delivery is at-most-once and best-effort.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval, sleep, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::BACKOFF_BASE;
use crate::downstream::Downstream;
use crate::errors::{ForwardError, PipelineError};
use crate::event::{ForwardRecord, NormalizedEvent};
use crate::metrics::{PipelineMetrics, PipelineState};

pub enum ForwarderCommand {
    /// Switch to a new consumer; queued events go to the new one.
    Retarget(Box<dyn Downstream>),
    SetBackoffCeiling(Duration),
    SetStationId(Option<String>),
}

impl std::fmt::Debug for ForwarderCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retarget(downstream) => write!(f, "Retarget({})", downstream.address()),
            Self::SetBackoffCeiling(ceiling) => write!(f, "SetBackoffCeiling({ceiling:?})"),
            Self::SetStationId(station_id) => write!(f, "SetStationId({station_id:?})"),
        }
    }
}

/// Control surface of a running forwarder.
#[derive(Clone, Debug)]
pub struct ForwarderHandle {
    tx: mpsc::UnboundedSender<ForwarderCommand>,
}

impl ForwarderHandle {
    pub fn retarget(
        &self,
        downstream: Box<dyn Downstream>,
    ) -> Result<(), mpsc::error::SendError<ForwarderCommand>> {
        self.tx.send(ForwarderCommand::Retarget(downstream))
    }

    pub fn set_backoff_ceiling(
        &self,
        ceiling: Duration,
    ) -> Result<(), mpsc::error::SendError<ForwarderCommand>> {
        self.tx.send(ForwarderCommand::SetBackoffCeiling(ceiling))
    }

    pub fn set_station_id(
        &self,
        station_id: Option<String>,
    ) -> Result<(), mpsc::error::SendError<ForwarderCommand>> {
        self.tx.send(ForwarderCommand::SetStationId(station_id))
    }
}

/// Producer side of the event channel. Never waits.
#[derive(Debug)]
pub struct EventSender {
    tx: mpsc::Sender<NormalizedEvent>,
    capacity: usize,
    metrics: Arc<PipelineMetrics>,
}

impl EventSender {
    /// Hands an event to the forwarder, dropping it if the channel is full.
    pub fn send(&self, event: NormalizedEvent) -> Result<(), PipelineError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.metrics.record_dropped(1);
                Err(PipelineError::QueueOverflow(self.capacity))
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_dropped(1);
                Err(PipelineError::AlreadyStopped)
            }
        }
    }
}

pub struct ForwarderConfig {
    pub queue_capacity: usize,
    pub backoff_ceiling: Duration,
    pub drain_timeout: Duration,
    pub metrics_interval: Duration,
    pub station_id: Option<String>,
}

/// Exponential retry delay: base * 2^attempts, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        self.attempts = self.attempts.saturating_add(1);
        self.base.saturating_mul(factor).min(self.ceiling)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn set_ceiling(&mut self, ceiling: Duration) {
        self.ceiling = ceiling;
    }
}

pub struct ForwarderService {
    downstream: Box<dyn Downstream>,
    events_rx: mpsc::Receiver<NormalizedEvent>,
    control_rx: mpsc::UnboundedReceiver<ForwarderCommand>,
    queue: VecDeque<NormalizedEvent>,
    capacity: usize,
    backoff: Backoff,
    drain_timeout: Duration,
    metrics_interval: Duration,
    station_id: Option<String>,
    metrics: Arc<PipelineMetrics>,
    state: Arc<PipelineState>,
    cancel_token: CancellationToken,
}

impl ForwarderService {
    pub fn new(
        config: ForwarderConfig,
        downstream: Box<dyn Downstream>,
        metrics: Arc<PipelineMetrics>,
        state: Arc<PipelineState>,
        cancel_token: CancellationToken,
    ) -> (Self, EventSender, ForwarderHandle) {
        let capacity = config.queue_capacity.max(1);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let service = Self {
            downstream,
            events_rx,
            control_rx,
            queue: VecDeque::with_capacity(capacity),
            capacity,
            backoff: Backoff::new(BACKOFF_BASE, config.backoff_ceiling),
            drain_timeout: config.drain_timeout,
            metrics_interval: config.metrics_interval,
            station_id: config.station_id,
            metrics: Arc::clone(&metrics),
            state,
            cancel_token,
        };
        let sender = EventSender {
            tx: events_tx,
            capacity,
            metrics,
        };
        let handle = ForwarderHandle { tx: control_tx };

        (service, sender, handle)
    }

    /// Runs until every [`EventSender`] is gone or the token is cancelled,
    /// then drains the queue for at most the drain timeout.
    pub async fn run(mut self) {
        debug!("Forwarder started for {}", self.downstream.address());

        let mut report = interval(self.metrics_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        report.tick().await; // discard first tick, which is instantaneous

        let mut retry_at: Option<Instant> = None;
        loop {
            let ready = !self.queue.is_empty();
            let wake = retry_at.unwrap_or_else(Instant::now);

            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                Some(command) = self.control_rx.recv() => {
                    if self.apply(command) {
                        retry_at = None;
                    }
                }
                received = self.events_rx.recv() => match received {
                    Some(event) => self.enqueue(event),
                    None => break,
                },
                _ = report.tick() => self.report(),
                _ = sleep_until(wake), if ready => {
                    retry_at = match self.deliver_front().await {
                        Ok(()) => None,
                        Err(_) => Some(Instant::now() + self.backoff.next_delay()),
                    };
                    self.state.set_backoff_attempts(self.backoff.attempts());
                }
            }
        }

        self.drain().await;
    }

    /// Applies a control command; returns true when a pending retry should
    /// happen right away.
    fn apply(&mut self, command: ForwarderCommand) -> bool {
        match command {
            ForwarderCommand::Retarget(downstream) => {
                info!(
                    "Forwarding to {} instead of {}",
                    downstream.address(),
                    self.downstream.address()
                );
                self.downstream = downstream;
                self.backoff.reset();
                self.state.set_backoff_attempts(0);
                true
            }
            ForwarderCommand::SetBackoffCeiling(ceiling) => {
                self.backoff.set_ceiling(ceiling);
                false
            }
            ForwarderCommand::SetStationId(station_id) => {
                self.station_id = station_id;
                false
            }
        }
    }

    fn enqueue(&mut self, event: NormalizedEvent) {
        if self.queue.len() >= self.capacity {
            if let Some(oldest) = self.queue.pop_front() {
                debug!(
                    "Queue full ({} events), dropping event {}",
                    self.capacity, oldest.sequence
                );
                self.metrics.record_dropped(1);
            }
        }
        self.queue.push_back(event);
    }

    async fn deliver_front(&mut self) -> Result<(), PipelineError> {
        let Some(event) = self.queue.front() else {
            return Ok(());
        };
        let sequence = event.sequence;
        let record = match ForwardRecord::new(event, self.station_id.as_deref()).encode_line() {
            Ok(record) => record,
            Err(e) => {
                let e = ForwardError::from(e);
                error!("Event {} dropped: {}", sequence, e);
                self.queue.pop_front();
                self.metrics.record_dropped(1);
                return Ok(());
            }
        };

        match self.downstream.send(&record).await {
            Ok(()) => {
                self.queue.pop_front();
                self.metrics.record_forwarded();
                self.state.set_last_forwarded_sequence(sequence);
                if self.backoff.attempts() > 0 {
                    info!(
                        "Downstream {} reachable again after {} failed attempts",
                        self.downstream.address(),
                        self.backoff.attempts()
                    );
                }
                self.backoff.reset();
                Ok(())
            }
            Err(e) => {
                self.metrics.record_send_failure();
                let error = e.into_pipeline_error(self.downstream.address());
                if self.backoff.attempts() == 0 {
                    warn!("{}", error);
                } else {
                    debug!("{}", error);
                }
                Err(error)
            }
        }
    }

    async fn flush_queue(&mut self) {
        while !self.queue.is_empty() {
            if self.deliver_front().await.is_err() {
                sleep(self.backoff.next_delay()).await;
            }
        }
    }

    async fn drain(&mut self) {
        self.events_rx.close();
        while let Ok(event) = self.events_rx.try_recv() {
            self.enqueue(event);
        }

        let queued = self.queue.len();
        if queued > 0 {
            debug!("Draining {} queued events", queued);
        }
        let deadline = Instant::now() + self.drain_timeout;
        if timeout_at(deadline, self.flush_queue()).await.is_err() {
            let remaining = self.queue.len();
            warn!(
                "Drain timeout reached, dropping {} undelivered events",
                remaining
            );
            self.metrics.record_dropped(remaining as u64);
            self.queue.clear();
        }

        self.downstream.close().await;
        self.report();
        debug!("Forwarder stopped");
    }

    fn report(&self) {
        let snapshot = self.metrics.snapshot();
        info!(
            "Pipeline liveness: forwarded={} dropped={} parse_failures={} duplicates={} queued={} last_sequence={} backoff_attempts={}",
            snapshot.events_forwarded,
            snapshot.events_dropped,
            snapshot.parse_failures,
            snapshot.duplicates_suppressed,
            self.queue.len(),
            self.state.last_forwarded_sequence(),
            self.backoff.attempts()
        );
    }
}
