// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-pipeline counters and shared state.
//!
//! Each pipeline owns one [`PipelineMetrics`] and one [`PipelineState`] behind
//! an `Arc`; nothing here is process-global, so several pipelines can run side
//! by side.

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    datagrams_received: AtomicU64,
    reader_faults: AtomicU64,
    lines_received: AtomicU64,
    parse_failures: AtomicU64,
    duplicates_suppressed: AtomicU64,
    events_normalized: AtomicU64,
    events_forwarded: AtomicU64,
    events_dropped: AtomicU64,
    send_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub datagrams_received: u64,
    pub reader_faults: u64,
    pub lines_received: u64,
    pub parse_failures: u64,
    pub duplicates_suppressed: u64,
    pub events_normalized: u64,
    pub events_forwarded: u64,
    pub events_dropped: u64,
    pub send_failures: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_datagram(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reader_fault(&self) {
        self.reader_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lines(&self, count: u64) {
        self.lines_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_normalized(&self, count: u64) {
        self.events_normalized.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.events_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.events_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            reader_faults: self.reader_faults.load(Ordering::Relaxed),
            lines_received: self.lines_received.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            events_normalized: self.events_normalized.load(Ordering::Relaxed),
            events_forwarded: self.events_forwarded.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

/// Process-visible pipeline state.
///
/// `last_assigned_sequence` is written by the listener task only,
/// `last_forwarded_sequence` and `backoff_attempts` by the forwarder only,
/// and `listen_addr` by the coordinator.
#[derive(Debug, Default)]
pub struct PipelineState {
    last_assigned_sequence: AtomicU64,
    last_forwarded_sequence: AtomicU64,
    backoff_attempts: AtomicU32,
    listen_addr: RwLock<Option<SocketAddr>>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_last_assigned_sequence(&self, sequence: u64) {
        self.last_assigned_sequence.store(sequence, Ordering::Release);
    }

    pub fn last_assigned_sequence(&self) -> u64 {
        self.last_assigned_sequence.load(Ordering::Acquire)
    }

    pub fn set_last_forwarded_sequence(&self, sequence: u64) {
        self.last_forwarded_sequence
            .fetch_max(sequence, Ordering::AcqRel);
    }

    pub fn last_forwarded_sequence(&self) -> u64 {
        self.last_forwarded_sequence.load(Ordering::Acquire)
    }

    pub fn set_backoff_attempts(&self, attempts: u32) {
        self.backoff_attempts.store(attempts, Ordering::Release);
    }

    pub fn backoff_attempts(&self) -> u32 {
        self.backoff_attempts.load(Ordering::Acquire)
    }

    pub fn set_listen_addr(&self, addr: Option<SocketAddr>) {
        if let Ok(mut guard) = self.listen_addr.write() {
            *guard = addr;
        }
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr.read().map(|guard| *guard).unwrap_or(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = PipelineMetrics::new();
        metrics.record_datagram();
        metrics.record_lines(3);
        metrics.record_parse_failure();
        metrics.record_normalized(2);
        metrics.record_dropped(4);
        metrics.record_forwarded();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.datagrams_received, 1);
        assert_eq!(snapshot.lines_received, 3);
        assert_eq!(snapshot.parse_failures, 1);
        assert_eq!(snapshot.events_normalized, 2);
        assert_eq!(snapshot.events_dropped, 4);
        assert_eq!(snapshot.events_forwarded, 1);
        assert_eq!(snapshot.send_failures, 0);
    }

    #[test]
    fn test_last_forwarded_sequence_never_moves_backwards() {
        let state = PipelineState::new();
        state.set_last_forwarded_sequence(7);
        state.set_last_forwarded_sequence(5);
        assert_eq!(state.last_forwarded_sequence(), 7);
    }

    #[test]
    fn test_listen_addr_round_trip() {
        let state = PipelineState::new();
        assert_eq!(state.listen_addr(), None);
        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        state.set_listen_addr(Some(addr));
        assert_eq!(state.listen_addr(), Some(addr));
    }
}
