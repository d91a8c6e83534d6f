// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingest task: reads datagrams, parses lines and feeds the normalizer.
//!
//! A single task owns the reader, the parser and the normalizer, so the
//! sequence counter has exactly one writer. Released events go to the
//! forwarder through a non-blocking [`EventSender`].

use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::entry::{EntryParser, ParsedEntry};
use crate::errors::PipelineError;
use crate::event::NormalizedEvent;
use crate::forwarder::EventSender;
use crate::metrics::{PipelineMetrics, PipelineState};
use crate::normalizer::Normalizer;
use crate::reader::{BufferReader, LineReader, RawLine};

/// How often held entries and stale fragments are checked.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub(crate) enum ListenerCommand {
    Rebind(BufferReader),
    Release(oneshot::Sender<()>),
    SetWindow(Duration),
    SetTimezone(Tz),
    SetPrintAll(bool),
}

#[derive(Clone, Debug)]
pub struct ListenerHandle {
    tx: mpsc::UnboundedSender<ListenerCommand>,
}

impl ListenerHandle {
    pub(crate) fn rebind(&self, buffer_reader: BufferReader) -> Result<(), PipelineError> {
        self.send(ListenerCommand::Rebind(buffer_reader))
    }

    /// Closes the inbound socket and waits until it is gone. Fragments
    /// already buffered are kept for the next socket.
    pub(crate) async fn release(&self) -> Result<(), PipelineError> {
        let (ack, released) = oneshot::channel();
        self.send(ListenerCommand::Release(ack))?;
        released.await.map_err(|_| PipelineError::AlreadyStopped)
    }

    pub fn set_window(&self, window: Duration) -> Result<(), PipelineError> {
        self.send(ListenerCommand::SetWindow(window))
    }

    pub fn set_timezone(&self, timezone: Tz) -> Result<(), PipelineError> {
        self.send(ListenerCommand::SetTimezone(timezone))
    }

    pub fn set_print_all(&self, print_all: bool) -> Result<(), PipelineError> {
        self.send(ListenerCommand::SetPrintAll(print_all))
    }

    fn send(&self, command: ListenerCommand) -> Result<(), PipelineError> {
        self.tx
            .send(command)
            .map_err(|_| PipelineError::AlreadyStopped)
    }
}

pub struct Listener {
    reader: LineReader,
    parser: EntryParser,
    normalizer: Normalizer,
    events: EventSender,
    print_all: bool,
    commands: mpsc::UnboundedReceiver<ListenerCommand>,
    metrics: Arc<PipelineMetrics>,
    state: Arc<PipelineState>,
    cancel_token: CancellationToken,
}

impl Listener {
    pub fn new(
        reader: LineReader,
        parser: EntryParser,
        normalizer: Normalizer,
        events: EventSender,
        metrics: Arc<PipelineMetrics>,
        state: Arc<PipelineState>,
        cancel_token: CancellationToken,
    ) -> (Self, ListenerHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let listener = Self {
            reader,
            parser,
            normalizer,
            events,
            print_all: false,
            commands,
            metrics,
            state,
            cancel_token,
        };
        (listener, ListenerHandle { tx })
    }

    #[must_use]
    pub fn with_print_all(mut self, print_all: bool) -> Self {
        self.print_all = print_all;
        self
    }

    /// Main loop. Returns once cancelled, or with the fault that stopped
    /// the reader. Either way buffered entries are flushed to the forwarder
    /// before returning.
    pub async fn spin(mut self) -> Result<(), PipelineError> {
        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break Ok(()),
                Some(command) = self.commands.recv() => self.apply(command),
                read = self.reader.read_lines(&self.metrics, &self.cancel_token) => match read {
                    Ok(lines) => self.ingest(lines),
                    Err(e) => {
                        error!("Listener stopped: {}", e);
                        break Err(e);
                    }
                },
                _ = ticker.tick() => self.on_tick(),
            }
        };

        self.finish();
        result
    }

    fn apply(&mut self, command: ListenerCommand) {
        match command {
            ListenerCommand::Rebind(buffer_reader) => {
                if let Some(addr) = buffer_reader.local_addr() {
                    info!("Listening for recorder logs on {}", addr);
                }
                self.reader.rebind(buffer_reader);
            }
            ListenerCommand::Release(ack) => {
                if let Some(addr) = self.reader.local_addr() {
                    info!("Releasing {}", addr);
                }
                self.reader.rebind(BufferReader::Unbound);
                let _ = ack.send(());
            }
            ListenerCommand::SetWindow(window) => {
                debug!("Normalization window set to {:?}", window);
                self.normalizer.set_window(window);
            }
            ListenerCommand::SetTimezone(timezone) => {
                debug!("Recorder timezone set to {}", timezone);
                self.parser.set_timezone(timezone);
            }
            ListenerCommand::SetPrintAll(print_all) => self.print_all = print_all,
        }
    }

    fn on_tick(&mut self) {
        let stale = self.reader.flush_stale(self.normalizer.window(), &self.metrics);
        self.ingest(stale);
        let released = self.normalizer.tick(now(), &self.metrics);
        self.dispatch(released);
    }

    fn ingest(&mut self, lines: Vec<RawLine>) {
        for line in lines {
            let entry = self.parser.parse(&line);
            if let ParsedEntry::Unrecognized { line: text, .. } = &entry {
                self.metrics.record_parse_failure();
                let mismatch = PipelineError::ParseMismatch(text.clone());
                trace!("Dropped line from {}: {}", line.source, mismatch);
                continue;
            }
            if self.print_all {
                self.print_entry(&entry);
            }
            let released = self.normalizer.push(entry, now(), &self.metrics);
            self.dispatch(released);
        }
    }

    fn print_entry(&self, entry: &ParsedEntry) {
        match entry {
            ParsedEntry::CallStart(e) => info!(
                "Call start: talkgroup {} on {} MHz",
                e.fields.talkgroup, e.fields.frequency
            ),
            ParsedEntry::CallEnd(e) => info!(
                "Call end: talkgroup {} on {} MHz after {}s",
                e.fields.talkgroup, e.fields.frequency, e.fields.duration_secs
            ),
            ParsedEntry::RecorderStatus(e) => info!("Recorder status: {}", e.fields.state),
            ParsedEntry::Unrecognized { .. } => {}
        }
    }

    fn dispatch(&mut self, released: Vec<NormalizedEvent>) {
        if released.is_empty() {
            return;
        }
        self.state
            .set_last_assigned_sequence(self.normalizer.last_sequence());
        for event in released {
            let sequence = event.sequence;
            if let Err(e) = self.events.send(event) {
                debug!("Event {} not queued: {}", sequence, e);
            }
        }
    }

    fn finish(&mut self) {
        let remaining = self.reader.flush_all(&self.metrics);
        self.ingest(remaining);
        let released = self.normalizer.drain(&self.metrics);
        if !released.is_empty() {
            debug!("Flushing {} held events on shutdown", released.len());
        }
        self.dispatch(released);
    }

    /// Reads and processes a single datagram.
    #[cfg(test)]
    async fn consume(&mut self) -> Result<(), PipelineError> {
        let lines = self
            .reader
            .read_lines(&self.metrics, &self.cancel_token)
            .await?;
        self.ingest(lines);
        Ok(())
    }
}

/// Wall-clock instant for the normalizer's hold limit; follows tokio's clock
/// so it stays consistent with paused time.
fn now() -> std::time::Instant {
    Instant::now().into_std()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::downstream::Downstream;
    use crate::entry::{CallStart, EntryKind, EntryMatcher, LineContext};
    use crate::errors::ForwardError;
    use crate::forwarder::{ForwarderConfig, ForwarderService};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use tracing_test::traced_test;

    struct NullDownstream;

    #[async_trait]
    impl Downstream for NullDownstream {
        fn address(&self) -> &str {
            "null:0"
        }

        async fn send(&mut self, _record: &[u8]) -> Result<(), ForwardError> {
            Ok(())
        }
    }

    struct Setup {
        listener: Listener,
        handle: ListenerHandle,
        forwarder: ForwarderService,
        metrics: Arc<PipelineMetrics>,
        state: Arc<PipelineState>,
    }

    struct PatchMatcher;

    impl EntryMatcher for PatchMatcher {
        fn kind(&self) -> EntryKind {
            EntryKind::CallStart
        }

        fn name(&self) -> &'static str {
            "patch"
        }

        fn try_match(&self, line: &LineContext<'_>) -> Option<ParsedEntry> {
            let talkgroup = line.body.strip_prefix("PATCH ")?.parse().ok()?;
            Some(ParsedEntry::CallStart(line.entry(CallStart {
                talkgroup,
                frequency: 851.0,
                source: None,
            })))
        }
    }

    fn setup(buffer_reader: BufferReader, window: Duration) -> Setup {
        setup_with_parser(buffer_reader, window, EntryParser::new(chrono_tz::UTC))
    }

    fn setup_with_parser(
        buffer_reader: BufferReader,
        window: Duration,
        parser: EntryParser,
    ) -> Setup {
        let metrics = Arc::new(PipelineMetrics::new());
        let state = Arc::new(PipelineState::new());
        let cancel_token = CancellationToken::new();
        let (forwarder, events, _forwarder_handle) = ForwarderService::new(
            ForwarderConfig {
                queue_capacity: 64,
                backoff_ceiling: Duration::from_secs(1),
                drain_timeout: Duration::from_secs(1),
                metrics_interval: Duration::from_secs(10),
                station_id: None,
            },
            Box::new(NullDownstream),
            Arc::clone(&metrics),
            Arc::clone(&state),
            cancel_token.child_token(),
        );
        let (listener, handle) = Listener::new(
            LineReader::new(buffer_reader),
            parser,
            Normalizer::new(window, 1),
            events,
            Arc::clone(&metrics),
            Arc::clone(&state),
            cancel_token,
        );
        Setup {
            listener,
            handle,
            forwarder,
            metrics,
            state,
        }
    }

    fn mirror(data: &str) -> BufferReader {
        BufferReader::MirrorTest(
            data.as_bytes().to_vec(),
            SocketAddr::from(([127, 0, 0, 1], 40000)),
        )
    }

    #[tokio::test]
    async fn test_consume_call_start() {
        let Setup {
            mut listener,
            metrics,
            state,
            ..
        } = setup(
            mirror("2024-03-01 12:00:00 [CALLSTART] tg=101 freq=851.0125 src=4455\n"),
            Duration::from_secs(3),
        );

        listener.consume().await.unwrap();
        assert_eq!(listener.normalizer.pending_len(), 1);

        listener.finish();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.lines_received, 1);
        assert_eq!(snapshot.events_normalized, 1);
        assert_eq!(snapshot.parse_failures, 0);
        assert_eq!(state.last_assigned_sequence(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_consume_counts_parse_failures() {
        let Setup {
            mut listener,
            metrics,
            ..
        } = setup(
            mirror("garbage text not matching grammar\n"),
            Duration::from_secs(3),
        );

        listener.consume().await.unwrap();
        listener.finish();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.parse_failures, 1);
        assert_eq!(snapshot.events_normalized, 0);
        assert!(!logs_contain("Listener stopped"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_parse_failure_is_traced_as_mismatch() {
        let Setup { mut listener, .. } = setup(
            mirror("2024-03-01 12:00:00 [CALLSTART] tg=7 tg=9 freq=851.0\n"),
            Duration::from_secs(3),
        );

        listener.consume().await.unwrap();
        assert!(logs_contain("Line does not match any known grammar"));
    }

    #[tokio::test]
    async fn test_timezone_change_keeps_added_matchers() {
        let Setup {
            mut listener,
            metrics,
            ..
        } = setup_with_parser(
            mirror("2024-03-01 12:00:00 PATCH 4101\n"),
            Duration::from_secs(3),
            EntryParser::new(chrono_tz::UTC).with_matcher(PatchMatcher),
        );

        listener.apply(ListenerCommand::SetTimezone(chrono_tz::Europe::Berlin));
        assert_eq!(listener.parser.timezone(), chrono_tz::Europe::Berlin);

        listener.consume().await.unwrap();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.parse_failures, 0);
        assert_eq!(listener.normalizer.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_release_drops_the_socket() {
        let buffer_reader = BufferReader::bind("127.0.0.1:0").await.unwrap();
        let addr = buffer_reader.local_addr().unwrap();
        let Setup {
            listener,
            handle,
            forwarder,
            ..
        } = setup(buffer_reader, Duration::from_millis(200));
        let cancel_token = listener.cancel_token.clone();

        let forwarder_task = tokio::spawn(forwarder.run());
        let listener_task = tokio::spawn(listener.spin());

        handle.release().await.unwrap();
        let rebound = BufferReader::bind(&addr.to_string()).await.unwrap();
        handle.rebind(rebound).unwrap();

        cancel_token.cancel();
        listener_task.await.unwrap().unwrap();
        forwarder_task.await.unwrap();
        assert!(matches!(
            handle.release().await,
            Err(PipelineError::AlreadyStopped)
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_print_all_logs_talkgroups() {
        let Setup { listener, .. } = setup(
            mirror("2024-03-01 12:00:00 [CALLSTART] tg=2201 freq=852.3375\n"),
            Duration::from_secs(3),
        );
        let mut listener = listener.with_print_all(true);

        listener.consume().await.unwrap();
        assert!(logs_contain("Call start: talkgroup 2201"));
    }

    #[tokio::test]
    async fn test_spin_over_udp_and_stop() {
        let buffer_reader = BufferReader::bind("127.0.0.1:0").await.unwrap();
        let addr = buffer_reader.local_addr().unwrap();
        let Setup {
            listener,
            handle,
            forwarder,
            metrics,
            state,
        } = setup(buffer_reader, Duration::from_millis(200));
        let cancel_token = listener.cancel_token.clone();

        let forwarder_task = tokio::spawn(forwarder.run());
        let listener_task = tokio::spawn(listener.spin());
        handle.set_print_all(true).unwrap();

        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(
                b"2024-03-01 12:00:01 [CALLSTART] tg=7 freq=851.5\n2024-03-01 12:00:00 [STATUS] state=idle rec=2\n",
                addr,
            )
            .await
            .unwrap();

        for _ in 0..100 {
            if metrics.snapshot().events_forwarded == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(metrics.snapshot().events_forwarded, 2);
        assert_eq!(state.last_assigned_sequence(), 2);
        assert_eq!(state.last_forwarded_sequence(), 2);

        cancel_token.cancel();
        listener_task.await.unwrap().unwrap();
        forwarder_task.await.unwrap();
        assert!(handle.set_window(Duration::from_secs(1)).is_err());
    }
}
