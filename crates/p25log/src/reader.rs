// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line reader for the recorder's UDP log stream.
//!
//! Datagrams carry no framing guarantee: one datagram may hold several lines,
//! or only part of one. [`LineAssembler`] keeps the unterminated tail of each
//! sender and prepends it to that sender's next datagram before splitting.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::constants::{BUFFER_SIZE, MAX_LINE_LENGTH};
use crate::errors::PipelineError;
use crate::metrics::PipelineMetrics;

// Consecutive receive errors tolerated before the inbound socket is considered
// lost. Backoffs are 20ms, 40ms, 80ms, 160ms before giving up.
const MAX_RECV_ERRORS: u32 = 5;

/// One log line as received, before any parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub bytes: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub source: SocketAddr,
}

impl RawLine {
    /// Line content, with invalid UTF-8 replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

#[derive(Debug)]
struct PendingTail {
    bytes: Vec<u8>,
    received_at: DateTime<Utc>,
    since: Instant,
}

/// Reassembles datagrams into complete lines, per sender.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: HashMap<SocketAddr, PendingTail>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits `data` on `\n` and returns the complete lines it finishes.
    ///
    /// A trailing fragment without terminator is held until the same sender
    /// delivers the rest. Blank lines are skipped and a trailing `\r` is
    /// stripped.
    pub fn push(
        &mut self,
        data: &[u8],
        source: SocketAddr,
        received_at: DateTime<Utc>,
        metrics: &PipelineMetrics,
    ) -> Vec<RawLine> {
        let (mut buffer, line_time) = match self.pending.remove(&source) {
            Some(tail) => {
                let mut bytes = tail.bytes;
                bytes.extend_from_slice(data);
                (bytes, tail.received_at)
            }
            None => (data.to_vec(), received_at),
        };

        let mut lines = Vec::new();
        let mut start = 0;
        // The first line may have started in an earlier datagram.
        let mut first_time = Some(line_time);
        while let Some(offset) = buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let stamp = first_time.take().unwrap_or(received_at);
            if let Some(line) = make_line(&buffer[start..end], stamp, source) {
                lines.push(line);
            }
            start = end + 1;
        }

        if start < buffer.len() {
            let tail_len = buffer.len() - start;
            if tail_len > MAX_LINE_LENGTH {
                warn!(
                    "Discarding {} byte unterminated fragment from {}: exceeds {} bytes",
                    tail_len, source, MAX_LINE_LENGTH
                );
                metrics.record_reader_fault();
            } else {
                let tail: Vec<u8> = buffer.drain(start..).collect();
                self.pending.insert(
                    source,
                    PendingTail {
                        bytes: tail,
                        received_at: first_time.unwrap_or(received_at),
                        since: Instant::now(),
                    },
                );
            }
        }

        lines
    }

    /// Emits fragments that have waited longer than `max_age` as lines.
    ///
    /// Some forwarders send one line per datagram without a terminator; those
    /// lines surface here instead of waiting forever.
    pub fn flush_stale(&mut self, max_age: Duration) -> Vec<RawLine> {
        let now = Instant::now();
        let stale: Vec<SocketAddr> = self
            .pending
            .iter()
            .filter(|(_, tail)| now.duration_since(tail.since) >= max_age)
            .map(|(source, _)| *source)
            .collect();

        stale
            .into_iter()
            .filter_map(|source| {
                let tail = self.pending.remove(&source)?;
                make_line(&tail.bytes, tail.received_at, source)
            })
            .collect()
    }

    /// Drops the fragment held for `source`, if any.
    pub fn discard(&mut self, source: SocketAddr) -> bool {
        self.pending.remove(&source).is_some()
    }

    /// Emits every held fragment, used on shutdown.
    pub fn flush_all(&mut self) -> Vec<RawLine> {
        self.flush_stale(Duration::ZERO)
    }

    pub fn pending_sources(&self) -> usize {
        self.pending.len()
    }
}

fn make_line(bytes: &[u8], received_at: DateTime<Utc>, source: SocketAddr) -> Option<RawLine> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(RawLine {
        bytes: bytes.to_vec(),
        received_at,
        source,
    })
}

// BufferReader abstracts the inbound transport.
#[derive(Debug)]
pub(crate) enum BufferReader {
    /// UDP socket reader
    UdpSocket(tokio::net::UdpSocket),

    /// Mirror reader for testing - replays a fixed buffer
    #[allow(dead_code)]
    MirrorTest(Vec<u8>, SocketAddr),

    /// No socket held; reads never complete until a socket is rebound.
    Unbound,
}

impl BufferReader {
    /// Binds the inbound UDP socket. Failure here is fatal for the pipeline.
    pub(crate) async fn bind(address: &str) -> Result<Self, PipelineError> {
        let socket = tokio::net::UdpSocket::bind(address)
            .await
            .map_err(|e| PipelineError::transport(format!("binding {address}"), e))?;
        Ok(BufferReader::UdpSocket(socket))
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            BufferReader::UdpSocket(socket) => socket.local_addr().ok(),
            BufferReader::MirrorTest(_, addr) => Some(*addr),
            BufferReader::Unbound => None,
        }
    }

    async fn read(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        match self {
            BufferReader::UdpSocket(socket) => {
                let mut buf = vec![0; BUFFER_SIZE];
                let (amt, src) = socket.recv_from(&mut buf).await?;
                buf.truncate(amt);
                Ok((buf, src))
            }
            BufferReader::MirrorTest(data, source) => Ok((data.clone(), *source)),
            BufferReader::Unbound => std::future::pending().await,
        }
    }
}

/// Receives datagrams and turns them into [`RawLine`]s.
#[derive(Debug)]
pub struct LineReader {
    buffer_reader: BufferReader,
    assembler: LineAssembler,
    consecutive_errors: u32,
}

impl LineReader {
    pub(crate) fn new(buffer_reader: BufferReader) -> Self {
        Self {
            buffer_reader,
            assembler: LineAssembler::new(),
            consecutive_errors: 0,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.buffer_reader.local_addr()
    }

    /// Swaps the inbound socket, keeping any buffered fragments.
    pub(crate) fn rebind(&mut self, buffer_reader: BufferReader) {
        self.buffer_reader = buffer_reader;
        self.consecutive_errors = 0;
    }

    /// Waits for one datagram and returns the complete lines it yields.
    ///
    /// Malformed or empty datagrams are logged and yield no lines. Receive
    /// errors are retried with backoff; only a run of them is returned as a
    /// transport fault.
    pub async fn read_lines(
        &mut self,
        metrics: &PipelineMetrics,
        cancel_token: &CancellationToken,
    ) -> Result<Vec<RawLine>, PipelineError> {
        let (buf, src) = match self.buffer_reader.read().await {
            Ok(read) => {
                self.consecutive_errors = 0;
                read
            }
            Err(e) => {
                self.handle_recv_error(e, metrics, cancel_token).await?;
                return Ok(Vec::new());
            }
        };

        metrics.record_datagram();
        if buf.is_empty() {
            debug!("Ignoring empty datagram from {}", src);
            metrics.record_reader_fault();
            return Ok(Vec::new());
        }
        if buf.len() >= BUFFER_SIZE {
            // The kernel drops whatever did not fit; nothing in it can be
            // joined safely with what came before or what comes next.
            warn!(
                "Discarding datagram from {}: {} bytes fills the receive buffer",
                src,
                buf.len()
            );
            metrics.record_reader_fault();
            self.assembler.discard(src);
            return Ok(Vec::new());
        }
        if std::str::from_utf8(&buf).is_err() {
            // Kept: a multi-byte character may straddle two datagrams.
            debug!("Datagram from {} is not valid UTF-8 on its own", src);
        }

        let lines = self.assembler.push(&buf, src, Utc::now(), metrics);
        metrics.record_lines(lines.len() as u64);
        Ok(lines)
    }

    pub fn flush_stale(&mut self, max_age: Duration, metrics: &PipelineMetrics) -> Vec<RawLine> {
        let lines = self.assembler.flush_stale(max_age);
        metrics.record_lines(lines.len() as u64);
        lines
    }

    pub fn flush_all(&mut self, metrics: &PipelineMetrics) -> Vec<RawLine> {
        let lines = self.assembler.flush_all();
        metrics.record_lines(lines.len() as u64);
        lines
    }

    async fn handle_recv_error(
        &mut self,
        error: io::Error,
        metrics: &PipelineMetrics,
        cancel_token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        metrics.record_reader_fault();
        self.consecutive_errors += 1;
        error!("Error receiving datagram: {}", error);

        if self.consecutive_errors >= MAX_RECV_ERRORS {
            return Err(PipelineError::transport(
                format!("receiving ({} consecutive errors)", self.consecutive_errors),
                error,
            ));
        }

        let backoff_ms = 10u64 * (1 << self.consecutive_errors);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
            _ = cancel_token.cancelled() => {}
        }
        Ok(())
    }
}
