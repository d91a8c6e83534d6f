// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The externally visible event schema and its wire envelope.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::constants::{MODULE_P25LOG, PROTOCOL_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CallStart,
    CallEnd,
    RecorderStatus,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallStart => write!(f, "call_start"),
            Self::CallEnd => write!(f, "call_end"),
            Self::RecorderStatus => write!(f, "recorder_status"),
        }
    }
}

/// Kind-specific fields. Serialized without a tag; `kind` sits beside it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    CallStart {
        talkgroup: u32,
        frequency: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<u32>,
    },
    CallEnd {
        talkgroup: u32,
        frequency: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<u32>,
        duration_secs: f64,
        /// Sequence of the CallStart this end was paired with.
        #[serde(skip_serializing_if = "Option::is_none")]
        start_sequence: Option<u64>,
    },
    RecorderStatus {
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        recorder: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        frequency: Option<f64>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::CallStart { .. } => EventKind::CallStart,
            Self::CallEnd { .. } => EventKind::CallEnd,
            Self::RecorderStatus { .. } => EventKind::RecorderStatus,
        }
    }

    pub fn talkgroup(&self) -> Option<u32> {
        match self {
            Self::CallStart { talkgroup, .. } | Self::CallEnd { talkgroup, .. } => {
                Some(*talkgroup)
            }
            Self::RecorderStatus { .. } => None,
        }
    }
}

/// A sequenced event, the unit handed to the forwarder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEvent {
    pub sequence: u64,
    pub kind: EventKind,
    /// Time from the log line, not the arrival time.
    pub event_time: DateTime<Utc>,
    pub payload: EventPayload,
}

impl NormalizedEvent {
    pub fn new(sequence: u64, event_time: DateTime<Utc>, payload: EventPayload) -> Self {
        Self {
            sequence,
            kind: payload.kind(),
            event_time,
            payload,
        }
    }
}

/// Record written to the downstream consumer: the event plus the station
/// identification the consumer expects from a pseudo-device.
#[derive(Debug, Serialize)]
pub struct ForwardRecord<'a> {
    pub module: u8,
    pub protocol: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_id: Option<&'a str>,
    #[serde(flatten)]
    pub event: &'a NormalizedEvent,
}

impl<'a> ForwardRecord<'a> {
    pub fn new(event: &'a NormalizedEvent, station_id: Option<&'a str>) -> Self {
        Self {
            module: MODULE_P25LOG,
            protocol: PROTOCOL_VERSION,
            station_id,
            event,
        }
    }

    /// One JSON document terminated by `\n`.
    pub fn encode_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}
