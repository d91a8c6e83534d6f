// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry parser for trunk-recorder log lines.
//!
//! A line is `TIMESTAMP [SEVERITY] BODY`. The timestamp and optional severity
//! are split off once, then the body is offered to a list of
//! [`EntryMatcher`]s ordered by kind priority (CallStart, CallEnd,
//! RecorderStatus). The first matcher that recognizes the body wins. Lines no
//! matcher accepts, including lines where a matcher found its tag but not all
//! of its mandatory fields, become [`ParsedEntry::Unrecognized`].
//!
//! Two grammar families ship by default:
//!
//! ```text
//! 2024-01-01 10:00:00 [CALLSTART] tg=101 freq=851.0125 src=4411
//! 2024-01-01 10:00:12 [CALLEND] tg=101 freq=851.0125 dur=12
//! 2024-01-01 10:00:30 [STATUS] state=idle rec=0
//! [2024-01-01 10:00:00.123456] (info)   [sys]   12C<TAB>TG:  101<TAB>Freq: 851.012500 MHz<TAB>Starting P25 Recorder Num [0]
//! [2024-01-01 10:00:12.000000] (info)   [sys]   12C<TAB>TG:  101<TAB>Freq: 851.012500 MHz<TAB>Concluding Recorded Call - Last Update: 4s<TAB>Call Elapsed: 12
//! ```

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use lazy_static::lazy_static;
use regex::Regex;

use crate::reader::RawLine;
use crate::timestamp::{contains_timestamp, TimestampParser};

lazy_static! {
    #[allow(clippy::expect_used)]
    static ref SEVERITY: Regex = Regex::new(
        r"(?i)^[\[(](trace|debug|info|notice|warning|warn|error|fatal|critical)[\])]\s*"
    )
    .expect("failed creating regex");

    /// `[TAG] rest`, the tagged key/value grammar.
    #[allow(clippy::expect_used)]
    static ref TAGGED_BODY: Regex =
        Regex::new(r"^\[([A-Za-z_]+)\](?:\s+(.*))?$").expect("failed creating regex");

    #[allow(clippy::expect_used)]
    static ref CALL_ELAPSED: Regex =
        Regex::new(r"Call Elapsed:\s*(\d+(?:\.\d+)?)").expect("failed creating regex");
}

/// Kinds of recognized entries, in matching priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    CallStart,
    CallEnd,
    RecorderStatus,
    Unrecognized,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallStart => write!(f, "call_start"),
            Self::CallEnd => write!(f, "call_end"),
            Self::RecorderStatus => write!(f, "recorder_status"),
            Self::Unrecognized => write!(f, "unrecognized"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "notice" => Some(Self::Notice),
            "warning" | "warn" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "fatal" | "critical" => Some(Self::Fatal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallStart {
    pub talkgroup: u32,
    /// MHz
    pub frequency: f64,
    pub source: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallEnd {
    pub talkgroup: u32,
    /// MHz
    pub frequency: f64,
    pub source: Option<u32>,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecorderStatus {
    pub state: String,
    pub recorder: Option<u32>,
    pub frequency: Option<f64>,
}

/// A recognized line: its times plus the kind-specific fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<T> {
    /// Time written in the log line, resolved to UTC.
    pub logged_at: DateTime<Utc>,
    /// Arrival time of the datagram that completed the line.
    pub received_at: DateTime<Utc>,
    pub severity: Option<Severity>,
    pub fields: T,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEntry {
    CallStart(Entry<CallStart>),
    CallEnd(Entry<CallEnd>),
    RecorderStatus(Entry<RecorderStatus>),
    Unrecognized {
        received_at: DateTime<Utc>,
        line: String,
    },
}

impl ParsedEntry {
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::CallStart(_) => EntryKind::CallStart,
            Self::CallEnd(_) => EntryKind::CallEnd,
            Self::RecorderStatus(_) => EntryKind::RecorderStatus,
            Self::Unrecognized { .. } => EntryKind::Unrecognized,
        }
    }

    pub fn logged_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::CallStart(entry) => Some(entry.logged_at),
            Self::CallEnd(entry) => Some(entry.logged_at),
            Self::RecorderStatus(entry) => Some(entry.logged_at),
            Self::Unrecognized { .. } => None,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized { .. })
    }
}

/// What a matcher sees: the line with timestamp and severity already split off.
#[derive(Debug, Clone, Copy)]
pub struct LineContext<'a> {
    pub logged_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub severity: Option<Severity>,
    pub body: &'a str,
}

impl LineContext<'_> {
    pub fn entry<T>(&self, fields: T) -> Entry<T> {
        Entry {
            logged_at: self.logged_at,
            received_at: self.received_at,
            severity: self.severity,
            fields,
        }
    }
}

/// One grammar variant. Returns `None` unless every mandatory field is present.
pub trait EntryMatcher: Send + Sync {
    fn kind(&self) -> EntryKind;

    fn name(&self) -> &'static str;

    fn try_match(&self, line: &LineContext<'_>) -> Option<ParsedEntry>;
}

/// Splits `tag=value` pairs. Tokens without `=` are ignored; a key given
/// twice makes the whole body unusable.
fn key_values(rest: &str) -> Option<HashMap<String, &str>> {
    let mut fields = HashMap::new();
    for (key, value) in rest.split_whitespace().filter_map(|token| token.split_once('=')) {
        if fields.insert(key.to_ascii_lowercase(), value).is_some() {
            return None;
        }
    }
    Some(fields)
}

fn tagged_fields<'a>(body: &'a str, tag: &str) -> Option<HashMap<String, &'a str>> {
    let captures = TAGGED_BODY.captures(body)?;
    if !captures.get(1)?.as_str().eq_ignore_ascii_case(tag) {
        return None;
    }
    key_values(captures.get(2).map_or("", |m| m.as_str()))
}

fn parse_frequency(raw: &str) -> Option<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|freq| freq.is_finite() && *freq > 0.0)
}

fn parse_duration(raw: &str) -> Option<f64> {
    let raw = raw.strip_suffix('s').unwrap_or(raw);
    raw.parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
}

/// Optional field: absent is fine, present but malformed fails the match.
fn optional<T>(value: Option<&&str>, parse: impl Fn(&str) -> Option<T>) -> Option<Option<T>> {
    match value {
        None => Some(None),
        Some(raw) => parse(*raw).map(Some),
    }
}

/// `[CALLSTART] tg=<u32> freq=<MHz> [src=<u32>]`
#[derive(Debug, Default)]
pub struct TaggedCallStartMatcher;

impl EntryMatcher for TaggedCallStartMatcher {
    fn kind(&self) -> EntryKind {
        EntryKind::CallStart
    }

    fn name(&self) -> &'static str {
        "tagged_call_start"
    }

    fn try_match(&self, line: &LineContext<'_>) -> Option<ParsedEntry> {
        let fields = tagged_fields(line.body, "CALLSTART")?;
        let call = CallStart {
            talkgroup: fields.get("tg")?.parse().ok()?,
            frequency: parse_frequency(fields.get("freq")?)?,
            source: optional(fields.get("src"), |raw| raw.parse().ok())?,
        };
        Some(ParsedEntry::CallStart(line.entry(call)))
    }
}

/// `[CALLEND] tg=<u32> freq=<MHz> dur=<secs> [src=<u32>]`
#[derive(Debug, Default)]
pub struct TaggedCallEndMatcher;

impl EntryMatcher for TaggedCallEndMatcher {
    fn kind(&self) -> EntryKind {
        EntryKind::CallEnd
    }

    fn name(&self) -> &'static str {
        "tagged_call_end"
    }

    fn try_match(&self, line: &LineContext<'_>) -> Option<ParsedEntry> {
        let fields = tagged_fields(line.body, "CALLEND")?;
        let call = CallEnd {
            talkgroup: fields.get("tg")?.parse().ok()?,
            frequency: parse_frequency(fields.get("freq")?)?,
            source: optional(fields.get("src"), |raw| raw.parse().ok())?,
            duration_secs: parse_duration(fields.get("dur")?)?,
        };
        Some(ParsedEntry::CallEnd(line.entry(call)))
    }
}

/// `[STATUS] state=<word> [rec=<u32>] [freq=<MHz>]`
#[derive(Debug, Default)]
pub struct TaggedStatusMatcher;

impl EntryMatcher for TaggedStatusMatcher {
    fn kind(&self) -> EntryKind {
        EntryKind::RecorderStatus
    }

    fn name(&self) -> &'static str {
        "tagged_status"
    }

    fn try_match(&self, line: &LineContext<'_>) -> Option<ParsedEntry> {
        let fields = tagged_fields(line.body, "STATUS")?;
        let state = fields.get("state").filter(|state| !state.is_empty())?;
        let status = RecorderStatus {
            state: state.to_ascii_lowercase(),
            recorder: optional(fields.get("rec"), |raw| raw.parse().ok())?,
            frequency: optional(fields.get("freq"), parse_frequency)?,
        };
        Some(ParsedEntry::RecorderStatus(line.entry(status)))
    }
}

/// Fields of trunk-recorder's own tab-separated call lines.
#[derive(Debug, Default)]
struct NativeCallLine<'a> {
    talkgroup: Option<u32>,
    frequency: Option<f64>,
    source: Option<u32>,
    messages: Vec<&'a str>,
}

impl<'a> NativeCallLine<'a> {
    fn parse(body: &'a str) -> Option<Self> {
        if !body.contains('\t') {
            return None;
        }
        let mut line = NativeCallLine::default();
        // The first column is the `[sys] callid` prefix.
        let mut seen_unit = false;
        for column in body.split('\t').skip(1).map(str::trim) {
            if let Some(value) = column.strip_prefix("TG:") {
                if line.talkgroup.is_some() {
                    return None;
                }
                line.talkgroup = Some(first_token(value)?.parse().ok()?);
            } else if let Some(value) = column.strip_prefix("Freq:") {
                if line.frequency.is_some() {
                    return None;
                }
                line.frequency = Some(parse_frequency(first_token(value)?)?);
            } else if let Some(value) = column.strip_prefix("Unit:") {
                if std::mem::replace(&mut seen_unit, true) {
                    return None;
                }
                line.source = first_token(value).and_then(|unit| unit.parse().ok());
            } else if !column.is_empty() {
                line.messages.push(column);
            }
        }
        Some(line)
    }

    fn message_starting(&self, prefix: &str) -> Option<&'a str> {
        self.messages
            .iter()
            .copied()
            .find(|message| message.starts_with(prefix))
    }
}

fn first_token(value: &str) -> Option<&str> {
    value.split_whitespace().next()
}

/// Trunk-recorder `Starting ... Recorder` lines, and the older
/// `Recording ... <talkgroup>` form that carries the talkgroup last.
#[derive(Debug, Default)]
pub struct NativeCallStartMatcher;

impl EntryMatcher for NativeCallStartMatcher {
    fn kind(&self) -> EntryKind {
        EntryKind::CallStart
    }

    fn name(&self) -> &'static str {
        "native_call_start"
    }

    fn try_match(&self, line: &LineContext<'_>) -> Option<ParsedEntry> {
        let native = NativeCallLine::parse(line.body)?;
        let talkgroup = if native.message_starting("Starting").is_some() {
            native.talkgroup?
        } else {
            let recording = native.message_starting("Recording")?;
            match native.talkgroup {
                Some(talkgroup) => talkgroup,
                None => recording.split_whitespace().last()?.parse().ok()?,
            }
        };
        let call = CallStart {
            talkgroup,
            frequency: native.frequency?,
            source: native.source,
        };
        Some(ParsedEntry::CallStart(line.entry(call)))
    }
}

/// Trunk-recorder `Concluding Recorded Call` lines with `Call Elapsed: <secs>`.
#[derive(Debug, Default)]
pub struct NativeCallEndMatcher;

impl EntryMatcher for NativeCallEndMatcher {
    fn kind(&self) -> EntryKind {
        EntryKind::CallEnd
    }

    fn name(&self) -> &'static str {
        "native_call_end"
    }

    fn try_match(&self, line: &LineContext<'_>) -> Option<ParsedEntry> {
        let native = NativeCallLine::parse(line.body)?;
        native.message_starting("Concluding Recorded Call")?;
        let elapsed = native
            .messages
            .iter()
            .find_map(|message| CALL_ELAPSED.captures(message))?;
        let call = CallEnd {
            talkgroup: native.talkgroup?,
            frequency: native.frequency?,
            source: native.source,
            duration_secs: parse_duration(elapsed.get(1)?.as_str())?,
        };
        Some(ParsedEntry::CallEnd(line.entry(call)))
    }
}

/// Turns [`RawLine`]s into [`ParsedEntry`]s. Stateless across lines.
pub struct EntryParser {
    timestamps: TimestampParser,
    matchers: Vec<Box<dyn EntryMatcher>>,
}

impl fmt::Debug for EntryParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryParser")
            .field("timezone", &self.timestamps.timezone())
            .field(
                "matchers",
                &self.matchers.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl EntryParser {
    /// Parser with every built-in grammar.
    pub fn new(timezone: Tz) -> Self {
        Self::without_matchers(timezone)
            .with_matcher(TaggedCallStartMatcher)
            .with_matcher(NativeCallStartMatcher)
            .with_matcher(TaggedCallEndMatcher)
            .with_matcher(NativeCallEndMatcher)
            .with_matcher(TaggedStatusMatcher)
    }

    pub fn without_matchers(timezone: Tz) -> Self {
        Self {
            timestamps: TimestampParser::new(timezone),
            matchers: Vec::new(),
        }
    }

    /// Adds a grammar variant. Matchers stay ordered by kind priority and,
    /// within a kind, by insertion order.
    pub fn with_matcher(mut self, matcher: impl EntryMatcher + 'static) -> Self {
        self.matchers.push(Box::new(matcher));
        self.matchers.sort_by_key(|m| m.kind());
        self
    }

    pub fn timezone(&self) -> Tz {
        self.timestamps.timezone()
    }

    /// Reads later timestamps in `timezone`. Registered matchers are kept.
    pub fn set_timezone(&mut self, timezone: Tz) {
        self.timestamps = TimestampParser::new(timezone);
    }

    pub fn parse(&self, raw: &RawLine) -> ParsedEntry {
        let text = raw.text();
        self.parse_text(&text, raw.received_at)
    }

    pub fn parse_text(&self, text: &str, received_at: DateTime<Utc>) -> ParsedEntry {
        let unrecognized = || ParsedEntry::Unrecognized {
            received_at,
            line: text.to_string(),
        };

        let Some((logged_at, rest)) = self.timestamps.split_prefix(text) else {
            return unrecognized();
        };
        // Two joined lines: a fragment whose rest was lost plus the next line.
        if contains_timestamp(rest) {
            return unrecognized();
        }
        let (severity, body) = match SEVERITY.captures(rest) {
            Some(captures) => {
                let severity = captures.get(1).and_then(|m| Severity::from_tag(m.as_str()));
                let end = captures.get(0).map_or(0, |m| m.end());
                (severity, &rest[end..])
            }
            None => (None, rest),
        };

        let context = LineContext {
            logged_at,
            received_at,
            severity,
            body: body.trim_end(),
        };
        self.matchers
            .iter()
            .find_map(|matcher| matcher.try_match(&context))
            .unwrap_or_else(unrecognized)
    }
}
