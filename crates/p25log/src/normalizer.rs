// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event normalizer: dedup, bounded reordering, sequencing and call pairing.
//!
//! Entries are held in a reorder buffer keyed by event time. With `W` the
//! normalization window, the high-water mark is the newest event time seen
//! and the low-water mark is `high_water - W`. Buffered entries are released
//! in event-time order once they fall to or below the low-water mark, or once
//! they have been held for `W` of wall-clock time. An entry that is already
//! below the low-water mark when it arrives is released at once, so ordering
//! is best-effort and nothing is dropped for being late.
//!
//! Sequence numbers are assigned at release and are gap-free. The normalizer
//! is owned by a single task; it is the only writer of the sequence counter.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::constants::{CALL_PAIRING_TOLERANCE, OPEN_CALL_CAPACITY};
use crate::entry::{Entry, ParsedEntry};
use crate::event::{EventKind, EventPayload, NormalizedEvent};
use crate::metrics::PipelineMetrics;

/// Identity used for duplicate suppression. Ordered by event time first so
/// the oldest keys can be evicted cheaply.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DedupKey {
    event_time: DateTime<Utc>,
    kind: EventKind,
    fields: KeyFields,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyFields {
    Call {
        talkgroup: u32,
        frequency_bits: u64,
        source: Option<u32>,
        duration_bits: Option<u64>,
    },
    Status {
        state: String,
        recorder: Option<u32>,
    },
}

impl DedupKey {
    fn new(event_time: DateTime<Utc>, payload: &EventPayload) -> Self {
        let fields = match payload {
            EventPayload::CallStart {
                talkgroup,
                frequency,
                source,
            } => KeyFields::Call {
                talkgroup: *talkgroup,
                frequency_bits: frequency.to_bits(),
                source: *source,
                duration_bits: None,
            },
            EventPayload::CallEnd {
                talkgroup,
                frequency,
                source,
                duration_secs,
                ..
            } => KeyFields::Call {
                talkgroup: *talkgroup,
                frequency_bits: frequency.to_bits(),
                source: *source,
                duration_bits: Some(duration_secs.to_bits()),
            },
            EventPayload::RecorderStatus {
                state, recorder, ..
            } => KeyFields::Status {
                state: state.clone(),
                recorder: *recorder,
            },
        };
        Self {
            event_time,
            kind: payload.kind(),
            fields,
        }
    }
}

#[derive(Debug)]
struct PendingEntry {
    event_time: DateTime<Utc>,
    payload: EventPayload,
    held_since: Instant,
}

#[derive(Debug, Clone, Copy)]
struct OpenCall {
    talkgroup: u32,
    started_at: DateTime<Utc>,
    sequence: u64,
}

/// Converts parsed entries into sequenced [`NormalizedEvent`]s.
#[derive(Debug)]
pub struct Normalizer {
    window: chrono::Duration,
    hold_limit: Duration,
    next_sequence: u64,
    high_water: Option<DateTime<Utc>>,
    // (event_time, arrival order) keeps ties in arrival order.
    pending: BTreeMap<(DateTime<Utc>, u64), PendingEntry>,
    arrivals: u64,
    seen: BTreeSet<DedupKey>,
    open_calls: VecDeque<OpenCall>,
}

impl Normalizer {
    /// `first_sequence` is the number given to the first released event.
    pub fn new(window: Duration, first_sequence: u64) -> Self {
        Self {
            window: to_chrono(window),
            hold_limit: window,
            next_sequence: first_sequence.max(1),
            high_water: None,
            pending: BTreeMap::new(),
            arrivals: 0,
            seen: BTreeSet::new(),
            open_calls: VecDeque::new(),
        }
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = to_chrono(window);
        self.hold_limit = window;
    }

    pub fn window(&self) -> Duration {
        self.hold_limit
    }

    /// Sequence of the most recently released event, 0 before the first.
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Event-time threshold below which entries are no longer reordered.
    pub fn low_water_mark(&self) -> Option<DateTime<Utc>> {
        self.high_water.map(|high| subtract(high, self.window))
    }

    /// Accepts one parsed entry and returns the events that became ready.
    ///
    /// Unrecognized entries and duplicates produce nothing.
    pub fn push(
        &mut self,
        entry: ParsedEntry,
        now: Instant,
        metrics: &PipelineMetrics,
    ) -> Vec<NormalizedEvent> {
        let Some((event_time, payload)) = payload_from_entry(entry) else {
            return Vec::new();
        };

        let key = DedupKey::new(event_time, &payload);
        if self.seen.contains(&key) {
            debug!(
                "Suppressing duplicate {} at {}",
                payload.kind(),
                event_time.to_rfc3339()
            );
            metrics.record_duplicate();
            return Vec::new();
        }
        self.seen.insert(key);

        let high_water = match self.high_water {
            Some(high) if high >= event_time => high,
            _ => event_time,
        };
        self.high_water = Some(high_water);
        let low_water = subtract(high_water, self.window);

        let mut released = Vec::new();
        if event_time < low_water {
            trace!(
                "Late {} at {} is below the low-water mark {}",
                payload.kind(),
                event_time.to_rfc3339(),
                low_water.to_rfc3339()
            );
            released.push(self.release(event_time, payload));
        } else {
            self.arrivals += 1;
            self.pending.insert(
                (event_time, self.arrivals),
                PendingEntry {
                    event_time,
                    payload,
                    held_since: now,
                },
            );
        }

        released.extend(self.release_ready(Some(low_water), now));
        self.evict_seen(low_water);
        metrics.record_normalized(released.len() as u64);
        released
    }

    /// Releases entries that have been held for the full window.
    pub fn tick(&mut self, now: Instant, metrics: &PipelineMetrics) -> Vec<NormalizedEvent> {
        let released = self.release_ready(self.low_water_mark(), now);
        metrics.record_normalized(released.len() as u64);
        released
    }

    /// Releases everything still buffered, in event-time order.
    pub fn drain(&mut self, metrics: &PipelineMetrics) -> Vec<NormalizedEvent> {
        let pending = std::mem::take(&mut self.pending);
        let released: Vec<NormalizedEvent> = pending
            .into_values()
            .map(|entry| self.release(entry.event_time, entry.payload))
            .collect();
        metrics.record_normalized(released.len() as u64);
        released
    }

    fn release_ready(
        &mut self,
        low_water: Option<DateTime<Utc>>,
        now: Instant,
    ) -> Vec<NormalizedEvent> {
        // Anything held past the window forces out everything older than it.
        let held_cutoff = self
            .pending
            .values()
            .filter(|entry| now.saturating_duration_since(entry.held_since) >= self.hold_limit)
            .map(|entry| entry.event_time)
            .max();
        let cutoff = match (low_water, held_cutoff) {
            (Some(low), Some(held)) => Some(low.max(held)),
            (low, held) => low.or(held),
        };
        let Some(cutoff) = cutoff else {
            return Vec::new();
        };

        let mut released = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > cutoff {
                break;
            }
            let entry = entry.remove();
            released.push(self.release(entry.event_time, entry.payload));
        }
        released
    }

    fn release(&mut self, event_time: DateTime<Utc>, mut payload: EventPayload) -> NormalizedEvent {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        match &mut payload {
            EventPayload::CallStart { talkgroup, .. } => {
                if self.open_calls.len() >= OPEN_CALL_CAPACITY {
                    self.open_calls.pop_front();
                }
                self.open_calls.push_back(OpenCall {
                    talkgroup: *talkgroup,
                    started_at: event_time,
                    sequence,
                });
            }
            EventPayload::CallEnd {
                talkgroup,
                duration_secs,
                start_sequence,
                ..
            } => {
                let started_at = subtract(event_time, seconds(*duration_secs));
                *start_sequence = self.take_open_call(*talkgroup, started_at);
            }
            EventPayload::RecorderStatus { .. } => {}
        }

        NormalizedEvent::new(sequence, event_time, payload)
    }

    /// Pairs a call end with the closest open start of the same talkgroup.
    fn take_open_call(&mut self, talkgroup: u32, started_at: DateTime<Utc>) -> Option<u64> {
        let tolerance = to_chrono(CALL_PAIRING_TOLERANCE);
        let (index, _) = self
            .open_calls
            .iter()
            .enumerate()
            .filter(|(_, call)| call.talkgroup == talkgroup)
            .map(|(index, call)| (index, (call.started_at - started_at).abs()))
            .filter(|(_, distance)| *distance <= tolerance)
            .min_by_key(|(_, distance)| *distance)?;
        self.open_calls.remove(index).map(|call| call.sequence)
    }

    fn evict_seen(&mut self, low_water: DateTime<Utc>) {
        let horizon = subtract(low_water, self.window);
        while let Some(oldest) = self.seen.first() {
            if oldest.event_time >= horizon {
                break;
            }
            self.seen.pop_first();
        }
    }
}

/// Maps a recognized entry onto the event schema.
fn payload_from_entry(entry: ParsedEntry) -> Option<(DateTime<Utc>, EventPayload)> {
    match entry {
        ParsedEntry::CallStart(Entry {
            logged_at, fields, ..
        }) => Some((
            logged_at,
            EventPayload::CallStart {
                talkgroup: fields.talkgroup,
                frequency: fields.frequency,
                source: fields.source,
            },
        )),
        ParsedEntry::CallEnd(Entry {
            logged_at, fields, ..
        }) => Some((
            logged_at,
            EventPayload::CallEnd {
                talkgroup: fields.talkgroup,
                frequency: fields.frequency,
                source: fields.source,
                duration_secs: fields.duration_secs,
                start_sequence: None,
            },
        )),
        ParsedEntry::RecorderStatus(Entry {
            logged_at, fields, ..
        }) => Some((
            logged_at,
            EventPayload::RecorderStatus {
                state: fields.state,
                recorder: fields.recorder,
                frequency: fields.frequency,
            },
        )),
        ParsedEntry::Unrecognized { .. } => None,
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn seconds(secs: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((secs * 1000.0).round() as i64)
}

fn subtract(time: DateTime<Utc>, delta: chrono::Duration) -> DateTime<Utc> {
    time.checked_sub_signed(delta)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entry::{CallEnd, CallStart, RecorderStatus};

    const WINDOW: Duration = Duration::from_secs(3);

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + chrono::Duration::seconds(secs)
    }

    fn start(secs: i64, talkgroup: u32) -> ParsedEntry {
        ParsedEntry::CallStart(Entry {
            logged_at: at(secs),
            received_at: at(secs),
            severity: None,
            fields: CallStart {
                talkgroup,
                frequency: 851.0125,
                source: None,
            },
        })
    }

    fn end(secs: i64, talkgroup: u32, duration_secs: f64) -> ParsedEntry {
        ParsedEntry::CallEnd(Entry {
            logged_at: at(secs),
            received_at: at(secs),
            severity: None,
            fields: CallEnd {
                talkgroup,
                frequency: 851.0125,
                source: None,
                duration_secs,
            },
        })
    }

    fn status(secs: i64, state: &str) -> ParsedEntry {
        ParsedEntry::RecorderStatus(Entry {
            logged_at: at(secs),
            received_at: at(secs),
            severity: None,
            fields: RecorderStatus {
                state: state.to_string(),
                recorder: Some(0),
                frequency: None,
            },
        })
    }

    fn sequences(events: &[NormalizedEvent]) -> Vec<u64> {
        events.iter().map(|e| e.sequence).collect()
    }

    fn talkgroups(events: &[NormalizedEvent]) -> Vec<u32> {
        events.iter().filter_map(|e| e.payload.talkgroup()).collect()
    }

    #[test]
    fn test_call_start_payload_matches_entry() {
        let metrics = PipelineMetrics::new();
        let mut normalizer = Normalizer::new(WINDOW, 1);
        let now = Instant::now();

        assert!(normalizer.push(start(0, 101), now, &metrics).is_empty());
        let events = normalizer.drain(&metrics);

        assert_eq!(
            events,
            vec![NormalizedEvent::new(
                1,
                at(0),
                EventPayload::CallStart {
                    talkgroup: 101,
                    frequency: 851.0125,
                    source: None,
                }
            )]
        );
        assert_eq!(metrics.snapshot().events_normalized, 1);
    }

    #[test]
    fn test_out_of_order_entries_within_window_are_reordered() {
        let metrics = PipelineMetrics::new();
        let mut normalizer = Normalizer::new(WINDOW, 1);
        let now = Instant::now();

        assert!(normalizer.push(start(2, 2), now, &metrics).is_empty());
        assert!(normalizer.push(start(1, 1), now, &metrics).is_empty());
        assert!(normalizer.push(start(3, 3), now, &metrics).is_empty());

        // Advancing the high-water mark to 5s pushes everything at or below 2s out.
        let events = normalizer.push(start(5, 5), now, &metrics);
        assert_eq!(talkgroups(&events), vec![1, 2]);
        assert_eq!(sequences(&events), vec![1, 2]);

        let events = normalizer.drain(&metrics);
        assert_eq!(talkgroups(&events), vec![3, 5]);
        assert_eq!(sequences(&events), vec![3, 4]);
    }

    #[test]
    fn test_late_entry_is_released_immediately() {
        let metrics = PipelineMetrics::new();
        let mut normalizer = Normalizer::new(WINDOW, 1);
        let now = Instant::now();

        normalizer.push(start(10, 10), now, &metrics);
        assert_eq!(normalizer.low_water_mark(), Some(at(7)));

        let events = normalizer.push(start(1, 1), now, &metrics);
        assert_eq!(talkgroups(&events), vec![1]);
        assert_eq!(sequences(&events), vec![1]);

        let events = normalizer.drain(&metrics);
        assert_eq!(sequences(&events), vec![2]);
    }

    #[test]
    fn test_held_entries_are_released_after_the_window() {
        let metrics = PipelineMetrics::new();
        let mut normalizer = Normalizer::new(WINDOW, 1);
        let now = Instant::now();

        normalizer.push(start(0, 1), now, &metrics);
        normalizer.push(start(1, 2), now + Duration::from_secs(2), &metrics);

        assert!(normalizer.tick(now + Duration::from_secs(1), &metrics).is_empty());

        // Only the first entry has been held for the full window.
        let events = normalizer.tick(now + Duration::from_secs(3), &metrics);
        assert_eq!(talkgroups(&events), vec![1]);
        assert_eq!(normalizer.pending_len(), 1);

        let events = normalizer.tick(now + Duration::from_secs(5), &metrics);
        assert_eq!(talkgroups(&events), vec![2]);
        assert_eq!(sequences(&events), vec![2]);
    }

    #[test]
    fn test_duplicates_are_suppressed() {
        let metrics = PipelineMetrics::new();
        let mut normalizer = Normalizer::new(WINDOW, 1);
        let now = Instant::now();

        normalizer.push(start(0, 101), now, &metrics);
        normalizer.push(start(0, 101), now, &metrics);
        normalizer.push(status(0, "idle"), now, &metrics);
        normalizer.push(status(0, "idle"), now, &metrics);
        // Same time, different talkgroup: not a duplicate.
        normalizer.push(start(0, 102), now, &metrics);

        let events = normalizer.drain(&metrics);
        assert_eq!(events.len(), 3);
        assert_eq!(metrics.snapshot().duplicates_suppressed, 2);
    }

    #[test]
    fn test_unrecognized_entries_produce_nothing() {
        let metrics = PipelineMetrics::new();
        let mut normalizer = Normalizer::new(WINDOW, 1);
        let events = normalizer.push(
            ParsedEntry::Unrecognized {
                received_at: at(0),
                line: "garbage".to_string(),
            },
            Instant::now(),
            &metrics,
        );
        assert!(events.is_empty());
        assert!(normalizer.drain(&metrics).is_empty());
        assert_eq!(normalizer.last_sequence(), 0);
    }

    #[test]
    fn test_call_end_pairs_with_its_start() {
        let metrics = PipelineMetrics::new();
        let mut normalizer = Normalizer::new(WINDOW, 1);
        let now = Instant::now();

        let mut events = Vec::new();
        for entry in [
            start(0, 101),
            start(0, 202),
            end(12, 101, 12.0),
            end(20, 303, 4.0),
        ] {
            events.extend(normalizer.push(entry, now, &metrics));
        }
        events.extend(normalizer.drain(&metrics));
        assert_eq!(sequences(&events), vec![1, 2, 3, 4]);

        let paired = events
            .iter()
            .find(|e| e.kind == EventKind::CallEnd && e.payload.talkgroup() == Some(101))
            .unwrap();
        match &paired.payload {
            EventPayload::CallEnd { start_sequence, .. } => assert_eq!(*start_sequence, Some(1)),
            other => panic!("unexpected payload {other:?}"),
        }

        let standalone = events
            .iter()
            .find(|e| e.payload.talkgroup() == Some(303))
            .unwrap();
        match &standalone.payload {
            EventPayload::CallEnd { start_sequence, .. } => assert_eq!(*start_sequence, None),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_call_end_outside_tolerance_is_standalone() {
        let metrics = PipelineMetrics::new();
        let mut normalizer = Normalizer::new(WINDOW, 1);
        let now = Instant::now();

        let mut events = normalizer.push(start(0, 101), now, &metrics);
        events.extend(normalizer.push(end(30, 101, 12.0), now, &metrics));
        events.extend(normalizer.drain(&metrics));
        assert_eq!(events.len(), 2);
        match &events[1].payload {
            EventPayload::CallEnd { start_sequence, .. } => assert_eq!(*start_sequence, None),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_sequences_are_gap_free_and_continue_from_first_sequence() {
        let metrics = PipelineMetrics::new();
        let mut normalizer = Normalizer::new(WINDOW, 41);
        let now = Instant::now();

        let mut all = Vec::new();
        for (i, secs) in [5, 1, 9, 2, 30, 3, 31, 0].iter().enumerate() {
            all.extend(normalizer.push(start(*secs, i as u32), now, &metrics));
        }
        all.extend(normalizer.drain(&metrics));

        assert_eq!(sequences(&all), (41..49).collect::<Vec<u64>>());
        assert_eq!(normalizer.last_sequence(), 48);
    }

    #[test]
    fn test_set_window_changes_low_water_mark() {
        let metrics = PipelineMetrics::new();
        let mut normalizer = Normalizer::new(WINDOW, 1);
        normalizer.push(start(10, 1), Instant::now(), &metrics);
        normalizer.set_window(Duration::from_secs(1));
        assert_eq!(normalizer.window(), Duration::from_secs(1));
        assert_eq!(normalizer.low_water_mark(), Some(at(9)));
    }
}
