// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion of the recorder's wall-clock timestamps to absolute time.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Leading `YYYY-MM-DD HH:MM:SS[.fraction]`, optionally bracketed.
    #[allow(clippy::expect_used)]
    static ref TIMESTAMP_PREFIX: Regex = Regex::new(
        r"^\s*\[?(\d{4}-\d{2}-\d{2})[ T](\d{2}:\d{2}:\d{2}(?:\.\d{1,9})?)\]?"
    )
    .expect("failed creating regex");

    #[allow(clippy::expect_used)]
    static ref EMBEDDED_TIMESTAMP: Regex =
        Regex::new(r"\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}").expect("failed creating regex");
}

/// Whether `text` holds a recorder timestamp anywhere, not just at the start.
pub fn contains_timestamp(text: &str) -> bool {
    EMBEDDED_TIMESTAMP.is_match(text)
}

/// Reads recorder timestamps as local time in a configured zone.
#[derive(Debug, Clone, Copy)]
pub struct TimestampParser {
    timezone: Tz,
}

impl TimestampParser {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Splits the leading timestamp off `line`.
    ///
    /// Returns the instant and the remainder with leading whitespace removed,
    /// or `None` when the line does not start with a usable timestamp.
    pub fn split_prefix<'a>(&self, line: &'a str) -> Option<(DateTime<Utc>, &'a str)> {
        let captures = TIMESTAMP_PREFIX.captures(line)?;
        let whole = captures.get(0)?;
        let date = captures.get(1)?.as_str();
        let time = captures.get(2)?.as_str();

        let naive =
            NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S%.f")
                .ok()?;
        let instant = self.to_utc(&naive)?;
        Some((instant, line[whole.end()..].trim_start()))
    }

    /// Resolves a local wall-clock time. Times repeated by a DST change take
    /// the earlier instant; times skipped by one do not exist.
    pub fn to_utc(&self, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
        self.timezone
            .from_local_datetime(naive)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_plain_timestamp_in_utc() {
        let parser = TimestampParser::new(Tz::UTC);
        let (instant, rest) = parser
            .split_prefix("2024-01-01 10:00:00 [CALLSTART] tg=101")
            .unwrap();
        assert_eq!(instant, utc("2024-01-01T10:00:00Z"));
        assert_eq!(rest, "[CALLSTART] tg=101");
    }

    #[test]
    fn test_bracketed_timestamp_with_fraction() {
        let parser = TimestampParser::new(Tz::UTC);
        let (instant, rest) = parser
            .split_prefix("[2024-03-05 22:15:09.250000] (info)   [sys]")
            .unwrap();
        assert_eq!(instant, utc("2024-03-05T22:15:09.25Z"));
        assert_eq!(rest, "(info)   [sys]");
    }

    #[test]
    fn test_configured_timezone_is_applied() {
        let parser = TimestampParser::new(chrono_tz::America::New_York);
        let (instant, _) = parser.split_prefix("2024-07-01 08:00:00 x").unwrap();
        assert_eq!(instant, utc("2024-07-01T12:00:00Z"));
    }

    #[test]
    fn test_ambiguous_time_takes_earliest() {
        let parser = TimestampParser::new(chrono_tz::America::New_York);
        // 01:30 happens twice on 2024-11-03.
        let (instant, _) = parser.split_prefix("2024-11-03 01:30:00 x").unwrap();
        assert_eq!(instant, utc("2024-11-03T05:30:00Z"));
    }

    #[test]
    fn test_skipped_time_is_rejected() {
        let parser = TimestampParser::new(chrono_tz::America::New_York);
        // 02:30 does not exist on 2024-03-10.
        assert!(parser.split_prefix("2024-03-10 02:30:00 x").is_none());
    }

    #[test]
    fn test_missing_or_invalid_timestamp() {
        let parser = TimestampParser::new(Tz::UTC);
        assert!(parser.split_prefix("garbage text not matching grammar").is_none());
        assert!(parser.split_prefix("2024-13-01 10:00:00 x").is_none());
        assert!(parser.split_prefix("2024-01-01 25:00:00 x").is_none());
    }

    #[test]
    fn test_embedded_timestamp_is_found_anywhere() {
        assert!(contains_timestamp("[CALLSTART] tg=7 fr2024-03-01 12:00:01 [CALLEND]"));
        assert!(contains_timestamp("x 2024-03-01T12:00:01"));
        assert!(!contains_timestamp("[CALLSTART] tg=7 freq=851.0 src=20240301"));
    }
}
