// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::{
    DEFAULT_BACKOFF_CEILING, DEFAULT_DOWNSTREAM_ADDRESS, DEFAULT_DRAIN_TIMEOUT,
    DEFAULT_LISTEN_HOST, DEFAULT_LISTEN_PORT, DEFAULT_METRICS_INTERVAL,
    DEFAULT_NORMALIZATION_WINDOW, DEFAULT_QUEUE_CAPACITY,
};
use crate::errors::PipelineError;
use chrono_tz::Tz;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Transport used to reach the downstream consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamProtocol {
    /// Newline-delimited records over a (re)connecting TCP stream.
    Tcp,
    /// One record per datagram, fire-and-forget.
    Udp,
}

impl FromStr for DownstreamProtocol {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(PipelineError::InvalidConfig(format!(
                "Unknown downstream protocol '{other}'. Must be one of: tcp, udp"
            ))),
        }
    }
}

impl fmt::Display for DownstreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Configuration for one pipeline instance.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Host to bind the inbound UDP socket to (e.g., "0.0.0.0")
    pub listen_host: String,
    /// Inbound UDP port the recorder forwards its log to
    pub listen_port: u16,
    /// Downstream consumer as host:port
    pub downstream_address: String,
    pub downstream_protocol: DownstreamProtocol,
    /// How long entries are held back to repair out-of-order arrival
    pub normalization_window: Duration,
    /// Longest delay between delivery retries
    pub forward_backoff_ceiling: Duration,
    /// Events buffered for the consumer before the oldest are dropped
    pub queue_capacity: usize,
    /// Zone the recorder writes its timestamps in
    pub timezone: Tz,
    /// Time the forwarder gets to flush its queue on shutdown
    pub drain_timeout: Duration,
    /// Interval of the liveness/metrics log line
    pub metrics_interval: Duration,
    /// Station identifier stamped on every forwarded record
    pub station_id: Option<String>,
    /// Log every recognized talkgroup at info level
    pub print_all: bool,
    /// Keep the last forwarded sequence number here across restarts
    pub sequence_checkpoint: Option<PathBuf>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            downstream_address: DEFAULT_DOWNSTREAM_ADDRESS.to_string(),
            downstream_protocol: DownstreamProtocol::Tcp,
            normalization_window: DEFAULT_NORMALIZATION_WINDOW,
            forward_backoff_ceiling: DEFAULT_BACKOFF_CEILING,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            timezone: Tz::UTC,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            station_id: None,
            print_all: false,
            sequence_checkpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, so tests need not touch
    /// the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let listen_host = lookup("P25LOG_LISTEN_HOST").unwrap_or(defaults.listen_host);
        let listen_port = parse_or("P25LOG_LISTEN_PORT", &lookup, defaults.listen_port);
        let downstream_address =
            lookup("P25LOG_DOWNSTREAM_ADDRESS").unwrap_or(defaults.downstream_address);
        let downstream_protocol = match lookup("P25LOG_DOWNSTREAM_PROTOCOL") {
            Some(val) => val.parse()?,
            None => defaults.downstream_protocol,
        };
        let normalization_window = duration_or(
            "P25LOG_NORMALIZATION_WINDOW",
            &lookup,
            defaults.normalization_window,
        );
        let forward_backoff_ceiling = duration_or(
            "P25LOG_FORWARD_BACKOFF_CEILING",
            &lookup,
            defaults.forward_backoff_ceiling,
        );
        let queue_capacity = parse_or("P25LOG_QUEUE_CAPACITY", &lookup, defaults.queue_capacity);
        let timezone = match lookup("P25LOG_TIMEZONE") {
            Some(name) => parse_timezone(&name)?,
            None => defaults.timezone,
        };
        let drain_timeout = duration_or("P25LOG_DRAIN_TIMEOUT", &lookup, defaults.drain_timeout);
        let metrics_interval =
            duration_or("P25LOG_METRICS_INTERVAL", &lookup, defaults.metrics_interval);
        let station_id = lookup("P25LOG_STATION_ID")
            .map(|val| val.trim().to_string())
            .filter(|val| !val.is_empty());
        let print_all = lookup("P25LOG_PRINT_ALL")
            .map(|val| matches!(val.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(defaults.print_all);
        let sequence_checkpoint = lookup("P25LOG_SEQUENCE_CHECKPOINT")
            .filter(|val| !val.trim().is_empty())
            .map(PathBuf::from);
        let log_level = lookup("P25LOG_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);

        let config = Self {
            listen_host,
            listen_port,
            downstream_address,
            downstream_protocol,
            normalization_window,
            forward_backoff_ceiling,
            queue_capacity,
            timezone,
            drain_timeout,
            metrics_interval,
            station_id,
            print_all,
            sequence_checkpoint,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.listen_port == 0 {
            return Err(PipelineError::InvalidConfig(
                "listen port must be greater than 0".to_string(),
            ));
        }

        if self.listen_host.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "listen host cannot be empty".to_string(),
            ));
        }

        validate_host_port(&self.downstream_address)?;

        if self.queue_capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.normalization_window.is_zero() {
            return Err(PipelineError::InvalidConfig(
                "normalization window must be greater than 0".to_string(),
            ));
        }

        if self.forward_backoff_ceiling.is_zero() {
            return Err(PipelineError::InvalidConfig(
                "forward backoff ceiling must be greater than 0".to_string(),
            ));
        }

        if self.metrics_interval.is_zero() {
            return Err(PipelineError::InvalidConfig(
                "metrics interval must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(PipelineError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Address string the inbound socket binds to.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

/// Parses an IANA zone name such as `America/Chicago`.
pub fn parse_timezone(name: &str) -> Result<Tz, PipelineError> {
    name.trim().parse::<Tz>().map_err(|e| {
        PipelineError::InvalidConfig(format!("Unknown timezone '{}': {}", name.trim(), e))
    })
}

fn validate_host_port(address: &str) -> Result<(), PipelineError> {
    let invalid = || {
        PipelineError::InvalidConfig(format!(
            "downstream address '{address}' must be in host:port form"
        ))
    };
    let (host, port) = address.trim().rsplit_once(':').ok_or_else(invalid)?;
    if host.trim_matches(|c| c == '[' || c == ']').is_empty() {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok(()),
        _ => Err(invalid()),
    }
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> T
where
    T: FromStr + fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{key} has unparseable value '{raw}', using default {default}");
            default
        }),
        None => default,
    }
}

fn duration_or<F>(key: &str, lookup: &F, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => humantime::parse_duration(raw.trim()).unwrap_or_else(|e| {
            warn!(
                "{key} has unparseable duration '{raw}' ({e}), using default {}",
                humantime::format_duration(default)
            );
            default
        }),
        None => default,
    }
}
