// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Receive buffer size: the largest UDP payload. A datagram that fills it
/// may have been truncated by the kernel.
pub const BUFFER_SIZE: usize = 65_536;

/// A partial line longer than this is discarded instead of buffered further.
pub const MAX_LINE_LENGTH: usize = 32 * 1024;

/// Identifiers the station protocol expects on every record.
pub const MODULE_P25LOG: u8 = 4;
pub const PROTOCOL_VERSION: u8 = 1;

pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
pub const DEFAULT_LISTEN_PORT: u16 = 50000;
pub const DEFAULT_DOWNSTREAM_ADDRESS: &str = "127.0.0.1:9999";
pub const DEFAULT_NORMALIZATION_WINDOW: Duration = Duration::from_secs(3);
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(30);
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// First retry delay; doubles per consecutive failure up to the ceiling.
pub const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Upper bound on a single connect or send to the downstream consumer.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// CallStart entries remembered for CallEnd pairing.
pub const OPEN_CALL_CAPACITY: usize = 4096;

/// Maximum distance between a CallEnd's derived start and a CallStart.
pub const CALL_PAIRING_TOLERANCE: Duration = Duration::from_secs(1);
