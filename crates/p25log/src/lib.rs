// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log-forwarding bridge for trunk-recorder output.
//!
//! Receives the recorder's free-text log lines over UDP, recognizes call and
//! status entries, turns them into sequenced events and forwards them to a
//! downstream consumer on a best-effort basis.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod checkpoint;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod downstream;
pub mod entry;
pub mod errors;
pub mod event;
pub mod forwarder;
pub mod listener;
pub mod metrics;
pub mod normalizer;
pub mod reader;
pub mod timestamp;
