// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the pipeline.
//!
//! Only inbound [`PipelineError::Transport`] faults stop a pipeline. Parse
//! mismatches, overflows and an unreachable consumer are recovered where they
//! happen and show up as counters in [`crate::metrics`].

use std::io;

/// Errors raised by pipeline components.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Transport fault while {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Line does not match any known grammar: {0}")]
    ParseMismatch(String),

    #[error("Forward queue is full ({0} events)")]
    QueueOverflow(usize),

    #[error("Downstream {address} unreachable: {reason}")]
    DownstreamUnreachable { address: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Pipeline already stopped")]
    AlreadyStopped,

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

impl PipelineError {
    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }
}

/// A single failed delivery attempt to the downstream consumer.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to send to {address}: {source}")]
    Send {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out talking to {0}")]
    Timeout(String),

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ForwardError {
    /// Maps a delivery failure onto the pipeline taxonomy.
    pub fn into_pipeline_error(self, address: &str) -> PipelineError {
        PipelineError::DownstreamUnreachable {
            address: address.to_string(),
            reason: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = PipelineError::InvalidConfig("queue capacity must be greater than 0".into());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: queue capacity must be greater than 0"
        );

        let error = PipelineError::transport(
            "binding 0.0.0.0:50000",
            io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        );
        assert_eq!(
            error.to_string(),
            "Transport fault while binding 0.0.0.0:50000: address in use"
        );
    }

    #[test]
    fn test_forward_error_maps_to_unreachable() {
        let error = ForwardError::Timeout("127.0.0.1:9999".into());
        match error.into_pipeline_error("127.0.0.1:9999") {
            PipelineError::DownstreamUnreachable { address, reason } => {
                assert_eq!(address, "127.0.0.1:9999");
                assert!(reason.contains("Timed out"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
