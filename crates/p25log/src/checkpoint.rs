// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Last-sequence checkpoint, so numbering continues across restarts.
//!
//! The file holds a single decimal number followed by a newline.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceCheckpoint {
    path: PathBuf,
}

impl SequenceCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored sequence, or 0 when no checkpoint exists yet.
    pub async fn load(&self) -> Result<u64, PipelineError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No sequence checkpoint at {}", self.path.display());
                return Ok(0);
            }
            Err(e) => {
                return Err(PipelineError::Checkpoint(format!(
                    "reading {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let sequence = contents.trim().parse::<u64>().map_err(|e| {
            PipelineError::Checkpoint(format!(
                "{} does not hold a sequence number: {}",
                self.path.display(),
                e
            ))
        })?;
        // Numbering resumes at the next value, which must exist.
        if sequence == u64::MAX {
            return Err(PipelineError::Checkpoint(format!(
                "{} holds {}, no sequence numbers are left",
                self.path.display(),
                sequence
            )));
        }
        Ok(sequence)
    }

    /// Writes to a sibling temp file first so a crash never leaves a
    /// truncated checkpoint behind.
    pub async fn store(&self, sequence: u64) -> Result<(), PipelineError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, format!("{sequence}\n"))
            .await
            .map_err(|e| PipelineError::Checkpoint(format!("writing {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            PipelineError::Checkpoint(format!("replacing {}: {}", self.path.display(), e))
        })?;
        debug!(
            "Stored sequence checkpoint {} at {}",
            sequence,
            self.path.display()
        );
        Ok(())
    }
}
