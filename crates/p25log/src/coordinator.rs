// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline lifecycle: start, status, reconfigure and stop.
//!
//! [`Pipeline::start`] binds the inbound socket and spawns two tasks, the
//! listener (reader, parser, normalizer) and the forwarder. Every counter
//! lives on the pipeline instance, so several pipelines can share a process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::SequenceCheckpoint;
use crate::config::PipelineConfig;
use crate::downstream::connect_lazily;
use crate::entry::EntryParser;
use crate::errors::PipelineError;
use crate::forwarder::{ForwarderConfig, ForwarderHandle, ForwarderService};
use crate::listener::{Listener, ListenerHandle};
use crate::metrics::{MetricsSnapshot, PipelineMetrics, PipelineState};
use crate::normalizer::Normalizer;
use crate::reader::{BufferReader, LineReader};

/// Extra time the forwarder gets beyond its own drain timeout before it is
/// aborted.
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Point-in-time view returned by [`PipelineHandle::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub status: ServiceStatus,
    pub listen_addr: Option<SocketAddr>,
    pub last_assigned_sequence: u64,
    pub last_forwarded_sequence: u64,
    pub backoff_attempts: u32,
    pub metrics: MetricsSnapshot,
    /// Set when the listener stopped on a transport fault.
    pub fault: Option<String>,
}

struct Tasks {
    listener: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

struct Inner {
    status: RwLock<ServiceStatus>,
    status_tx: broadcast::Sender<ServiceStatus>,
    fault: RwLock<Option<String>>,
    config: Mutex<PipelineConfig>,
    tasks: Mutex<Option<Tasks>>,
    listener: ListenerHandle,
    forwarder: ForwarderHandle,
    listener_token: CancellationToken,
    forwarder_token: CancellationToken,
    checkpoint: Option<SequenceCheckpoint>,
    metrics: Arc<PipelineMetrics>,
    state: Arc<PipelineState>,
}

impl Inner {
    async fn set_status(&self, status: ServiceStatus) {
        *self.status.write().await = status;
        let _ = self.status_tx.send(status);
    }
}

/// Handle to a running pipeline. Cheap to clone.
#[derive(Clone)]
pub struct PipelineHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("listen_addr", &self.inner.state.listen_addr())
            .finish_non_exhaustive()
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Binds the inbound socket and spawns the pipeline tasks.
    ///
    /// A bind failure is returned as [`PipelineError::Transport`]. When a
    /// sequence checkpoint is configured, numbering resumes after the stored
    /// value.
    pub async fn start(config: PipelineConfig) -> Result<PipelineHandle, PipelineError> {
        let parser = EntryParser::new(config.timezone);
        Self::start_with_parser(config, parser).await
    }

    /// Like [`Pipeline::start`], with a caller-built parser so extra grammar
    /// variants can be registered. The parser's timezone is replaced by the
    /// configured one.
    pub async fn start_with_parser(
        config: PipelineConfig,
        mut parser: EntryParser,
    ) -> Result<PipelineHandle, PipelineError> {
        parser.set_timezone(config.timezone);
        let (status_tx, _) = broadcast::channel(16);
        let _ = status_tx.send(ServiceStatus::Starting);

        let metrics = Arc::new(PipelineMetrics::new());
        let state = Arc::new(PipelineState::new());

        let checkpoint = config
            .sequence_checkpoint
            .as_ref()
            .map(SequenceCheckpoint::new);
        let last_sequence = match &checkpoint {
            Some(checkpoint) => {
                let last_sequence = checkpoint.load().await?;
                info!(
                    "Resuming after sequence {} from {}",
                    last_sequence,
                    checkpoint.path().display()
                );
                last_sequence
            }
            None => 0,
        };
        state.set_last_assigned_sequence(last_sequence);

        let buffer_reader = BufferReader::bind(&config.listen_address()).await?;
        let listen_addr = buffer_reader.local_addr();
        state.set_listen_addr(listen_addr);

        let forwarder_token = CancellationToken::new();
        let (forwarder, events, forwarder_handle) = ForwarderService::new(
            ForwarderConfig {
                queue_capacity: config.queue_capacity,
                backoff_ceiling: config.forward_backoff_ceiling,
                drain_timeout: config.drain_timeout,
                metrics_interval: config.metrics_interval,
                station_id: config.station_id.clone(),
            },
            connect_lazily(config.downstream_protocol, &config.downstream_address),
            Arc::clone(&metrics),
            Arc::clone(&state),
            forwarder_token.clone(),
        );

        let listener_token = CancellationToken::new();
        let (listener, listener_handle) = Listener::new(
            LineReader::new(buffer_reader),
            parser,
            Normalizer::new(
                config.normalization_window,
                last_sequence.saturating_add(1),
            ),
            events,
            Arc::clone(&metrics),
            Arc::clone(&state),
            listener_token.clone(),
        );
        let listener = listener.with_print_all(config.print_all);

        info!(
            "Pipeline listening on {} and forwarding to {} over {}",
            listen_addr.map_or_else(|| config.listen_address(), |addr| addr.to_string()),
            config.downstream_address,
            config.downstream_protocol
        );

        let inner = Arc::new(Inner {
            status: RwLock::new(ServiceStatus::Starting),
            status_tx,
            fault: RwLock::new(None),
            config: Mutex::new(config),
            tasks: Mutex::new(None),
            listener: listener_handle,
            forwarder: forwarder_handle,
            listener_token,
            forwarder_token,
            checkpoint,
            metrics,
            state,
        });

        let forwarder_task = tokio::spawn(forwarder.run());
        let listener_inner = Arc::clone(&inner);
        let listener_task = tokio::spawn(async move {
            if let Err(e) = listener.spin().await {
                error!("Pipeline faulted, stop it to release resources: {}", e);
                *listener_inner.fault.write().await = Some(e.to_string());
                listener_inner.set_status(ServiceStatus::Stopping).await;
            }
        });
        *inner.tasks.lock().await = Some(Tasks {
            listener: listener_task,
            forwarder: forwarder_task,
        });
        inner.set_status(ServiceStatus::Running).await;

        Ok(PipelineHandle { inner })
    }
}

impl PipelineHandle {
    pub async fn status(&self) -> PipelineStatus {
        let inner = &self.inner;
        PipelineStatus {
            status: *inner.status.read().await,
            listen_addr: inner.state.listen_addr(),
            last_assigned_sequence: inner.state.last_assigned_sequence(),
            last_forwarded_sequence: inner.state.last_forwarded_sequence(),
            backoff_attempts: inner.state.backoff_attempts(),
            metrics: inner.metrics.snapshot(),
            fault: inner.fault.read().await.clone(),
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.inner.status.read().await, ServiceStatus::Running)
    }

    /// Get a receiver for status updates.
    pub fn status_receiver(&self) -> broadcast::Receiver<ServiceStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Resolves once the pipeline leaves [`ServiceStatus::Running`], whether
    /// through a fault or a stop.
    pub async fn wait_until_not_running(&self) {
        let mut statuses = self.status_receiver();
        loop {
            if !self.is_running().await {
                return;
            }
            match statuses.recv().await {
                Ok(ServiceStatus::Running) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Skipped {} status updates", skipped);
                }
                Ok(_) | Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Applies a new configuration to the running pipeline.
    ///
    /// A changed listen address is normally bound before the old socket is
    /// released; if the bind fails the old socket stays in use and the error
    /// is returned. When the new address keeps the bound port, the old socket
    /// has to go first. Buffered fragments, held entries, the sequence
    /// counter and the forwarder queue all carry over.
    pub async fn reconfigure(&self, config: PipelineConfig) -> Result<(), PipelineError> {
        if self.inner.tasks.lock().await.is_none() {
            return Err(PipelineError::AlreadyStopped);
        }
        let mut current = self.inner.config.lock().await;

        if config.listen_address() != current.listen_address() {
            self.move_listener(&config.listen_address(), config.listen_port)
                .await?;
        }
        if config.normalization_window != current.normalization_window {
            self.inner.listener.set_window(config.normalization_window)?;
        }
        if config.timezone != current.timezone {
            self.inner.listener.set_timezone(config.timezone)?;
        }
        if config.print_all != current.print_all {
            self.inner.listener.set_print_all(config.print_all)?;
        }

        let forwarder = &self.inner.forwarder;
        let stopped = |_| PipelineError::AlreadyStopped;
        if config.downstream_address != current.downstream_address
            || config.downstream_protocol != current.downstream_protocol
        {
            forwarder
                .retarget(connect_lazily(
                    config.downstream_protocol,
                    &config.downstream_address,
                ))
                .map_err(stopped)?;
        }
        if config.forward_backoff_ceiling != current.forward_backoff_ceiling {
            forwarder
                .set_backoff_ceiling(config.forward_backoff_ceiling)
                .map_err(stopped)?;
        }
        if config.station_id != current.station_id {
            forwarder
                .set_station_id(config.station_id.clone())
                .map_err(stopped)?;
        }

        if config.queue_capacity != current.queue_capacity
            || config.metrics_interval != current.metrics_interval
            || config.drain_timeout != current.drain_timeout
            || config.sequence_checkpoint != current.sequence_checkpoint
        {
            warn!(
                "Queue capacity, metrics interval, drain timeout and checkpoint \
                 changes apply on restart"
            );
        }

        debug!("Pipeline reconfigured");
        *current = PipelineConfig {
            queue_capacity: current.queue_capacity,
            metrics_interval: current.metrics_interval,
            drain_timeout: current.drain_timeout,
            sequence_checkpoint: current.sequence_checkpoint.clone(),
            ..config
        };
        Ok(())
    }

    async fn move_listener(&self, address: &str, port: u16) -> Result<(), PipelineError> {
        let previous = self.inner.state.listen_addr();
        let same_port = port != 0 && previous.is_some_and(|addr| addr.port() == port);
        if !same_port {
            let buffer_reader = BufferReader::bind(address).await?;
            return self.install_reader(buffer_reader);
        }

        self.inner.listener.release().await?;
        self.inner.state.set_listen_addr(None);
        match BufferReader::bind(address).await {
            Ok(buffer_reader) => self.install_reader(buffer_reader),
            Err(e) => {
                if let Some(previous) = previous {
                    match BufferReader::bind(&previous.to_string()).await {
                        Ok(buffer_reader) => self.install_reader(buffer_reader)?,
                        Err(restore) => error!(
                            "Unable to rebind {} after a failed move: {}",
                            previous, restore
                        ),
                    }
                }
                Err(e)
            }
        }
    }

    fn install_reader(&self, buffer_reader: BufferReader) -> Result<(), PipelineError> {
        let listen_addr = buffer_reader.local_addr();
        self.inner.listener.rebind(buffer_reader)?;
        self.inner.state.set_listen_addr(listen_addr);
        Ok(())
    }

    /// Stops reading, flushes held entries to the forwarder and lets it
    /// drain for at most the drain timeout. Calling it again is a no-op.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let mut tasks = self.inner.tasks.lock().await;
        let Some(Tasks {
            listener,
            mut forwarder,
        }) = tasks.take()
        else {
            return Ok(());
        };

        self.inner.set_status(ServiceStatus::Stopping).await;
        info!("Stopping pipeline");
        let drain_timeout = self.inner.config.lock().await.drain_timeout;

        self.inner.listener_token.cancel();
        if let Err(e) = listener.await {
            error!("Listener task failed: {}", e);
        }

        if timeout(drain_timeout + ABORT_GRACE, &mut forwarder)
            .await
            .is_err()
        {
            warn!("Forwarder did not finish draining, aborting it");
            self.inner.forwarder_token.cancel();
            forwarder.abort();
        }

        let result = match &self.inner.checkpoint {
            Some(checkpoint) => {
                checkpoint
                    .store(self.inner.state.last_assigned_sequence())
                    .await
            }
            None => Ok(()),
        };

        self.inner.set_status(ServiceStatus::Stopped).await;
        info!("Pipeline stopped");
        result
    }
}
