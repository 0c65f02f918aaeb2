//! Audit logs.
//!
//! [`WorkerAuditLog`] never blocks the request path: events are handed to a
//! background task over a bounded channel and written to an [`AuditSink`] in
//! batches, on every tick and at shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::traits::{AuditLog, DataReceived, DataSent};

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditLog;

impl AuditLog for NoopAuditLog {
    fn store_received(&self, _event: DataReceived) {}
    fn store_sent(&self, _event: DataSent) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuditEvent {
    Received(DataReceived),
    Sent(DataSent),
}

impl AuditEvent {
    #[must_use]
    pub fn msg_id(&self) -> &str {
        match self {
            Self::Received(e) => &e.msg_id,
            Self::Sent(e) => &e.msg_id,
        }
    }
}

// ---------------------------------------------------------------------------
// AuditSink
// ---------------------------------------------------------------------------

/// Durable destination of audit events.
#[async_trait]
pub trait AuditSink: Send + 'static {
    async fn write(&mut self, batch: Vec<AuditEvent>);

    /// Called once after the final flush.
    async fn close(&mut self) {}
}

/// Keeps events in memory, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write(&mut self, batch: Vec<AuditEvent>) {
        self.events.lock().extend(batch);
    }
}

/// Emits one `tracing` event per audit record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&mut self, batch: Vec<AuditEvent>) {
        for event in batch {
            match event {
                AuditEvent::Received(e) => tracing::info!(
                    target: "busline::audit",
                    msg_id = %e.msg_id,
                    object_type = e.object_type,
                    object_id = e.object_id,
                    bytes = e.data.len(),
                    "data received"
                ),
                AuditEvent::Sent(e) => tracing::info!(
                    target: "busline::audit",
                    msg_id = %e.msg_id,
                    in_reply_to = %e.in_reply_to,
                    object_type = e.object_type,
                    object_id = e.object_id,
                    bytes = e.data.len(),
                    "data sent"
                ),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerAuditLog
// ---------------------------------------------------------------------------

/// Queue capacity between the request path and the worker.
const CHANNEL_CAPACITY: usize = 1024;

/// Audit log backed by a background writer task.
pub struct WorkerAuditLog {
    tx: mpsc::Sender<AuditEvent>,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerAuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerAuditLog")
            .field("stopped", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WorkerAuditLog {
    /// Spawns the writer task. Buffered events are flushed every
    /// `tick_interval_ms`.
    pub fn start<S: AuditSink>(mut sink: S, tick_interval_ms: u64) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(tick_interval_ms.max(1)));
            // First tick completes immediately.
            tick.tick().await;
            let mut buffer = Vec::new();

            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => buffer.push(event),
                        None => break,
                    },
                    _ = tick.tick() => {
                        if !buffer.is_empty() {
                            sink.write(std::mem::take(&mut buffer)).await;
                        }
                    }
                    () = token.cancelled() => break,
                }
            }

            rx.close();
            while let Ok(event) = rx.try_recv() {
                buffer.push(event);
            }
            if !buffer.is_empty() {
                sink.write(buffer).await;
            }
            sink.close().await;
        });

        Self {
            tx,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn submit(&self, event: AuditEvent) {
        if let Err(err) = self.tx.try_send(event) {
            let (reason, event) = match err {
                mpsc::error::TrySendError::Full(e) => ("queue full", e),
                mpsc::error::TrySendError::Closed(e) => ("worker stopped", e),
            };
            tracing::warn!(msg_id = %event.msg_id(), reason, "audit event dropped");
        }
    }

    /// Flushes buffered events and waits for the writer to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl AuditLog for WorkerAuditLog {
    fn store_received(&self, event: DataReceived) {
        self.submit(AuditEvent::Received(event));
    }

    fn store_sent(&self, event: DataSent) {
        self.submit(AuditEvent::Sent(event));
    }
}
