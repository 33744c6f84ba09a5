//! Best-effort progress reporting.
//!
//! Sinks must never block the pipeline: a slow or absent observer loses
//! events instead of stalling verification.

use crate::pipeline::PipelineState;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub attempt_id: Uuid,
    pub state: PipelineState,
    /// Index of the frame just analysed, for frame-level events.
    pub frame_index: Option<usize>,
    pub valid_frames: usize,
}

pub trait ProgressSink: Send + Sync {
    /// Must return promptly.
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Logs every event at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: ProgressEvent) {
        tracing::debug!(
            attempt_id = %event.attempt_id,
            state = ?event.state,
            frame = ?event.frame_index,
            valid_frames = event.valid_frames,
            "verification progress"
        );
    }
}

/// Forwards events into a bounded channel, dropping them when it is full or closed.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus its receiving end, with room for `capacity` undelivered events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::trace!(error = %e, "progress event dropped");
        }
    }
}
