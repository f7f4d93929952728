//! Progress reporting and cooperative cancellation

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Receives `(current, total)` after each page. Failures are the
/// observer's own business; the pipeline logs and ignores them.
pub trait ProgressObserver {
    fn on_progress(&self, current: usize, total: usize) -> anyhow::Result<()>;
}

impl<F> ProgressObserver for F
where
    F: Fn(usize, usize) -> anyhow::Result<()>,
{
    fn on_progress(&self, current: usize, total: usize) -> anyhow::Result<()> {
        self(current, total)
    }
}

/// Logs progress through `tracing`
#[derive(Debug, Clone, Default)]
pub struct LogProgress {
    label: String,
}

impl LogProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl ProgressObserver for LogProgress {
    fn on_progress(&self, current: usize, total: usize) -> anyhow::Result<()> {
        info!("{}: page {}/{}", self.label, current, total);
        Ok(())
    }
}

/// Progress event for hosts listening on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub current: usize,
    pub total: usize,
}

/// Forwards progress over a `crossbeam` channel
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    sender: Sender<ProgressEvent>,
}

impl ChannelProgress {
    /// Observer plus the receiving end
    pub fn new() -> (Self, Receiver<ProgressEvent>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl ProgressObserver for ChannelProgress {
    fn on_progress(&self, current: usize, total: usize) -> anyhow::Result<()> {
        self.sender
            .send(ProgressEvent { current, total })
            .map_err(|_| anyhow::anyhow!("progress receiver dropped"))
    }
}

/// Shared cancellation flag, checked before each page render
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
