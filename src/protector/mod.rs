//! Instance protector.
//!
//! Lanes call [`Protector::protect`] before running a job and
//! [`Protector::unprotect`] afterwards. The run loop collates those signals so
//! that the backend sees at most one `set_protection(true)` and one
//! `set_protection(false)` per busy period, and none at all for a job shorter
//! than the protect timeout.
//!
//! Both channels are bounded: when the run loop falls behind, `protect` and
//! `unprotect` wait for room.

pub mod aws;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ProtectorConfig;
use crate::error::Result;

pub use aws::AwsProtection;

/// Cloud-specific protection switch.
#[async_trait]
pub trait ProtectionBackend: Send + Sync {
    /// Turn scale-in protection on or off. May block for seconds.
    async fn set_protection(&self, protected: bool) -> Result<()>;
}

/// Backend for hosts without protection support.
#[derive(Debug, Default)]
pub struct NoProtection;

#[async_trait]
impl ProtectionBackend for NoProtection {
    async fn set_protection(&self, protected: bool) -> Result<()> {
        debug!(protected, "instance protection not configured");
        Ok(())
    }
}

/// Timing of the collation loop.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub protect: Duration,
    pub unprotect: Duration,
}

impl From<&ProtectorConfig> for Timeouts {
    fn from(config: &ProtectorConfig) -> Self {
        Self {
            protect: config.protect_timeout(),
            unprotect: config.unprotect_timeout(),
        }
    }
}

/// Sending side, cloned into every lane.
#[derive(Debug, Clone)]
pub struct Protector {
    protect_tx: mpsc::Sender<()>,
    unprotect_tx: mpsc::Sender<()>,
}

impl Protector {
    /// Start the run loop. It stops when `cancel` fires, unprotecting first if needed.
    pub fn spawn(
        backend: Arc<dyn ProtectionBackend>,
        timeouts: Timeouts,
        queue_size: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (protect_tx, protect_rx) = mpsc::channel(queue_size.max(1));
        let (unprotect_tx, unprotect_rx) = mpsc::channel(queue_size.max(1));

        let mut run = RunLoop {
            backend,
            timeouts,
            protect_rx,
            unprotect_rx,
            cancel,
        };
        let handle = tokio::spawn(async move { run.run().await });

        (Self {
            protect_tx,
            unprotect_tx,
        }, handle)
    }

    /// Signal that a job is starting.
    pub async fn protect(&self) {
        if self.protect_tx.send(()).await.is_err() {
            debug!("protector stopped, dropping protect");
        }
    }

    /// Signal that a job has ended.
    pub async fn unprotect(&self) {
        if self.unprotect_tx.send(()).await.is_err() {
            debug!("protector stopped, dropping unprotect");
        }
    }
}

struct RunLoop {
    backend: Arc<dyn ProtectionBackend>,
    timeouts: Timeouts,
    protect_rx: mpsc::Receiver<()>,
    unprotect_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
}

enum Phase {
    Continue,
    Stop,
}

impl RunLoop {
    async fn run(&mut self) {
        info!(
            protect_timeout = ?self.timeouts.protect,
            unprotect_timeout = ?self.timeouts.unprotect,
            "instance protector started"
        );
        while let Phase::Continue = self.cycle().await {}
        info!("instance protector stopped");
    }

    async fn set(&self, protected: bool) {
        match self.backend.set_protection(protected).await {
            Ok(()) => info!(protected, "instance protection changed"),
            Err(e) => warn!(protected, error = %e, "failed to change instance protection"),
        }
    }

    /// One protect/unprotect cycle.
    async fn cycle(&mut self) -> Phase {
        if let Phase::Stop = self.await_sustained_protect().await {
            return Phase::Stop;
        }

        self.set(true).await;
        let phase = self.await_sustained_unprotect().await;
        self.set(false).await;
        phase
    }

    /// Returns once a protect has outlived the protect timeout unpaired.
    async fn await_sustained_protect(&mut self) -> Phase {
        'wait: loop {
            tokio::select! {
                received = self.protect_rx.recv() => {
                    if received.is_none() {
                        return Phase::Stop;
                    }
                }
                _ = self.cancel.cancelled() => return Phase::Stop,
            }

            let timer = tokio::time::sleep(self.timeouts.protect);
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    received = self.unprotect_rx.recv() => {
                        if received.is_none() {
                            return Phase::Stop;
                        }
                        // the pair cancels; keep waiting only if another protect is pending
                        match self.protect_rx.try_recv() {
                            Ok(()) => continue,
                            Err(TryRecvError::Empty) => continue 'wait,
                            Err(TryRecvError::Disconnected) => return Phase::Stop,
                        }
                    }
                    _ = &mut timer => return Phase::Continue,
                    _ = self.cancel.cancelled() => return Phase::Stop,
                }
            }
        }
    }

    /// Returns once an unprotect has outlived the unprotect timeout unpaired.
    async fn await_sustained_unprotect(&mut self) -> Phase {
        loop {
            tokio::select! {
                received = self.unprotect_rx.recv() => {
                    if received.is_none() {
                        return Phase::Stop;
                    }
                }
                _ = self.cancel.cancelled() => return Phase::Stop,
            }

            tokio::select! {
                received = self.protect_rx.recv() => {
                    if received.is_none() {
                        return Phase::Stop;
                    }
                }
                _ = tokio::time::sleep(self.timeouts.unprotect) => return Phase::Continue,
                _ = self.cancel.cancelled() => return Phase::Stop,
            }
        }
    }
}
