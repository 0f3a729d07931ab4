//! Lane runtime.
//!
//! One task per lane that has registered kinds, plus the worker status
//! keep-alive. Everything is rooted at a single shutdown token.

pub mod heartbeat;
pub mod lane;

use std::sync::Arc;
use std::time::Duration;

use osbuild_worker_api::Lane;
use osbuild_worker_client::Client;
use osbuild_worker_client::Error as ClientFailure;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use heartbeat::Heartbeat;
pub use lane::ClaimBackoff;
pub use lane::LaneWorker;

use crate::protector::Protector;
use crate::registry::Registry;

/// Interval of the worker keep-alive.
pub const WORKER_STATUS_INTERVAL: Duration = Duration::from_secs(60);

pub struct Runtime {
    client: Arc<Client>,
    registry: Arc<Registry>,
    protector: Protector,
    arch: String,
    backoff: ClaimBackoff,
}

impl Runtime {
    pub fn new(client: Arc<Client>, registry: Registry, protector: Protector, arch: impl Into<String>) -> Self {
        Self {
            client,
            registry: Arc::new(registry),
            protector,
            arch: arch.into(),
            backoff: ClaimBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: ClaimBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Start every lane and the keep-alive. Returns when all lanes have stopped.
    pub async fn run(self, shutdown: CancellationToken) {
        let keepalive = spawn_status_keepalive(Arc::clone(&self.client), self.arch.clone(), shutdown.clone());

        let lanes: Vec<JoinHandle<()>> = Lane::ALL
            .into_iter()
            .filter(|lane| !self.registry.kinds_for(*lane).is_empty())
            .map(|lane| {
                let worker = LaneWorker::new(
                    lane,
                    Arc::clone(&self.client),
                    Arc::clone(&self.registry),
                    self.protector.clone(),
                    self.arch.clone(),
                    self.backoff,
                );
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();

        info!(lanes = lanes.len(), "worker running");
        for result in futures::future::join_all(lanes).await {
            if let Err(e) = result {
                warn!(error = %e, "lane task failed");
            }
        }

        keepalive.abort();
        info!("all lanes stopped");
    }
}

fn spawn_status_keepalive(client: Arc<Client>, arch: String, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(WORKER_STATUS_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            match client.update_worker_status().await {
                Ok(()) => debug!("worker status updated"),
                Err(ClientFailure::NotRegistered) => {
                    if let Err(e) = client.register_worker(&arch).await {
                        warn!(error = %e, "failed to register worker");
                    }
                }
                Err(e) => warn!(error = %e, "failed to update worker status"),
            }
        }
    })
}
