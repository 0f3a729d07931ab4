//! Per-job heartbeat task.

use std::sync::Arc;
use std::time::Duration;

use osbuild_worker_client::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

/// Running heartbeat; stop it once the job is finished.
pub struct Heartbeat {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Read the job status every `interval`. The read is the liveness signal;
    /// a `canceled` status fires `job_canceled`.
    pub fn spawn(client: Arc<Client>, job_id: Uuid, interval: Duration, job_canceled: CancellationToken) -> Self {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.cancelled() => return,
                }

                match client.job_status(job_id).await {
                    Ok(status) if status.canceled => {
                        if !job_canceled.is_cancelled() {
                            info!(%job_id, "job was canceled by the queue server");
                            job_canceled.cancel();
                        }
                    }
                    Ok(_) => debug!(%job_id, "heartbeat"),
                    Err(e) => warn!(%job_id, error = %e, "heartbeat failed"),
                }
            }
        });
        Self { stop, handle }
    }

    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "heartbeat task failed");
        }
    }
}
