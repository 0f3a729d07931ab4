//! One lane: claim, run, finish, strictly one job at a time.

use std::sync::Arc;
use std::time::Duration;

use osbuild_worker_api::ClientError;
use osbuild_worker_api::ErrorCode;
use osbuild_worker_api::JobKind;
use osbuild_worker_api::Lane;
use osbuild_worker_client::Client;
use osbuild_worker_client::Error as ClientFailure;
use osbuild_worker_client::Job;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::info_span;

use super::heartbeat::Heartbeat;
use crate::handler::JobContext;
use crate::handler::Outcome;
use crate::handler::run_guarded;
use crate::protector::Protector;
use crate::registry::Registry;

/// Pauses between claims.
#[derive(Debug, Clone, Copy)]
pub struct ClaimBackoff {
    /// After the queue server had nothing to offer.
    pub idle: Duration,
    /// After a failed claim.
    pub error: Duration,
}

impl Default for ClaimBackoff {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(1),
            error: Duration::from_secs(10),
        }
    }
}

pub struct LaneWorker {
    lane: Lane,
    kinds: Vec<JobKind>,
    client: Arc<Client>,
    registry: Arc<Registry>,
    protector: Protector,
    arch: String,
    backoff: ClaimBackoff,
}

impl LaneWorker {
    pub fn new(
        lane: Lane,
        client: Arc<Client>,
        registry: Arc<Registry>,
        protector: Protector,
        arch: impl Into<String>,
        backoff: ClaimBackoff,
    ) -> Self {
        Self {
            kinds: registry.kinds_for(lane),
            lane,
            client,
            registry,
            protector,
            arch: arch.into(),
            backoff,
        }
    }

    /// Claim and run jobs until `shutdown` fires. Neither an outstanding claim nor a
    /// running job is interrupted by shutdown; a job the server handed out is always run.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(lane = %self.lane, kinds = ?self.kinds, "lane started");

        while !shutdown.is_cancelled() {
            let claimed = self.client.claim(&self.kinds, &self.arch).await;

            let pause = match claimed {
                Ok(Some(job)) => {
                    let span = info_span!("job", lane = %self.lane, job_id = %job.id(), kind = %job.kind());
                    self.process(job).instrument(span).await;
                    continue;
                }
                Ok(None) => {
                    debug!(lane = %self.lane, "no job available");
                    self.backoff.idle
                }
                Err(e) => {
                    error!(lane = %self.lane, error = %e, "failed to claim job");
                    self.backoff.error
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!(lane = %self.lane, "lane stopped");
    }

    async fn process(&self, job: Job) {
        let kind = job.kind();
        info!("running job");
        self.protector.protect().await;

        let ctx = JobContext::new(job, CancellationToken::new());
        let heartbeat = Heartbeat::spawn(
            Arc::clone(&self.client),
            ctx.id(),
            self.client.heartbeat_interval(),
            ctx.canceled().clone(),
        );

        let outcome = match self.registry.get(kind) {
            Some(handler) => run_guarded(handler.as_ref(), &ctx).await,
            None => Outcome::failed(ClientError::new(
                ErrorCode::INVALID_CONFIG,
                format!("no handler registered for job kind {kind}"),
            )),
        };

        match &outcome.job_error {
            None => info!("job succeeded"),
            Some(err) => info!(code = err.code.0, reason = %err.reason, "job failed"),
        }

        if ctx.canceled().is_cancelled() {
            info!("job was canceled, not reporting a result");
        } else {
            match ctx.job().finish(&outcome.result).await {
                Ok(()) => {}
                Err(ClientFailure::AlreadyFinished { .. }) => info!("job was already finished"),
                Err(e) => error!(error = %e, "failed to report job result"),
            }
        }

        heartbeat.stop().await;
        self.protector.unprotect().await;
    }
}
