//! `koji-init`: reserve a build on a Koji hub.

use std::sync::Arc;

use async_trait::async_trait;
use osbuild_worker_api::ClientError;
use osbuild_worker_api::ErrorCode;
use osbuild_worker_api::jobs::KojiInitJob;
use osbuild_worker_api::jobs::KojiInitJobResult;
use tracing::info;
use tracing::warn;

use crate::env::WorkerEnv;
use crate::handler::JobContext;
use crate::handler::TypedHandler;
use crate::koji;

pub struct KojiInitHandler {
    env: Arc<WorkerEnv>,
}

impl KojiInitHandler {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env }
    }

    async fn init_build(&self, args: &KojiInitJob) -> Result<(u64, String), String> {
        let session = koji::login(&self.env.config, &args.server).await.map_err(|e| e.to_string())?;
        let reserved = session.cg_init_build(&args.name, &args.version, &args.release).await;
        if let Err(e) = session.logout().await {
            warn!(error = %e, "koji logout failed");
        }
        let build = reserved.map_err(|e| e.to_string())?;
        Ok((build.build_id, build.token))
    }
}

#[async_trait]
impl TypedHandler for KojiInitHandler {
    type Output = KojiInitJobResult;

    async fn execute(&self, ctx: &JobContext, result: &mut KojiInitJobResult) -> Result<(), ClientError> {
        let args: KojiInitJob = ctx.args()?;
        match self.init_build(&args).await {
            Ok((build_id, token)) => {
                info!(build_id, name = %args.name, version = %args.version, release = %args.release, "koji build reserved");
                result.build_id = build_id;
                result.token = token;
                Ok(())
            }
            Err(reason) => {
                result.koji_error = reason.clone();
                Err(ClientError::new(ErrorCode::KOJI_INIT, reason))
            }
        }
    }
}
