//! `manifest-id-only`: pass a manifest generated by the queue server through,
//! after checking that the jobs it was generated from succeeded.

use async_trait::async_trait;
use osbuild_worker_api::ClientError;
use osbuild_worker_api::ErrorCode;
use osbuild_worker_api::JobKind;
use osbuild_worker_api::JobResult;
use osbuild_worker_api::jobs::ManifestJobById;
use osbuild_worker_api::jobs::ManifestJobByIdResult;
use serde_json::Value;
use tracing::info;
use tracing::warn;

use crate::handler::JobContext;
use crate::handler::TypedHandler;
use crate::handlers::manifest;

/// Error for a failed dependency of `kind`.
pub fn dependency_error(kind: JobKind) -> ClientError {
    let (code, reason) = match kind {
        JobKind::Depsolve => (ErrorCode::DEPSOLVE_DEPENDENCY, "Error in depsolve job dependency"),
        JobKind::ContainerResolve => (ErrorCode::CONTAINER_DEPENDENCY, "Error in container resolve job dependency"),
        JobKind::OstreeResolve => (ErrorCode::OSTREE_DEPENDENCY, "Error in ostree resolve job dependency"),
        _ => (ErrorCode::JOB_DEPENDENCY, "Error in job dependency"),
    };
    ClientError::with_details(code, reason, kind.as_str())
}

fn is_empty_manifest(manifest: Option<&Value>) -> bool {
    match manifest {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

#[derive(Debug, Default)]
pub struct ManifestIdOnlyHandler;

#[async_trait]
impl TypedHandler for ManifestIdOnlyHandler {
    type Output = ManifestJobByIdResult;

    async fn execute(&self, ctx: &JobContext, result: &mut ManifestJobByIdResult) -> Result<(), ClientError> {
        let args: ManifestJobById = ctx.args()?;
        let kinds = args.dependency_kinds.unwrap_or_default();

        for index in 0..ctx.job().num_dependencies() {
            let kind = kinds.get(index).copied().unwrap_or(JobKind::Depsolve);
            let envelope: JobResult = ctx
                .dependency(index, &format!("Error parsing dynamic args as {kind} job"))
                .await?;
            if let Some(err) = envelope.job_error {
                warn!(dependency = index, %kind, error = %err, "manifest dependency failed");
                return Err(dependency_error(kind));
            }
        }

        if is_empty_manifest(args.manifest.as_ref()) {
            return Err(ClientError::new(ErrorCode::MANIFEST_GENERATION, "Received empty manifest"));
        }
        if let Some(value) = args.manifest {
            manifest::set_manifest(result, value);
        }
        info!(job_id = %ctx.id(), "manifest accepted");
        Ok(())
    }
}
