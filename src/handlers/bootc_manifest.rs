//! `bootc-manifest`: manifest for a bootable container image.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use osbuild_worker_api::ClientError;
use osbuild_worker_api::jobs::BootcManifestJob;
use osbuild_worker_api::jobs::ManifestJobByIdResult;
use tracing::info;

use crate::env::WorkerEnv;
use crate::handler::JobContext;
use crate::handler::TypedHandler;
use crate::handlers::manifest;
use crate::handlers::manifest::generation_error;
use crate::process::Invocation;

/// Build the command line, writing the blueprint into `dir` when one is set.
pub fn command(program: &str, job: &BootcManifestJob, dir: &Path) -> Result<Invocation, ClientError> {
    let mut invocation = Invocation::new(program)
        .arg("manifest")
        .args(["--bootc-ref", job.image_ref.as_str()]);
    if !job.build_ref.is_empty() {
        invocation = invocation.args(["--bootc-build-ref", job.build_ref.as_str()]);
    }
    invocation = invocation.args(["--arch", job.arch.as_str()]);

    let has_blueprint = match &job.blueprint {
        serde_json::Value::Null => false,
        serde_json::Value::Object(map) => !map.is_empty(),
        _ => true,
    };
    if has_blueprint {
        let path = manifest::write_json(dir, "blueprint.json", &job.blueprint)?;
        invocation = invocation.arg("--blueprint").arg(path);
    }

    Ok(invocation.arg("--").arg(job.image_type.as_str()).current_dir(dir))
}

pub struct BootcManifestHandler {
    env: Arc<WorkerEnv>,
}

impl BootcManifestHandler {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl TypedHandler for BootcManifestHandler {
    type Output = ManifestJobByIdResult;

    async fn execute(&self, ctx: &JobContext, result: &mut ManifestJobByIdResult) -> Result<(), ClientError> {
        let job: BootcManifestJob = ctx.args()?;
        let dir = tempfile::Builder::new()
            .prefix("bootc-manifest-")
            .tempdir()
            .map_err(|e| generation_error(format!("failed to create temporary directory: {e}")))?;

        let invocation = command(&self.env.tools.image_builder, &job, dir.path())?;
        let generated = manifest::generate(&invocation, ctx.canceled()).await?;
        manifest::set_manifest(result, generated);

        info!(image = %job.image_ref, image_type = %job.image_type, "bootc manifest generated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn job() -> BootcManifestJob {
        serde_json::from_value(json!({
            "reference": "quay.io/centos-bootc/centos-bootc:stream9",
            "arch": "aarch64",
            "image_type": "qcow2",
        }))
        .unwrap()
    }

    #[test]
    fn test_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = command("image-builder", &job(), dir.path()).unwrap();
        assert_eq!(
            invocation.arg_strings(),
            vec![
                "manifest",
                "--bootc-ref",
                "quay.io/centos-bootc/centos-bootc:stream9",
                "--arch",
                "aarch64",
                "--",
                "qcow2"
            ]
        );

        let mut job = job();
        job.build_ref = "quay.io/centos-bootc/builder:stream9".into();
        job.blueprint = json!({"customizations": {"user": [{"name": "admin"}]}});
        let invocation = command("image-builder", &job, dir.path()).unwrap();
        let args = invocation.arg_strings();
        assert_eq!(args[3], "--bootc-build-ref");
        assert_eq!(args[4], "quay.io/centos-bootc/builder:stream9");
        assert_eq!(args[7], "--blueprint");
        assert!(dir.path().join("blueprint.json").is_file());
    }
}
