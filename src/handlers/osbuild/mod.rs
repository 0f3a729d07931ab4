//! `osbuild` and `bootc-image-builder`: run the build engine on a manifest
//! and hand the exported artifacts to the job's upload targets.

mod targets;

use std::sync::Arc;

use async_trait::async_trait;
use osbuild_worker_api::ClientError;
use osbuild_worker_api::ErrorCode;
use osbuild_worker_api::JobResult;
use osbuild_worker_api::PipelineNames;
use osbuild_worker_api::jobs::ManifestJobByIdResult;
use osbuild_worker_api::jobs::OsbuildJob;
use osbuild_worker_api::jobs::OsbuildJobResult;
use osbuild_worker_api::osbuild::OsbuildResult;
use osbuild_worker_api::target::Target;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use self::targets::Uploader;
use crate::config::WorkerConfig;
use crate::env::WorkerEnv;
use crate::error::Result;
use crate::handler::JobContext;
use crate::handler::JobHandler;
use crate::handler::Outcome;
use crate::process;
use crate::process::Invocation;

pub struct OsbuildHandler {
    env: Arc<WorkerEnv>,
}

impl OsbuildHandler {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env }
    }

    /// Fill in the manifest from the manifest job this build depends on.
    async fn resolve_manifest(&self, ctx: &JobContext, args: &mut OsbuildJob) -> Result<Value, ClientError> {
        if let Some(manifest) = args.manifest.take().filter(|m| !m.is_null()) {
            return Ok(manifest);
        }

        let dependencies = ctx.job().num_dependencies();
        let index = match (dependencies, args.manifest_dyn_args_idx) {
            (0, _) => None,
            (1, _) => Some(0),
            (_, index) => index,
        };
        if let Some(index) = index {
            if index >= dependencies {
                return Err(ClientError::with_details(
                    ErrorCode::PARSING_DYNAMIC_ARGS,
                    "Error parsing dynamic args",
                    format!("manifest index {index} is out of range of {dependencies} dependencies"),
                ));
            }
            let manifest_job: ManifestJobByIdResult = ctx.dependency(index, "Error parsing dynamic args").await?;
            if manifest_job.job_error.is_some() {
                return Err(ClientError::new(ErrorCode::MANIFEST_DEPENDENCY, "Manifest dependency failed"));
            }
            if let Some(manifest) = manifest_job.manifest.filter(|m| !m.is_null()) {
                return Ok(manifest);
            }
        }

        Err(ClientError::new(ErrorCode::EMPTY_MANIFEST, "Job has no manifest"))
    }
}

#[async_trait]
impl JobHandler for OsbuildHandler {
    async fn run(&self, ctx: &JobContext) -> Outcome {
        let mut result = OsbuildJobResult::default();
        if let Err(err) = self.build(ctx, &mut result).await {
            ctx.fail(&mut result, err);
        }
        validate_result(&mut result);
        Outcome::from_result(&result)
    }
}

impl OsbuildHandler {
    async fn build(&self, ctx: &JobContext, result: &mut OsbuildJobResult) -> Result<(), ClientError> {
        result.success = false;
        result.upload_status = "failure".to_string();
        result.arch = self.env.arch.clone();
        result.host_os = self.env.host_os.clone();

        let mut args: OsbuildJob = ctx.args()?;

        let version = osbuild_version(&self.env.tools.osbuild, ctx.canceled()).await.map_err(|e| {
            ClientError::with_details(ErrorCode::BUILD_JOB, "Error getting osbuild binary version", e.to_string())
        })?;
        result.osbuild_version = Some(version);

        let manifest = self.resolve_manifest(ctx, &mut args).await?;

        for index in 0..ctx.job().num_dependencies() {
            let dependency: JobResult = ctx.dependency(index, "Error parsing dynamic args").await?;
            if dependency.job_error.is_some() {
                return Err(ClientError::new(ErrorCode::JOB_DEPENDENCY, "Job dependency failed"));
            }
        }

        result.pipeline_names = args.pipeline_names.clone();
        result.image_boot_mode = args.image_boot_mode.clone();

        let exports = exports(&args.targets);
        if exports.is_empty() {
            return Err(ClientError::new(
                ErrorCode::INVALID_TARGET_CONFIG,
                "no osbuild export specified for the job",
            ));
        }

        if self.env.config.osbuild_executor.kind != "host" {
            return Err(ClientError::new(
                ErrorCode::INVALID_CONFIG,
                format!("unsupported osbuild executor {:?}", self.env.config.osbuild_executor.kind),
            ));
        }

        let output_dir = self.env.output_dir().map_err(|e| {
            ClientError::with_details(ErrorCode::BUILD_JOB, "osbuild build failed", e.to_string())
        })?;
        let input = serde_json::to_vec(&manifest)
            .map_err(|e| ClientError::with_details(ErrorCode::BUILD_JOB, "osbuild build failed", e.to_string()))?;
        let invocation = Invocation::new(&self.env.tools.osbuild)
            .arg("--store")
            .arg(self.env.paths.store.as_os_str())
            .arg("--output-directory")
            .arg(output_dir.path().as_os_str())
            .arg("--json")
            .args(exports.iter().flat_map(|export| ["--export", export.as_str()]))
            .arg("-")
            .env_pairs(extra_env(&self.env.config).iter().map(String::as_str))
            .stdin(input)
            .inherit_stderr();

        info!(exports = ?exports, "running osbuild");
        let osbuild_output = run_osbuild(&invocation, ctx.canceled())
            .await
            .map_err(|e| ClientError::with_details(ErrorCode::BUILD_JOB, "osbuild build failed", e.to_string()))?;

        log_stages(&osbuild_output, args.pipeline_names.as_ref());
        let succeeded = osbuild_output.success;
        result.osbuild_output = Some(osbuild_output);
        if !succeeded {
            return Err(build_failure(result.osbuild_output.as_ref(), args.pipeline_names.as_ref()));
        }

        let osbuild_output = result.osbuild_output.clone().unwrap_or_default();
        let uploader = Uploader {
            env: &self.env,
            ctx,
            args: &args,
            output_dir: output_dir.path(),
            manifest: &manifest,
            osbuild_output: &osbuild_output,
        };
        for target in &args.targets {
            let target_result = uploader.upload(target).await?;
            result.target_results.push(target_result);
        }

        let target_errors: Vec<&ClientError> =
            result.target_results.iter().filter_map(|r| r.target_error.as_ref()).collect();
        if !target_errors.is_empty() {
            return Err(ClientError::with_details(
                ErrorCode::TARGET,
                "at least one target failed",
                target_errors,
            ));
        }

        result.success = true;
        result.upload_status = "success".to_string();
        Ok(())
    }
}

/// Export names of the targets, first occurrence wins.
fn exports(targets: &[Target]) -> Vec<String> {
    let mut exports: Vec<String> = Vec::new();
    for target in targets {
        let name = &target.osbuild_artifact.export_name;
        if !name.is_empty() && !exports.contains(name) {
            exports.push(name.clone());
        }
    }
    exports
}

/// `KEY=value` pairs for the engine: registry auth and repository mTLS material.
fn extra_env(config: &WorkerConfig) -> Vec<String> {
    let mut env = Vec::new();
    if let Some(auth_file) = config.containers_auth_file() {
        env.push(format!("REGISTRY_AUTH_FILE={}", auth_file.display()));
    }
    if let Some(mtls) = &config.repository_mtls {
        if let Some(ca) = &mtls.ca {
            env.push(format!("OSBUILD_SOURCES_CURL_SSL_CA_CERT={}", ca.display()));
            env.push(format!("OSBUILD_SOURCES_OSTREE_SSL_CA_CERT={}", ca.display()));
        }
        let key = mtls.mtls_client_key.display();
        let cert = mtls.mtls_client_cert.display();
        env.push(format!("OSBUILD_SOURCES_CURL_SSL_CLIENT_KEY={key}"));
        env.push(format!("OSBUILD_SOURCES_CURL_SSL_CLIENT_CERT={cert}"));
        env.push(format!("OSBUILD_SOURCES_OSTREE_SSL_CLIENT_KEY={key}"));
        env.push(format!("OSBUILD_SOURCES_OSTREE_SSL_CLIENT_CERT={cert}"));
        if let Some(proxy) = &mtls.proxy {
            env.push(format!("OSBUILD_SOURCES_CURL_PROXY={proxy}"));
            env.push(format!("OSBUILD_SOURCES_OSTREE_PROXY={proxy}"));
        }
    }
    env
}

/// Version reported by `osbuild --version`, without the program name.
async fn osbuild_version(program: &str, cancel: &CancellationToken) -> Result<String> {
    let output = process::run_checked(&Invocation::new(program).arg("--version"), cancel).await?;
    let text = output.stdout_text();
    let text = text.trim();
    Ok(text.strip_prefix("osbuild ").unwrap_or(text).to_string())
}

/// Run the engine. A non-zero exit still yields its JSON result.
async fn run_osbuild(invocation: &Invocation, cancel: &CancellationToken) -> Result<OsbuildResult> {
    let output = process::run(invocation, cancel).await?;
    match serde_json::from_slice(&output.stdout) {
        Ok(result) => Ok(result),
        Err(source) if output.success() => Err(crate::error::Error::DecodeOutput {
            what: "osbuild result".to_string(),
            source,
        }),
        Err(_) => Err(crate::error::Error::CommandFailed {
            command: invocation.display(),
            status: output.status.to_string(),
            stderr: String::new(),
        }),
    }
}

fn log_stages(output: &OsbuildResult, pipelines: Option<&PipelineNames>) {
    let Some(pipelines) = pipelines else {
        return;
    };
    for pipeline in pipelines.all() {
        let Some(stages) = output.log.get(pipeline) else {
            continue;
        };
        info!(pipeline, "pipeline results");
        for stage in stages {
            if stage.success {
                info!(pipeline, stage = %stage.kind, "stage succeeded");
            } else {
                info!(pipeline, stage = %stage.kind, "stage failed");
                for line in stage.output.lines() {
                    info!("    {line}");
                }
            }
        }
    }
}

/// Job error of a build the engine reported as unsuccessful.
fn build_failure(output: Option<&OsbuildResult>, pipelines: Option<&PipelineNames>) -> ClientError {
    let Some(output) = output else {
        return ClientError::new(ErrorCode::BUILD_JOB, "osbuild build failed");
    };

    let mut messages = Vec::new();
    if let Some(error) = &output.error {
        messages.push(format!("osbuild error: {}", error.get()));
    }
    for error in &output.errors {
        messages.push(format!("manifest validation error: {}: {}", error.path_string(), error.message));
    }

    let failed = match pipelines {
        Some(names) => output.failed_stage(names.all()),
        None => output.any_failed_stage(),
    };
    let reason = match failed {
        Some(stage) => format!("osbuild build failed in stage: {:?}", stage.kind),
        None => "osbuild build failed".to_string(),
    };

    if messages.is_empty() {
        ClientError::new(ErrorCode::BUILD_JOB, reason)
    } else {
        ClientError::with_details(ErrorCode::BUILD_JOB, reason, messages)
    }
}

/// The job result is unsuccessful without saying why.
pub fn validate_result(result: &mut OsbuildJobResult) {
    if !result.osbuild_succeeded() && result.job_error.is_none() {
        result.job_error = Some(ClientError::new(ErrorCode::BUILD_JOB, "osbuild job was unsuccessful"));
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use osbuild_worker_api::target::OsbuildArtifact;
    use serde_json::json;

    use super::*;
    use crate::config::ContainersConfig;
    use crate::config::RepositoryMtlsConfig;

    fn target(export: &str) -> Target {
        Target {
            uuid: None,
            name: "org.osbuild.worker.server".into(),
            image_name: "disk.qcow2".into(),
            osbuild_artifact: OsbuildArtifact {
                export_filename: "disk.qcow2".into(),
                export_name: export.into(),
            },
            options: Value::Null,
        }
    }

    #[test]
    fn test_exports_are_unique_and_ordered() {
        let targets = [target("qcow2"), target(""), target("vmdk"), target("qcow2")];
        assert_eq!(exports(&targets), vec!["qcow2".to_string(), "vmdk".to_string()]);
    }

    #[test]
    fn test_extra_env() {
        let mut config = WorkerConfig::default();
        assert!(extra_env(&config).is_empty());

        config.containers = Some(ContainersConfig {
            auth_file_path: Some(PathBuf::from("/etc/containers/auth.json")),
            ..Default::default()
        });
        config.repository_mtls = Some(RepositoryMtlsConfig {
            baseurl: "https://cdn.example/".into(),
            ca: None,
            mtls_client_key: "/etc/pki/key.pem".into(),
            mtls_client_cert: "/etc/pki/cert.pem".into(),
            proxy: Some("http://proxy.example:3128".into()),
        });
        assert_eq!(
            extra_env(&config),
            vec![
                "REGISTRY_AUTH_FILE=/etc/containers/auth.json",
                "OSBUILD_SOURCES_CURL_SSL_CLIENT_KEY=/etc/pki/key.pem",
                "OSBUILD_SOURCES_CURL_SSL_CLIENT_CERT=/etc/pki/cert.pem",
                "OSBUILD_SOURCES_OSTREE_SSL_CLIENT_KEY=/etc/pki/key.pem",
                "OSBUILD_SOURCES_OSTREE_SSL_CLIENT_CERT=/etc/pki/cert.pem",
                "OSBUILD_SOURCES_CURL_PROXY=http://proxy.example:3128",
                "OSBUILD_SOURCES_OSTREE_PROXY=http://proxy.example:3128",
            ]
        );
    }

    #[test]
    fn test_build_failure_names_the_stage() {
        let output: OsbuildResult = serde_json::from_value(json!({
            "success": false,
            "log": {
                "build": [{"id": "1", "type": "org.osbuild.rpm", "success": true, "output": ""}],
                "os": [
                    {"id": "2", "type": "org.osbuild.rpm", "success": true, "output": ""},
                    {"id": "3", "type": "org.osbuild.selinux", "success": false, "output": "setfiles: boom"}
                ]
            },
            "errors": [{"message": "is not valid", "path": ["pipelines", 0]}]
        }))
        .unwrap();
        let names = PipelineNames {
            build: vec!["build".into()],
            payload: vec!["os".into()],
        };

        let err = build_failure(Some(&output), Some(&names));
        assert_eq!(err.code, ErrorCode::BUILD_JOB);
        assert_eq!(err.reason, "osbuild build failed in stage: \"org.osbuild.selinux\"");
        let details = err.details.unwrap();
        assert_eq!(details.as_array().unwrap().len(), 1);
        assert!(details[0].as_str().unwrap().starts_with("manifest validation error: "));
    }

    #[test]
    fn test_build_failure_without_stage() {
        let output = OsbuildResult::default();
        let err = build_failure(Some(&output), None);
        assert_eq!(err.reason, "osbuild build failed");
        assert!(err.details.is_none());
    }

    #[test]
    fn test_validate_result() {
        let mut result = OsbuildJobResult::default();
        validate_result(&mut result);
        assert_eq!(result.job_error.unwrap().reason, "osbuild job was unsuccessful");

        let mut result = OsbuildJobResult {
            job_error: Some(ClientError::new(ErrorCode::TARGET, "at least one target failed")),
            ..Default::default()
        };
        validate_result(&mut result);
        assert_eq!(result.job_error.unwrap().code, ErrorCode::TARGET);
    }
}
