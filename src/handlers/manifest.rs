//! Pieces shared by the manifest producing handlers.

use std::path::Path;
use std::path::PathBuf;

use osbuild_worker_api::ClientError;
use osbuild_worker_api::ErrorCode;
use osbuild_worker_api::PipelineNames;
use osbuild_worker_api::jobs::ManifestJobByIdResult;
use osbuild_worker_api::parse_manifest_pipelines;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::handlers::koji_finalize::COMPOSER_VERSION;
use crate::process;
use crate::process::Invocation;

/// Split pipelines into build and payload. A manifest the splitter rejects
/// has every named pipeline reported as payload.
pub fn pipeline_names(manifest: &Value) -> PipelineNames {
    let raw = serde_json::to_vec(manifest).unwrap_or_default();
    match parse_manifest_pipelines(&raw) {
        Ok(names) => names,
        Err(e) => {
            warn!(error = %e, "failed to parse pipeline names, treating all pipelines as payload");
            let payload = manifest
                .get("pipelines")
                .and_then(Value::as_array)
                .map(|pipelines| {
                    pipelines
                        .iter()
                        .filter_map(|p| p.get("name").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            PipelineNames {
                build: Vec::new(),
                payload,
            }
        }
    }
}

/// Fill `result` with a generated manifest.
pub fn set_manifest(result: &mut ManifestJobByIdResult, manifest: Value) {
    result.info.osbuild_composer_version = COMPOSER_VERSION.to_string();
    result.info.pipeline_names = Some(pipeline_names(&manifest));
    result.manifest = Some(manifest);
}

/// Serialize `value` as JSON into `dir/name`.
pub fn write_json(dir: &Path, name: &str, value: &impl Serialize) -> Result<PathBuf, ClientError> {
    let path = dir.join(name);
    let contents = serde_json::to_vec(value).map_err(|e| generation_error(format!("failed to serialize {name}: {e}")))?;
    std::fs::write(&path, contents)
        .map_err(|e| generation_error(format!("failed to write {}: {e}", path.display())))?;
    Ok(path)
}

pub fn generation_error(reason: impl Into<String>) -> ClientError {
    ClientError::new(ErrorCode::MANIFEST_GENERATION, reason)
}

/// Run a manifest generator and decode the manifest it prints.
pub async fn generate(invocation: &Invocation, cancel: &CancellationToken) -> Result<Value, ClientError> {
    let output = process::run_checked(invocation, cancel).await.map_err(|e| {
        ClientError::with_details(ErrorCode::MANIFEST_GENERATION, "Error generating manifest", e.to_string())
    })?;
    serde_json::from_slice(&output.stdout).map_err(|e| {
        ClientError::with_details(
            ErrorCode::MANIFEST_GENERATION,
            "Error decoding generated manifest",
            e.to_string(),
        )
    })
}
