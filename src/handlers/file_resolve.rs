//! `file-resolve`: fetch remote files and return their contents.

use std::sync::Arc;

use async_trait::async_trait;
use osbuild_worker_api::ClientError;
use osbuild_worker_api::ErrorCode;
use osbuild_worker_api::jobs::FileResolveJob;
use osbuild_worker_api::jobs::FileResolveJobResult;
use osbuild_worker_api::jobs::FileResolveJobResultItem;
use tracing::info;
use tracing::warn;

use crate::env::WorkerEnv;
use crate::handler::JobContext;
use crate::handler::TypedHandler;

async fn fetch(http: &reqwest::Client, url: &str) -> Result<Vec<u8>, String> {
    let response = http.get(url).send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("unexpected status {}", status.as_u16()));
    }
    let body = response.bytes().await.map_err(|e| e.to_string())?;
    Ok(body.to_vec())
}

/// Fetch every URL concurrently. Results keep the order of `urls`.
pub async fn resolve_all(http: &reqwest::Client, urls: &[String]) -> Vec<FileResolveJobResultItem> {
    let fetched = futures::future::join_all(urls.iter().map(|url| fetch(http, url))).await;
    urls.iter()
        .zip(fetched)
        .map(|(url, outcome)| match outcome {
            Ok(content) => FileResolveJobResultItem {
                url: url.clone(),
                content,
                resolution_error: None,
            },
            Err(e) => {
                warn!(%url, error = %e, "failed to resolve remote file");
                FileResolveJobResultItem {
                    url: url.clone(),
                    content: Vec::new(),
                    resolution_error: Some(ClientError::with_details(
                        ErrorCode::REMOTE_FILE_RESOLUTION,
                        format!("Error resolving remote file {url}"),
                        e,
                    )),
                }
            }
        })
        .collect()
}

pub struct FileResolveHandler {
    env: Arc<WorkerEnv>,
}

impl FileResolveHandler {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl TypedHandler for FileResolveHandler {
    type Output = FileResolveJobResult;

    async fn execute(&self, ctx: &JobContext, result: &mut FileResolveJobResult) -> Result<(), ClientError> {
        let args: FileResolveJob = ctx.args()?;

        result.results = resolve_all(&self.env.http, &args.urls).await;
        let failed: Vec<String> = result
            .results
            .iter()
            .filter(|item| item.resolution_error.is_some())
            .map(|item| item.url.clone())
            .collect();

        if !failed.is_empty() {
            result.success = false;
            return Err(ClientError::with_details(
                ErrorCode::REMOTE_FILE_RESOLUTION,
                "at least one file failed to resolve",
                failed,
            ));
        }

        info!(files = result.results.len(), "remote files resolved");
        result.success = true;
        Ok(())
    }
}
