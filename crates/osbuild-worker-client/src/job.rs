//! Handle to a claimed job.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use osbuild_worker_api::JobKind;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use snafu::ResultExt;
use uuid::Uuid;

use crate::client::Client;
use crate::client::ClaimResponse;
use crate::error::JsonSnafu;
use crate::error::Result;

/// A job claimed by this worker.
///
/// All reporting goes through the handle so that only the claiming worker
/// ever touches the job.
#[derive(Debug)]
pub struct Job {
    client: Arc<Client>,
    id: Uuid,
    kind: JobKind,
    args: Option<Box<RawValue>>,
    dependencies: Vec<Uuid>,
}

impl Job {
    pub(crate) fn new(client: Arc<Client>, claimed: ClaimResponse) -> Self {
        Self {
            client,
            id: claimed.id,
            kind: claimed.kind,
            args: claimed.args,
            dependencies: claimed.dependencies,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn dependencies(&self) -> &[Uuid] {
        &self.dependencies
    }

    pub fn num_dependencies(&self) -> usize {
        self.dependencies.len()
    }

    /// Decode the job arguments. Absent arguments decode as an empty object.
    pub fn args<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        let raw = self.args.as_deref().map(RawValue::get).unwrap_or("{}");
        let raw = if raw == "null" { "{}" } else { raw };
        serde_json::from_str(raw)
    }

    /// Raw result of dependency `index`.
    pub async fn dependency_raw(&self, index: usize) -> Result<Bytes> {
        self.client.fetch_dependency(self.id, index).await
    }

    /// Result of dependency `index`, decoded as `T`.
    pub async fn dependency_result<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let bytes = self.dependency_raw(index).await?;
        serde_json::from_slice(&bytes).context(JsonSnafu {
            what: format!("dependency {index} of job {}", self.id),
        })
    }

    pub async fn update<T: Serialize>(&self, result: &T) -> Result<()> {
        self.client.update(self.id, result).await
    }

    pub async fn finish<T: Serialize>(&self, result: &T) -> Result<()> {
        self.client.finish(self.id, result).await
    }

    pub async fn upload_artifact(&self, name: &str, file: &Path) -> Result<()> {
        self.client.upload_artifact(self.id, name, file).await
    }

    pub async fn canceled(&self) -> Result<bool> {
        self.client.is_canceled(self.id).await
    }
}
