//! Typed REST client for the worker API of the queue server.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use osbuild_worker_api::JobKind;
use reqwest::Method;
use reqwest::Response;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use snafu::ResultExt;
use tokio_util::io::ReaderStream;
use tracing::debug;
use tracing::info;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::auth::OAuthConfig;
use crate::auth::TokenCache;
use crate::error::AlreadyFinishedSnafu;
use crate::error::BuildClientSnafu;
use crate::error::Error;
use crate::error::HttpSnafu;
use crate::error::InvalidUrlSnafu;
use crate::error::JsonSnafu;
use crate::error::NotRegisteredSnafu;
use crate::error::ReadFileSnafu;
use crate::error::Result;
use crate::error::TlsSnafu;
use crate::error::UnauthorizedSnafu;
use crate::job::Job;
use crate::retry::RetryPolicy;

/// Default base path of the worker API.
pub const DEFAULT_BASE_PATH: &str = "/api/worker/v1";

/// Timeout for short queue operations.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Heartbeat interval against a remote queue server.
pub const HEARTBEAT_INTERVAL_REMOTE: Duration = Duration::from_secs(15);

/// Heartbeat interval over a local Unix socket.
pub const HEARTBEAT_INTERVAL_UNIX: Duration = Duration::from_secs(5);

/// Where the queue server listens.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// `host:port`, reached over HTTPS.
    Https { address: String },
    /// Path to a Unix-domain socket, plain HTTP.
    Unix { path: PathBuf },
    /// Explicit base URL (scheme, host and port) without TLS material.
    Url { url: String },
}

/// Everything needed to build a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub base_path: String,
    /// PEM CA bundle used to verify the server.
    pub ca_cert: Option<PathBuf>,
    /// PEM client certificate and key for mutual TLS.
    pub client_identity: Option<(PathBuf, PathBuf)>,
    pub proxy: Option<String>,
    pub oauth: Option<OAuthConfig>,
    pub retry: RetryPolicy,
    /// Overrides the endpoint's default heartbeat interval.
    pub heartbeat_interval: Option<Duration>,
}

impl ClientConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            base_path: DEFAULT_BASE_PATH.to_string(),
            ca_cert: None,
            client_identity: None,
            proxy: None,
            oauth: None,
            retry: RetryPolicy::default(),
            heartbeat_interval: None,
        }
    }
}

/// Liveness and cancellation state of a claimed job.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub canceled: bool,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    arch: &'a str,
}

#[derive(Deserialize)]
struct RegisterResponse {
    worker_id: Uuid,
}

#[derive(Serialize)]
struct ClaimRequest<'a> {
    types: &'a [JobKind],
    arch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker_id: Option<Uuid>,
}

/// Body of a 201 reply to a claim.
#[derive(Debug, Deserialize)]
pub struct ClaimResponse {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: JobKind,
    #[serde(default)]
    pub args: Option<Box<RawValue>>,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
}

#[derive(Serialize)]
struct ResultRequest<'a, T: Serialize> {
    result: &'a T,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    reason: String,
}

enum Body<'a> {
    Empty,
    Json(Vec<u8>),
    File(&'a Path),
}

/// Queue-server client shared by all lanes.
pub struct Client {
    http: reqwest::Client,
    base: Url,
    auth: Option<TokenCache>,
    retry: RetryPolicy,
    heartbeat_interval: Duration,
    worker: parking_lot::Mutex<Option<(Uuid, String)>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("base", &self.base).finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(REQUEST_TIMEOUT);

        let (origin, heartbeat_interval) = match &config.endpoint {
            Endpoint::Https { address } => {
                builder = builder.https_only(true);
                (format!("https://{address}"), HEARTBEAT_INTERVAL_REMOTE)
            }
            Endpoint::Unix { path } => {
                builder = builder.unix_socket(path.clone());
                ("http://localhost".to_string(), HEARTBEAT_INTERVAL_UNIX)
            }
            Endpoint::Url { url } => (url.trim_end_matches('/').to_string(), HEARTBEAT_INTERVAL_REMOTE),
        };

        if let Some(ca) = &config.ca_cert {
            let pem = std::fs::read(ca).context(ReadFileSnafu { path: ca.clone() })?;
            let cert = reqwest::Certificate::from_pem(&pem).context(TlsSnafu { path: ca.clone() })?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some((cert, key)) = &config.client_identity {
            let mut pem = std::fs::read(cert).context(ReadFileSnafu { path: cert.clone() })?;
            pem.extend(std::fs::read(key).context(ReadFileSnafu { path: key.clone() })?);
            let identity = reqwest::Identity::from_pem(&pem).context(TlsSnafu { path: cert.clone() })?;
            builder = builder.identity(identity);
        }

        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).context(BuildClientSnafu)?);
        }

        let http = builder.build().context(BuildClientSnafu)?;
        let auth = config.oauth.map(|oauth| TokenCache::new(oauth, http.clone()));

        let base_path = config.base_path.trim_end_matches('/');
        let base = if base_path.starts_with('/') {
            format!("{origin}{base_path}/")
        } else {
            format!("{origin}/{base_path}/")
        };
        let base = Url::parse(&base).context(InvalidUrlSnafu { url: base.clone() })?;
        let heartbeat_interval = config.heartbeat_interval.unwrap_or(heartbeat_interval);

        Ok(Self {
            http,
            base,
            auth,
            retry: config.retry,
            heartbeat_interval,
            worker: parking_lot::Mutex::new(None),
        })
    }

    /// How often lanes should heartbeat a running job.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// The id assigned at registration.
    pub fn worker_id(&self) -> Option<Uuid> {
        self.worker.lock().as_ref().map(|(id, _)| *id)
    }

    /// Register this worker and remember the assigned id.
    pub async fn register_worker(&self, arch: &str) -> Result<Uuid> {
        let body = json_body(&RegisterRequest { arch }, "register request")?;
        let response = self.send(Method::POST, "workers", &[], &body, Some(REQUEST_TIMEOUT)).await?;
        let response = expect(response, &[StatusCode::CREATED, StatusCode::OK]).await?;
        let registered: RegisterResponse = decode(response, "register response").await?;

        info!(worker_id = %registered.worker_id, arch, "registered with queue server");
        *self.worker.lock() = Some((registered.worker_id, arch.to_string()));
        Ok(registered.worker_id)
    }

    /// Keep-alive for the worker itself. Re-registers when the server forgot us.
    pub async fn update_worker_status(&self) -> Result<()> {
        let Some((worker_id, arch)) = self.worker.lock().clone() else {
            return NotRegisteredSnafu.fail();
        };

        let path = format!("workers/{worker_id}/status");
        let response = self.send(Method::POST, &path, &[], &Body::Empty, Some(REQUEST_TIMEOUT)).await?;
        if response.status() == StatusCode::BAD_REQUEST {
            warn!(%worker_id, "queue server does not know this worker, registering again");
            self.register_worker(&arch).await?;
            return Ok(());
        }
        expect(response, &[StatusCode::OK, StatusCode::CREATED, StatusCode::NO_CONTENT]).await?;
        Ok(())
    }

    /// Ask for a job of one of `kinds`. `None` means nothing is available.
    pub async fn claim(self: &Arc<Self>, kinds: &[JobKind], arch: &str) -> Result<Option<Job>> {
        let types = kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(",");
        let query = [("arch", arch.to_string()), ("types", types)];
        let body = json_body(
            &ClaimRequest {
                types: kinds,
                arch,
                worker_id: self.worker_id(),
            },
            "claim request",
        )?;

        let response = self.send(Method::POST, "jobs", &query, &body, None).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = expect(response, &[StatusCode::CREATED, StatusCode::OK]).await?;
        let claimed: ClaimResponse = decode(response, "claim response").await?;
        debug!(job_id = %claimed.id, kind = %claimed.kind, "claimed job");
        Ok(Some(Job::new(Arc::clone(self), claimed)))
    }

    /// Read the job's state. The server records liveness on every read.
    pub async fn job_status(&self, job_id: Uuid) -> Result<JobStatus> {
        let path = format!("jobs/{job_id}");
        let response = self.send(Method::GET, &path, &[], &Body::Empty, Some(REQUEST_TIMEOUT)).await?;
        let response = expect(response, &[StatusCode::OK]).await?;
        decode(response, "job status").await
    }

    /// Periodic liveness signal for a running job.
    pub async fn heartbeat(&self, job_id: Uuid) -> Result<()> {
        self.job_status(job_id).await.map(|_| ())
    }

    pub async fn is_canceled(&self, job_id: Uuid) -> Result<bool> {
        Ok(self.job_status(job_id).await?.canceled)
    }

    /// Overwrite the job's partial result.
    pub async fn update<T: Serialize>(&self, job_id: Uuid, result: &T) -> Result<()> {
        let body = json_body(&ResultRequest { result }, "job update")?;
        let path = format!("jobs/{job_id}");
        let response = self.send(Method::PATCH, &path, &[], &body, Some(REQUEST_TIMEOUT)).await?;
        expect(response, &[StatusCode::OK, StatusCode::NO_CONTENT]).await?;
        Ok(())
    }

    /// Record the terminal result.
    pub async fn finish<T: Serialize>(&self, job_id: Uuid, result: &T) -> Result<()> {
        let body = json_body(&ResultRequest { result }, "job result")?;
        let path = format!("jobs/{job_id}/finish");
        let response = self.send(Method::POST, &path, &[], &body, Some(REQUEST_TIMEOUT)).await?;
        if response.status() == StatusCode::CONFLICT {
            return AlreadyFinishedSnafu { job_id }.fail();
        }
        expect(response, &[StatusCode::OK, StatusCode::NO_CONTENT]).await?;
        Ok(())
    }

    /// Stream a file to the server as a named artifact of the job.
    pub async fn upload_artifact(&self, job_id: Uuid, name: &str, file: &Path) -> Result<()> {
        let path = format!("jobs/{job_id}/artifacts/{name}");
        let response = self.send(Method::POST, &path, &[], &Body::File(file), None).await?;
        expect(response, &[StatusCode::OK, StatusCode::CREATED, StatusCode::NO_CONTENT]).await?;
        Ok(())
    }

    /// Raw result of the job's `index`-th dependency.
    pub async fn fetch_dependency(&self, job_id: Uuid, index: usize) -> Result<Bytes> {
        let path = format!("jobs/{job_id}/dependencies/{index}");
        let response = self.send(Method::GET, &path, &[], &Body::Empty, Some(REQUEST_TIMEOUT)).await?;
        let response = expect(response, &[StatusCode::OK]).await?;
        response.bytes().await.context(HttpSnafu { url: path })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base.join(path).context(InvalidUrlSnafu { url: path })
    }

    /// Send with OAuth refresh on 401 and backoff on transient failures.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: &Body<'_>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let url = self.url(path)?;
        let mut refreshed = false;
        let mut attempt = 0;

        loop {
            let token = self.auth.as_ref().and_then(TokenCache::current);
            let outcome = self.send_once(method.clone(), url.as_str(), query, body, timeout, token.as_deref()).await;

            match outcome {
                Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    let Some(auth) = &self.auth else {
                        return Ok(response);
                    };
                    if refreshed {
                        return UnauthorizedSnafu { url: url.as_str() }.fail();
                    }
                    auth.refresh(token.as_deref()).await?;
                    refreshed = true;
                }
                Ok(response) if response.status().is_server_error() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    warn!(%url, status = %response.status(), attempt, ?delay, "server error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    warn!(%url, error = %err, attempt, ?delay, "request failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: &Body<'_>,
        timeout: Option<Duration>,
        token: Option<&str>,
    ) -> Result<Response> {
        let mut request = self.http.request(method, url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        request = match body {
            Body::Empty => request,
            Body::Json(bytes) => request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(bytes.clone()),
            Body::File(path) => {
                let file = tokio::fs::File::open(path).await.context(ReadFileSnafu { path: *path })?;
                let len = file.metadata().await.context(ReadFileSnafu { path: *path })?.len();
                request
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .header(reqwest::header::CONTENT_LENGTH, len)
                    .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            }
        };

        request.send().await.context(HttpSnafu { url })
    }
}

fn json_body<T: Serialize>(value: &T, what: &str) -> Result<Body<'static>> {
    serde_json::to_vec(value).map(Body::Json).context(JsonSnafu { what })
}

async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let url = response.url().to_string();
    let bytes = response.bytes().await.context(HttpSnafu { url })?;
    serde_json::from_slice(&bytes).context(JsonSnafu { what })
}

/// Turn an unexpected status into [`Error::Status`], decoding `{code, reason}` when present.
async fn expect(response: Response, accepted: &[StatusCode]) -> Result<Response> {
    let status = response.status();
    if accepted.contains(&status) {
        return Ok(response);
    }

    let url = response.url().to_string();
    let text = response.text().await.unwrap_or_default();
    let (code, reason) = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (body.code, body.reason),
        Err(_) => (None, text),
    };
    Err(Error::Status {
        url,
        status: status.as_u16(),
        code,
        reason,
    })
}
