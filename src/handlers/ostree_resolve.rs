//! `ostree-resolve`: turn `url` + `ref` into a commit checksum.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use osbuild_worker_api::ClientError;
use osbuild_worker_api::ErrorCode;
use osbuild_worker_api::jobs::OstreeResolveJob;
use osbuild_worker_api::jobs::OstreeResolveJobResult;
use osbuild_worker_api::jobs::OstreeResolveResultSpec;
use osbuild_worker_api::jobs::OstreeResolveSpec;
use regex::Regex;
use tracing::error;
use tracing::info;

use crate::env::WorkerEnv;
use crate::handler::JobContext;
use crate::handler::TypedHandler;

/// Entitlement certificates of a subscribed host.
pub const RHSM_CONSUMER_DIR: &str = "/etc/pki/consumer";

/// Secrets name the build engine uses to find the consumer certificate.
pub const RHSM_CONSUMER_SECRETS: &str = "org.osbuild.rhsm.consumer";

static REF_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[\w\d][-._\w\d]*/)*[\w\d][-._\w\d]*$").expect("valid ostree ref regex"));

/// Whether `git_ref` is a well formed ostree ref such as `fedora/40/x86_64/iot`.
pub fn verify_ref(git_ref: &str) -> bool {
    REF_PATTERN.is_match(git_ref)
}

/// `<url>/refs/heads/<ref>` with exactly one slash at the join.
pub fn ref_url(url: &str, git_ref: &str) -> String {
    format!("{}/refs/heads/{}", url.trim_end_matches('/'), git_ref)
}

#[derive(Debug, Clone)]
pub struct OstreeResolver {
    http: reqwest::Client,
    consumer_dir: PathBuf,
}

impl OstreeResolver {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            consumer_dir: PathBuf::from(RHSM_CONSUMER_DIR),
        }
    }

    pub fn with_consumer_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.consumer_dir = dir.into();
        self
    }

    fn rhsm_client(&self) -> Result<reqwest::Client, String> {
        let pem = read_identity(&self.consumer_dir)?;
        let identity = reqwest::Identity::from_pem(&pem).map_err(|e| format!("invalid consumer certificate: {e}"))?;
        reqwest::Client::builder()
            .identity(identity)
            .build()
            .map_err(|e| format!("failed to build client: {e}"))
    }

    pub async fn resolve(&self, spec: &OstreeResolveSpec) -> Result<OstreeResolveResultSpec, ClientError> {
        if spec.url.is_empty() {
            return Err(ClientError::new(
                ErrorCode::OSTREE_PARAMS_INVALID,
                "ostree resolve spec has no URL",
            ));
        }
        if !verify_ref(&spec.git_ref) {
            return Err(ClientError::new(
                ErrorCode::OSTREE_REF_INVALID,
                format!("Invalid ostree ref {:?}", spec.git_ref),
            ));
        }

        let resolution_error =
            |e: String| ClientError::new(ErrorCode::OSTREE_REF_RESOLUTION, format!("Error resolving ostree ref: {e}"));

        let client = if spec.rhsm {
            self.rhsm_client().map_err(resolution_error)?
        } else {
            self.http.clone()
        };

        let url = ref_url(&spec.url, &spec.git_ref);
        let response = client.get(&url).send().await.map_err(|e| resolution_error(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(resolution_error(format!("{url} returned {}", status.as_u16())));
        }
        let body = response.text().await.map_err(|e| resolution_error(e.to_string()))?;
        let checksum = body.trim().to_string();
        if checksum.is_empty() {
            return Err(resolution_error(format!("{url} returned an empty checksum")));
        }

        Ok(OstreeResolveResultSpec {
            url: spec.url.clone(),
            git_ref: spec.git_ref.clone(),
            checksum,
            rhsm: spec.rhsm,
            secrets: if spec.rhsm {
                RHSM_CONSUMER_SECRETS.to_string()
            } else {
                String::new()
            },
        })
    }
}

fn read_identity(dir: &Path) -> Result<Vec<u8>, String> {
    let mut pem = Vec::new();
    for name in ["cert.pem", "key.pem"] {
        let path = dir.join(name);
        let contents = std::fs::read(&path).map_err(|e| format!("read {}: {e}", path.display()))?;
        pem.extend_from_slice(&contents);
        pem.push(b'\n');
    }
    Ok(pem)
}

pub struct OstreeResolveHandler {
    env: Arc<WorkerEnv>,
}

impl OstreeResolveHandler {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl TypedHandler for OstreeResolveHandler {
    type Output = OstreeResolveJobResult;

    async fn execute(&self, ctx: &JobContext, result: &mut OstreeResolveJobResult) -> Result<(), ClientError> {
        let args: OstreeResolveJob = ctx.args()?;
        let resolver = OstreeResolver::new(self.env.http.clone());

        let resolved = futures::future::join_all(args.specs.iter().map(|spec| resolver.resolve(spec))).await;

        let mut failure = None;
        for outcome in resolved {
            match outcome {
                Ok(spec) => result.specs.push(spec),
                Err(e) => {
                    error!(error = %e, "ostree resolution failed");
                    failure.get_or_insert(e);
                }
            }
        }
        info!(specs = result.specs.len(), "ostree refs resolved");
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;

    use super::*;

    #[test]
    fn test_verify_ref() {
        for valid in ["fedora/40/x86_64/iot", "rhel/9/x86_64/edge", "main", "a.b-c_d/e"] {
            assert!(verify_ref(valid), "{valid}");
        }
        for invalid in ["", "/leading", "trailing/", "double//slash", "-dash", "sp ace", "a/.hidden"] {
            assert!(!verify_ref(invalid), "{invalid}");
        }
    }

    #[test]
    fn test_ref_url() {
        assert_eq!(
            ref_url("https://ostree.example/repo/", "fedora/40/x86_64/iot"),
            "https://ostree.example/repo/refs/heads/fedora/40/x86_64/iot"
        );
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/repo")
    }

    fn spec(url: &str, git_ref: &str) -> OstreeResolveSpec {
        OstreeResolveSpec {
            url: url.into(),
            git_ref: git_ref.into(),
            rhsm: false,
        }
    }

    #[tokio::test]
    async fn test_resolve_checksum() {
        let router = Router::new()
            .route("/repo/refs/heads/fedora/40/x86_64/iot", get(|| async { "abc123\n" }))
            .route("/repo/refs/heads/missing", get(|| async { StatusCode::NOT_FOUND }));
        let url = serve(router).await;
        let resolver = OstreeResolver::new(reqwest::Client::new());

        let resolved = resolver.resolve(&spec(&url, "fedora/40/x86_64/iot")).await.unwrap();
        assert_eq!(resolved.checksum, "abc123");
        assert!(resolved.secrets.is_empty());

        let err = resolver.resolve(&spec(&url, "missing")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::OSTREE_REF_RESOLUTION);
    }

    #[tokio::test]
    async fn test_invalid_specs() {
        let resolver = OstreeResolver::new(reqwest::Client::new());

        let err = resolver.resolve(&spec("http://127.0.0.1:1/repo", "bad//ref")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::OSTREE_REF_INVALID);

        let err = resolver.resolve(&spec("", "main")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::OSTREE_PARAMS_INVALID);
    }

    #[tokio::test]
    async fn test_rhsm_without_consumer_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = OstreeResolver::new(reqwest::Client::new()).with_consumer_dir(dir.path());
        let mut rhsm = spec("https://cdn.example/repo", "rhel/9/x86_64/edge");
        rhsm.rhsm = true;

        let err = resolver.resolve(&rhsm).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::OSTREE_REF_RESOLUTION);
        assert!(err.reason.contains("cert.pem"));
    }
}
