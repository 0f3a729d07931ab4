//! `container-resolve`: pin container references to digests.
//!
//! Manifests are fetched raw with `skopeo inspect --raw`; the digest is the
//! SHA-256 of those exact bytes. A manifest list is narrowed to the entry for
//! the job's architecture and its digest recorded as `list-digest`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use osbuild_worker_api::ClientError;
use osbuild_worker_api::ErrorCode;
use osbuild_worker_api::jobs::ContainerResolveJob;
use osbuild_worker_api::jobs::ContainerResolveJobResult;
use osbuild_worker_api::jobs::ContainerSpec;
use serde::Deserialize;
use sha2::Digest;
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use crate::env::WorkerEnv;
use crate::error::Error;
use crate::error::Result;
use crate::handler::JobContext;
use crate::handler::TypedHandler;
use crate::process;
use crate::process::Invocation;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    media_type: String,
    #[serde(default)]
    manifests: Vec<ListEntry>,
    #[serde(default)]
    config: Option<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    architecture: String,
    #[serde(default)]
    os: String,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

impl RawManifest {
    fn is_list(&self) -> bool {
        self.media_type.contains("manifest.list") || self.media_type.contains("image.index") || !self.manifests.is_empty()
    }
}

/// Registry architecture name for a distribution architecture.
pub fn registry_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "ppc64le" => "ppc64le",
        "s390x" => "s390x",
        other => other,
    }
}

/// `sha256:<hex>` of a manifest.
pub fn manifest_digest(raw: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(raw)))
}

/// Reference without tag or digest: `registry/repo:tag` becomes `registry/repo`.
pub fn repository(reference: &str) -> &str {
    if let Some((repo, _)) = reference.split_once('@') {
        return repo;
    }
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => &reference[..name_start + i],
        None => reference,
    }
}

#[derive(Debug, Clone)]
pub struct ContainerResolver {
    skopeo: String,
    auth_file: Option<PathBuf>,
}

impl ContainerResolver {
    pub fn new(skopeo: impl Into<String>, auth_file: Option<PathBuf>) -> Self {
        Self {
            skopeo: skopeo.into(),
            auth_file,
        }
    }

    async fn inspect_raw(&self, reference: &str, tls_verify: bool, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let mut invocation = Invocation::new(&self.skopeo).arg("inspect").arg("--raw");
        if let Some(auth_file) = &self.auth_file {
            invocation = invocation.arg("--authfile").arg(auth_file.as_os_str());
        }
        if !tls_verify {
            invocation = invocation.arg("--tls-verify=false");
        }
        invocation = invocation.arg(format!("docker://{reference}"));
        Ok(process::run_checked(&invocation, cancel).await?.stdout)
    }

    /// Resolve one spec for `arch`.
    pub async fn resolve(&self, spec: &ContainerSpec, arch: &str, cancel: &CancellationToken) -> Result<ContainerSpec> {
        let tls_verify = spec.tls_verify.unwrap_or(true);
        let mut raw = self.inspect_raw(&spec.source, tls_verify, cancel).await?;
        let mut manifest: RawManifest = decode(&spec.source, &raw)?;
        let mut resolved = ContainerSpec {
            source: spec.source.clone(),
            name: if spec.name.is_empty() {
                spec.source.clone()
            } else {
                spec.name.clone()
            },
            tls_verify: spec.tls_verify,
            ..ContainerSpec::default()
        };

        if manifest.is_list() {
            resolved.list_digest = manifest_digest(&raw);
            let wanted = registry_arch(arch);
            let entry = manifest
                .manifests
                .iter()
                .find(|m| {
                    m.platform
                        .as_ref()
                        .is_some_and(|p| p.architecture == wanted && (p.os.is_empty() || p.os == "linux"))
                })
                .ok_or_else(|| Error::ContainerManifest {
                    reference: spec.source.clone(),
                    reason: format!("no image for architecture {arch} in manifest list"),
                })?;
            let reference = format!("{}@{}", repository(&spec.source), entry.digest);
            raw = self.inspect_raw(&reference, tls_verify, cancel).await?;
            manifest = decode(&reference, &raw)?;
        }

        resolved.digest = manifest_digest(&raw);
        resolved.image_id = manifest
            .config
            .map(|c| c.digest)
            .ok_or_else(|| Error::ContainerManifest {
                reference: spec.source.clone(),
                reason: "manifest has no config descriptor".to_string(),
            })?;
        Ok(resolved)
    }
}

fn decode(reference: &str, raw: &[u8]) -> Result<RawManifest> {
    serde_json::from_slice(raw).map_err(|e| Error::ContainerManifest {
        reference: reference.to_string(),
        reason: format!("invalid manifest: {e}"),
    })
}

pub struct ContainerResolveHandler {
    env: Arc<WorkerEnv>,
}

impl ContainerResolveHandler {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl TypedHandler for ContainerResolveHandler {
    type Output = ContainerResolveJobResult;

    async fn execute(&self, ctx: &JobContext, result: &mut ContainerResolveJobResult) -> Result<(), ClientError> {
        let args: ContainerResolveJob = ctx.args()?;
        let resolver = ContainerResolver::new(
            &self.env.tools.skopeo,
            self.env.config.containers_auth_file().map(PathBuf::from),
        );

        let resolved = futures::future::join_all(
            args.specs
                .iter()
                .map(|spec| resolver.resolve(spec, &args.arch, ctx.canceled())),
        )
        .await;

        let mut failure = None;
        for outcome in resolved {
            match outcome {
                Ok(spec) => result.specs.push(spec),
                Err(e) => {
                    error!(error = %e, "container resolution failed");
                    failure.get_or_insert_with(|| ClientError::new(ErrorCode::CONTAINER_RESOLUTION, e.to_string()));
                }
            }
        }
        info!(specs = result.specs.len(), "containers resolved");
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn test_repository() {
        assert_eq!(repository("registry.example:5000/ns/app:1.0"), "registry.example:5000/ns/app");
        assert_eq!(repository("registry.example:5000/ns/app"), "registry.example:5000/ns/app");
        assert_eq!(repository("quay.io/app@sha256:abc"), "quay.io/app");
        assert_eq!(repository("fedora:40"), "fedora");
    }

    #[test]
    fn test_manifest_digest() {
        assert_eq!(
            manifest_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    const LIST: &str = r#"{"mediaType":"application/vnd.oci.image.index.v1+json","manifests":[
        {"digest":"sha256:amd","platform":{"architecture":"amd64","os":"linux"}},
        {"digest":"sha256:arm","platform":{"architecture":"arm64","os":"linux"}}]}"#;
    const IMAGE: &str = r#"{"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"digest":"sha256:cfg"}}"#;

    /// A stand-in for skopeo that prints the list for tags and the image for digests.
    fn fake_skopeo(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("skopeo");
        let script = format!(
            "#!/bin/sh\nfor a in \"$@\"; do last=\"$a\"; done\ncase \"$last\" in\n  *@sha256:arm) printf '%s' '{IMAGE}' ;;\n  *) printf '%s' '{}' ;;\nesac\n",
            LIST.replace('\n', " ")
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_manifest_list_selects_architecture() {
        let dir = tempfile::tempdir().unwrap();
        let skopeo = fake_skopeo(dir.path());
        let resolver = ContainerResolver::new(skopeo.to_string_lossy(), None);
        let spec = ContainerSpec {
            source: "registry.example/app:latest".into(),
            ..Default::default()
        };

        let resolved = resolver.resolve(&spec, "aarch64", &CancellationToken::new()).await.unwrap();
        assert_eq!(resolved.name, "registry.example/app:latest");
        assert_eq!(resolved.image_id, "sha256:cfg");
        assert_eq!(resolved.digest, manifest_digest(IMAGE.as_bytes()));
        assert_eq!(resolved.list_digest, manifest_digest(LIST.replace('\n', " ").as_bytes()));

        let err = resolver.resolve(&spec, "riscv64", &CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("no image for architecture riscv64"));
    }
}
