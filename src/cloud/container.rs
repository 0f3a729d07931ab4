//! Pushing OCI archives to container registries through `skopeo copy`.

use std::path::Path;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error;
use crate::error::Result;
use crate::process;
use crate::process::Invocation;

const DEFAULT_DOMAIN: &str = "docker.io";

/// True when the first path component of `reference` names a registry host.
fn has_domain(first: &str) -> bool {
    first.contains(['.', ':']) || first == "localhost"
}

/// Prefix `domain[/path_prefix]/` onto references that carry no registry host.
///
/// Returns the reference and whether the defaults were applied. Nothing is
/// applied when `domain` is empty.
pub fn apply_default_domain_path(reference: &str, domain: &str, path_prefix: &str) -> (String, bool) {
    let bare = match reference.split_once('/') {
        None => true,
        Some((first, _)) => !has_domain(first),
    };
    if !bare || domain.is_empty() {
        return (reference.to_string(), false);
    }
    let base = if path_prefix.is_empty() {
        domain.to_string()
    } else {
        format!("{domain}/{path_prefix}")
    };
    (format!("{base}/{reference}"), true)
}

/// A fully qualified push destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Registry host, e.g. `registry.example.com:5000`.
    pub domain: String,
    /// `domain/path[:tag][@digest]`, tagged `latest` when neither was given.
    pub reference: String,
}

/// Qualify `reference` the way registries resolve short names.
pub fn normalize_reference(reference: &str) -> Result<Destination> {
    let invalid = |reason: &str| {
        error::InvalidReferenceSnafu {
            reference,
            reason: reason.to_string(),
        }
        .build()
    };
    if reference.is_empty() {
        return Err(invalid("empty reference"));
    }

    let (domain, remainder) = match reference.split_once('/') {
        Some((first, rest)) if has_domain(first) => (first.to_string(), rest.to_string()),
        _ => (DEFAULT_DOMAIN.to_string(), reference.to_string()),
    };
    let (named, digest) = match remainder.split_once('@') {
        Some((named, digest)) => (named, Some(digest)),
        None => (remainder.as_str(), None),
    };
    let last_slash = named.rfind('/').map_or(0, |i| i + 1);
    let (path, tag) = match named[last_slash..].rfind(':') {
        Some(i) => (&named[..last_slash + i], Some(&named[last_slash + i + 1..])),
        None => (named, None),
    };

    let valid_path = !path.is_empty()
        && path.split('/').all(|component| {
            !component.is_empty()
                && component
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        });
    if !valid_path {
        return Err(invalid("repository name must be lowercase alphanumerics and separators"));
    }
    if tag.is_some_and(str::is_empty) || digest.is_some_and(str::is_empty) {
        return Err(invalid("empty tag or digest"));
    }

    let path = if domain == DEFAULT_DOMAIN && !path.contains('/') {
        format!("library/{path}")
    } else {
        path.to_string()
    };
    let mut qualified = format!("{domain}/{path}");
    match (tag, digest) {
        (None, None) => qualified.push_str(":latest"),
        (tag, digest) => {
            if let Some(tag) = tag {
                qualified.push(':');
                qualified.push_str(tag);
            }
            if let Some(digest) = digest {
                qualified.push('@');
                qualified.push_str(digest);
            }
        }
    }
    Ok(Destination {
        domain,
        reference: qualified,
    })
}

/// `containers-auth.json` document granting `username` access to `domain`.
pub fn auth_document(domain: &str, username: &str, password: &str) -> serde_json::Value {
    let auth = STANDARD.encode(format!("{username}:{password}"));
    json!({ "auths": { domain: { "auth": auth } } })
}

/// Invocation context for pushing with `skopeo`.
#[derive(Debug, Clone)]
pub struct RegistryPush {
    program: String,
    auth_file: Option<PathBuf>,
    cert_dir: Option<PathBuf>,
    credentials: Option<(String, String)>,
    tls_verify: bool,
}

impl RegistryPush {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            auth_file: None,
            cert_dir: None,
            credentials: None,
            tls_verify: true,
        }
    }

    pub fn with_auth_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.auth_file = Some(path.into());
        self
    }

    pub fn with_cert_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_dir = Some(path.into());
        self
    }

    /// Registry credentials; they replace the auth file for this push.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn with_tls_verify(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    fn invocation(&self, archive: &Path, destination: &str, auth_file: Option<&Path>, digest_file: &Path) -> Invocation {
        let mut invocation = Invocation::new(&self.program).arg("copy");
        if let Some(auth_file) = auth_file {
            invocation = invocation.arg("--authfile").arg(auth_file.as_os_str());
        }
        if let Some(dir) = &self.cert_dir {
            invocation = invocation.arg("--dest-cert-dir").arg(dir.as_os_str());
        }
        let mut source = std::ffi::OsString::from("oci-archive:");
        source.push(archive.as_os_str());
        invocation
            .arg(format!("--dest-tls-verify={}", self.tls_verify))
            .arg("--digestfile")
            .arg(digest_file.as_os_str())
            .arg(source)
            .arg(format!("docker://{destination}"))
    }

    /// Push `archive` to `destination` and return the manifest digest.
    pub async fn push(&self, archive: &Path, destination: &Destination, cancel: &CancellationToken) -> Result<String> {
        let scratch = tempfile::tempdir().context(error::FilesystemSnafu {
            action: "create temporary directory in",
            path: std::env::temp_dir(),
        })?;
        let auth_file = match &self.credentials {
            Some((username, password)) => {
                let path = scratch.path().join("auth.json");
                let document = auth_document(&destination.domain, username, password);
                tokio::fs::write(&path, document.to_string())
                    .await
                    .context(error::FilesystemSnafu {
                        action: "write",
                        path: path.clone(),
                    })?;
                Some(path)
            }
            None => self.auth_file.clone(),
        };
        let digest_file = scratch.path().join("digest");

        info!(destination = %destination.reference, "pushing container image");
        let invocation = self.invocation(archive, &destination.reference, auth_file.as_deref(), &digest_file);
        process::run_checked(&invocation, cancel).await?;

        let digest = tokio::fs::read_to_string(&digest_file)
            .await
            .context(error::FilesystemSnafu {
                action: "read",
                path: digest_file.clone(),
            })?;
        Ok(digest.trim().to_string())
    }
}
