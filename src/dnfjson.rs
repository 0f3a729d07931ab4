//! Bridge to the `dnf-json` depsolver helper.
//!
//! The helper reads one JSON request on stdin and answers on stdout. A
//! non-zero exit turns stdout into a `{kind, reason}` error document.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use osbuild_worker_api::ClientError;
use osbuild_worker_api::ErrorCode;
use osbuild_worker_api::jobs::PackageSet;
use osbuild_worker_api::jobs::RepoConfig;
use osbuild_worker_api::jobs::SbomDoc;
use osbuild_worker_api::jobs::SbomType;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::error;
use crate::error::Error;
use crate::error::Result;
use crate::process;
use crate::process::Invocation;

/// Request framing shared by every command.
#[derive(Debug, Serialize)]
struct Request<'a> {
    command: &'a str,
    module_platform_id: &'a str,
    arch: &'a str,
    releasever: &'a str,
    cachedir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<&'a str>,
    arguments: Arguments,
}

#[derive(Debug, Default, Serialize)]
struct Arguments {
    repos: Vec<DnfRepo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    transactions: Vec<Transaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    search: Option<Search>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sbom: Option<SbomRequest>,
}

#[derive(Debug, Serialize)]
struct SbomRequest {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct Transaction {
    #[serde(rename = "package-specs")]
    package_specs: Vec<String>,
    #[serde(rename = "exclude-specs")]
    exclude_specs: Vec<String>,
    #[serde(rename = "repo-ids")]
    repo_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Search {
    latest: bool,
    packages: Vec<String>,
}

/// Repository in the helper's spelling.
#[derive(Debug, Clone, PartialEq, Serialize)]
struct DnfRepo {
    id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(rename = "baseurl", skip_serializing_if = "Vec::is_empty")]
    baseurls: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    metalink: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    mirrorlist: String,
    #[serde(rename = "gpgkey", skip_serializing_if = "Vec::is_empty")]
    gpgkeys: Vec<String>,
    #[serde(rename = "gpgcheck", skip_serializing_if = "Option::is_none")]
    check_gpg: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sslverify: Option<bool>,
    #[serde(skip_serializing_if = "String::is_empty")]
    sslcacert: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    sslclientkey: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    sslclientcert: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    metadata_expire: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    module_hotfixes: Option<bool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    rhsm: bool,
}

impl From<&RepoConfig> for DnfRepo {
    fn from(repo: &RepoConfig) -> Self {
        Self {
            id: repo.id.clone(),
            name: repo.name.clone(),
            baseurls: repo.baseurls.clone(),
            metalink: repo.metalink.clone(),
            mirrorlist: repo.mirrorlist.clone(),
            gpgkeys: repo.gpgkeys.clone(),
            check_gpg: repo.check_gpg,
            sslverify: repo.ignore_ssl.map(|ignore| !ignore),
            sslcacert: repo.sslcacert.clone(),
            sslclientkey: repo.sslclientkey.clone(),
            sslclientcert: repo.sslclientcert.clone(),
            metadata_expire: repo.metadata_expire.clone(),
            module_hotfixes: repo.module_hotfixes,
            rhsm: repo.rhsm,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DepsolveReply {
    #[serde(default)]
    solver: String,
    #[serde(default)]
    packages: Vec<Value>,
    #[serde(default)]
    sbom: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SearchReply {
    #[serde(default)]
    packages: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    kind: String,
    reason: String,
}

/// Outcome of resolving one chain of package sets.
#[derive(Debug, Clone)]
pub struct Depsolved {
    pub solver: String,
    pub packages: Vec<Value>,
    /// Every repository of the chain, with ids assigned.
    pub repos: Vec<RepoConfig>,
    pub sbom: Option<SbomDoc>,
}

/// Distribution coordinates of a request.
#[derive(Debug, Clone, Copy)]
pub struct Platform<'a> {
    pub module_platform_id: &'a str,
    pub arch: &'a str,
    pub releasever: &'a str,
}

/// Size the metadata cache is shrunk to after each depsolve.
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 1024 * 1024 * 1024;

/// Cache entries are named after the sha256 of their repository config.
const REPO_ID_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct DnfJson {
    program: PathBuf,
    cache_dir: PathBuf,
    proxy: Option<String>,
    max_cache_size: u64,
}

impl DnfJson {
    pub fn new(program: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cache_dir: cache_dir.into(),
            proxy: None,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
        }
    }

    pub fn with_max_cache_size(mut self, size: u64) -> Self {
        self.max_cache_size = size;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Resolve a chain of package sets; each transaction sees the repositories of all earlier sets.
    ///
    /// With `sbom` set the reply must carry an SBOM document of that type.
    pub async fn depsolve(
        &self,
        chain: &[PackageSet],
        platform: Platform<'_>,
        sbom: Option<SbomType>,
        cancel: &CancellationToken,
    ) -> Result<Depsolved> {
        let mut repos: Vec<RepoConfig> = Vec::new();
        let mut transactions = Vec::with_capacity(chain.len());
        for set in chain {
            for repo in &set.repositories {
                let mut repo = repo.clone();
                if repo.id.is_empty() {
                    repo.id = repos.len().to_string();
                }
                repos.push(repo);
            }
            transactions.push(Transaction {
                package_specs: set.include.clone(),
                exclude_specs: set.exclude.clone(),
                repo_ids: repos.iter().map(|r| r.id.clone()).collect(),
            });
        }

        let arguments = Arguments {
            repos: repos.iter().map(DnfRepo::from).collect(),
            transactions,
            search: None,
            sbom: sbom.map(|kind| SbomRequest { kind: kind.as_str() }),
        };
        let stdout = self.call("depsolve", platform, arguments, cancel).await?;
        let reply: DepsolveReply = serde_json::from_slice(&stdout).context(error::DecodeOutputSnafu {
            what: "depsolve reply",
        })?;
        let sbom = match (sbom, reply.sbom) {
            (Some(doc_type), Some(document)) => Some(SbomDoc { doc_type, document }),
            (Some(doc_type), None) => {
                return error::MissingOutputSnafu {
                    what: format!("{} document", doc_type.as_str()),
                }
                .fail();
            }
            (None, _) => None,
        };
        Ok(Depsolved {
            solver: reply.solver,
            packages: reply.packages,
            repos,
            sbom,
        })
    }

    /// Latest packages matching `packages` in `repos`.
    pub async fn search(
        &self,
        repos: &[RepoConfig],
        packages: &[String],
        platform: Platform<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>> {
        let repos = repos
            .iter()
            .enumerate()
            .map(|(i, repo)| {
                let mut repo = DnfRepo::from(repo);
                if repo.id.is_empty() {
                    repo.id = i.to_string();
                }
                repo
            })
            .collect();
        let arguments = Arguments {
            repos,
            transactions: Vec::new(),
            search: Some(Search {
                latest: true,
                packages: packages.to_vec(),
            }),
            sbom: None,
        };
        let stdout = self.call("search", platform, arguments, cancel).await?;
        let reply: SearchReply = serde_json::from_slice(&stdout).context(error::DecodeOutputSnafu {
            what: "search reply",
        })?;
        Ok(reply.packages)
    }

    async fn call(
        &self,
        command: &str,
        platform: Platform<'_>,
        arguments: Arguments,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let request = Request {
            command,
            module_platform_id: platform.module_platform_id,
            arch: platform.arch,
            releasever: platform.releasever,
            cachedir: self.cache_dir.to_string_lossy().into_owned(),
            proxy: self.proxy.as_deref(),
            arguments,
        };
        let input = serde_json::to_vec(&request).context(error::EncodeInputSnafu { what: "dnf-json request" })?;
        debug!(command, repos = request.arguments.repos.len(), "calling dnf-json");

        let invocation = Invocation::new(self.program.to_string_lossy()).stdin(input);
        let output = process::run(&invocation, cancel).await?;
        if output.success() {
            return Ok(output.stdout);
        }

        match serde_json::from_slice::<ErrorReply>(&output.stdout) {
            Ok(reply) => Err(Error::DnfJson {
                kind: reply.kind,
                reason: reply.reason,
            }),
            Err(_) => error::CommandFailedSnafu {
                command: invocation.display(),
                status: output.status.to_string(),
                stderr: output.stderr.trim().to_string(),
            }
            .fail(),
        }
    }
}

/// Everything cached for one repository.
#[derive(Debug, Default)]
struct RepoCache {
    paths: Vec<PathBuf>,
    size: u64,
    mtime: Option<SystemTime>,
}

impl DnfJson {
    /// Delete the least recently used repository caches until the cache is
    /// below the configured maximum size. Returns the number of bytes freed.
    ///
    /// The cache holds one directory per distribution; inside it every entry
    /// starts with the id of the repository it belongs to.
    pub fn clean_cache(&self) -> Result<u64> {
        let mut repos: HashMap<String, RepoCache> = HashMap::new();
        let mut total = 0;

        let Ok(distros) = std::fs::read_dir(&self.cache_dir) else {
            return Ok(0);
        };
        for distro in distros.flatten() {
            let Ok(entries) = std::fs::read_dir(distro.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(repo_id) = name.to_str().and_then(|n| n.get(..REPO_ID_LEN)) else {
                    continue;
                };
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                let size = disk_usage(&entry.path());
                let repo = repos.entry(repo_id.to_string()).or_default();
                repo.paths.push(entry.path());
                repo.size += size;
                repo.mtime = repo.mtime.max(metadata.modified().ok());
                total += size;
            }
        }

        let mut by_age: Vec<_> = repos.into_iter().collect();
        by_age.sort_by_key(|(_, repo)| repo.mtime);

        let mut freed = 0;
        for (repo_id, repo) in by_age {
            if total < self.max_cache_size {
                break;
            }
            for path in &repo.paths {
                let removed = if path.is_dir() {
                    std::fs::remove_dir_all(path)
                } else {
                    std::fs::remove_file(path)
                };
                removed.context(error::FilesystemSnafu {
                    action: "removing cache entry",
                    path: path.clone(),
                })?;
            }
            debug!(%repo_id, size = repo.size, "evicted repository cache");
            total -= repo.size;
            freed += repo.size;
        }
        if freed > 0 {
            info!(freed, remaining = total, "cleaned rpm metadata cache");
        }
        Ok(freed)
    }
}

/// Bytes used by the files below `path`. Unreadable entries count as empty.
fn disk_usage(path: &Path) -> u64 {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if !metadata.is_dir() {
        return metadata.len();
    }
    std::fs::read_dir(path)
        .map(|entries| entries.flatten().map(|entry| disk_usage(&entry.path())).sum())
        .unwrap_or(0)
}

/// Classify a depsolver failure.
pub fn client_error(err: &Error) -> ClientError {
    match err {
        Error::DnfJson { kind, reason } => {
            let code = match kind.as_str() {
                "DepsolveError" => ErrorCode::DNF_DEPSOLVE,
                "MarkingErrors" => ErrorCode::DNF_MARKING,
                "RepoError" => ErrorCode::DNF_REPO,
                _ => ErrorCode::DNF_OTHER,
            };
            ClientError::with_details(code, format!("DNF error occurred: {kind}"), reason)
        }
        other => ClientError::with_details(ErrorCode::RPMMD, "rpmmd error in depsolve job", other.to_string()),
    }
}
