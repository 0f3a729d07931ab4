//! Shared environment handed to every handler.

use std::path::Path;
use std::path::PathBuf;

use snafu::ResultExt;

use crate::cloud::AwsCli;
use crate::config::WorkerConfig;
use crate::error;
use crate::error::Result;

/// Subdirectories of the worker's cache directory.
#[derive(Debug, Clone)]
pub struct CachePaths {
    pub root: PathBuf,
    /// Depsolver metadata cache.
    pub rpmmd: PathBuf,
    /// Build engine object store.
    pub store: PathBuf,
    /// Parent of the per-job output directories.
    pub output: PathBuf,
}

impl CachePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            rpmmd: root.join("rpmmd"),
            store: root.join("osbuild-store"),
            output: root.join("output"),
            root,
        }
    }

    pub fn create_all(&self) -> Result<()> {
        for dir in [&self.rpmmd, &self.store, &self.output] {
            std::fs::create_dir_all(dir).context(error::FilesystemSnafu {
                action: "create directory",
                path: dir.clone(),
            })?;
        }
        Ok(())
    }
}

/// External programs driven by the handlers.
#[derive(Debug, Clone)]
pub struct Tools {
    pub osbuild: String,
    pub dnf_json: PathBuf,
    pub skopeo: String,
    pub image_builder: String,
    pub aws: String,
    pub oci: String,
}

impl Tools {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            osbuild: "osbuild".to_string(),
            dnf_json: config.dnf_json.clone(),
            skopeo: "skopeo".to_string(),
            image_builder: "image-builder".to_string(),
            aws: "aws".to_string(),
            oci: "oci".to_string(),
        }
    }
}

/// Everything a handler needs besides the job itself.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub config: WorkerConfig,
    pub paths: CachePaths,
    pub tools: Tools,
    /// Architecture in the distribution's spelling, e.g. `x86_64`.
    pub arch: String,
    /// `ID-VERSION_ID` of the host, e.g. `fedora-40`.
    pub host_os: String,
    /// Plain HTTP client for resolvers.
    pub http: reqwest::Client,
}

impl WorkerEnv {
    pub fn new(config: WorkerConfig, paths: CachePaths) -> Self {
        Self {
            tools: Tools::from_config(&config),
            config,
            paths,
            arch: std::env::consts::ARCH.to_string(),
            host_os: host_os(Path::new("/etc/os-release")),
            http: reqwest::Client::new(),
        }
    }

    /// AWS client with the configured credentials file.
    pub fn aws(&self) -> AwsCli {
        let mut cli = AwsCli::new(&self.tools.aws);
        if let Some(credentials) = self.config.aws_credentials() {
            cli = cli.with_credentials(credentials);
        }
        cli
    }

    /// Create a fresh output directory for one job, removed when dropped.
    pub fn output_dir(&self) -> Result<tempfile::TempDir> {
        tempfile::Builder::new()
            .prefix("osbuild-")
            .tempdir_in(&self.paths.output)
            .context(error::FilesystemSnafu {
                action: "create output directory in",
                path: self.paths.output.clone(),
            })
    }
}

/// Read `ID` and `VERSION_ID` from an os-release file. Falls back to `linux`.
pub fn host_os(os_release: &Path) -> String {
    let Ok(contents) = std::fs::read_to_string(os_release) else {
        return "linux".to_string();
    };
    let mut id = None;
    let mut version = None;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "ID" => id = Some(value),
            "VERSION_ID" => version = Some(value),
            _ => {}
        }
    }
    match (id, version) {
        (Some(id), Some(version)) => format!("{id}-{version}"),
        (Some(id), None) => id,
        _ => "linux".to_string(),
    }
}
