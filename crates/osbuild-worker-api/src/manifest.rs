//! Build/payload split of a version 2 osbuild manifest.

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::ensure;

use crate::error::BuildPropertySnafu;
use crate::error::ManifestEmptySnafu;
use crate::error::ManifestJsonSnafu;
use crate::error::ManifestVersionSnafu;
use crate::error::NoPipelinesSnafu;
use crate::error::ParseError;

/// The only manifest version this worker understands.
pub const MANIFEST_VERSION: &str = "2";

/// Pipeline names split into those that build the buildroot and those that
/// produce the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineNames {
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub payload: Vec<String>,
}

impl PipelineNames {
    /// Every name, build pipelines first.
    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.build.iter().chain(self.payload.iter()).map(String::as_str)
    }
}

#[derive(Deserialize)]
struct ManifestHead {
    #[serde(default)]
    version: String,
    #[serde(default)]
    pipelines: Vec<PipelineHead>,
}

#[derive(Deserialize)]
struct PipelineHead {
    name: String,
    #[serde(default)]
    build: Option<String>,
}

/// Split the pipelines of a manifest into build and payload names.
///
/// A pipeline is a build pipeline iff another pipeline references it through
/// `"build": "name:<pipeline>"`. References to names that do not exist are
/// ignored. Order follows the manifest.
pub fn parse_manifest_pipelines(manifest: &[u8]) -> Result<PipelineNames, ParseError> {
    ensure!(!manifest.is_empty(), ManifestEmptySnafu);

    let head: ManifestHead = serde_json::from_slice(manifest).context(ManifestJsonSnafu)?;
    ensure!(head.version == MANIFEST_VERSION, ManifestVersionSnafu { version: head.version });
    ensure!(!head.pipelines.is_empty(), NoPipelinesSnafu);

    let mut referenced: Vec<&str> = Vec::new();
    for pipeline in &head.pipelines {
        let Some(build) = pipeline.build.as_deref() else {
            continue;
        };
        match build.strip_prefix("name:") {
            Some(name) if !name.is_empty() => referenced.push(name),
            _ => return BuildPropertySnafu { value: build }.fail(),
        }
    }

    let mut names = PipelineNames::default();
    for pipeline in &head.pipelines {
        if referenced.contains(&pipeline.name.as_str()) {
            names.build.push(pipeline.name.clone());
        } else {
            names.payload.push(pipeline.name.clone());
        }
    }
    Ok(names)
}
