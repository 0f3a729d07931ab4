//! Content-generator metadata passed to `CGImport`.
//!
//! The shapes follow Koji's content generator metadata format, version 0.

use std::collections::BTreeMap;

use osbuild_worker_api::target::OsbuildArtifact;
use osbuild_worker_api::target::TargetResult;
use serde::Deserialize;
use serde::Serialize;

use crate::rpm::Rpm;

/// Only version understood by the hub.
pub const METADATA_VERSION: u32 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub metadata_version: u32,
    pub build: Build,
    pub buildroots: Vec<BuildRoot>,
    pub output: Vec<BuildOutput>,
}

impl Metadata {
    pub fn new(build: Build, buildroots: Vec<BuildRoot>, output: Vec<BuildOutput>) -> Self {
        Self {
            metadata_version: METADATA_VERSION,
            build,
            buildroots,
            output,
        }
    }
}

/// The build being imported. `extra` is what the web UI shows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub build_id: u64,
    pub task_id: u64,
    pub name: String,
    pub version: String,
    pub release: String,
    pub source: String,
    pub start_time: i64,
    pub end_time: i64,
    pub extra: BuildExtra,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildExtra {
    pub typeinfo: TypeInfoBuild,
    /// Manifest extra info keyed by manifest filename.
    #[serde(rename = "osbuild_manifest", default, skip_serializing_if = "Option::is_none")]
    pub manifests: Option<BTreeMap<String, ManifestExtraInfo>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeInfoBuild {
    /// Image extra info keyed by image filename.
    pub image: BTreeMap<String, ImageExtraInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub os: String,
    pub arch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentGenerator {
    pub name: String,
    pub version: String,
}

impl Default for ContentGenerator {
    fn default() -> Self {
        Self {
            name: crate::session::CONTENT_GENERATOR.to_string(),
            version: "0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// `none`, `chroot`, `kvm`, `docker`, ...
    #[serde(rename = "type")]
    pub kind: String,
    pub arch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub version: String,
}

/// Environment that produced one or more outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRoot {
    pub id: u64,
    pub host: Host,
    pub content_generator: ContentGenerator,
    pub container: Container,
    pub tools: Vec<Tool>,
    pub components: Vec<Rpm>,
}

impl BuildRoot {
    /// Build root of an image built directly on the worker host.
    pub fn host(id: u64, os: &str, arch: &str, components: Vec<Rpm>) -> Self {
        Self {
            id,
            host: Host {
                os: os.to_string(),
                arch: arch.to_string(),
            },
            content_generator: ContentGenerator::default(),
            container: Container {
                kind: "none".to_string(),
                arch: arch.to_string(),
            },
            tools: Vec::new(),
            components,
        }
    }
}

/// Extra info of an image output. Also keyed into [`TypeInfoBuild`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageExtraInfo {
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osbuild_artifact: Option<OsbuildArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osbuild_version: Option<String>,
    /// Results of the image's other upload targets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upload_target_results: Vec<TargetResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestInfo {
    pub osbuild_composer_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestExtraInfo {
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ManifestInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SbomDocExtraInfo {
    pub arch: String,
}

/// Payload of `extra.image` on an output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputExtraInfo {
    Image(ImageExtraInfo),
    Manifest(ManifestExtraInfo),
    SbomDoc(SbomDocExtraInfo),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOutputExtra {
    pub image: OutputExtraInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputType {
    Image,
    Log,
    #[serde(rename = "osbuild-manifest")]
    Manifest,
    SbomDoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    Md5,
    Adler32,
    Sha256,
}

/// One file imported into the build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOutput {
    pub buildroot_id: u64,
    pub filename: String,
    pub filesize: u64,
    /// `noarch` or a concrete architecture.
    pub arch: String,
    pub checksum_type: ChecksumType,
    pub checksum: String,
    #[serde(rename = "type")]
    pub kind: OutputType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Rpm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<BuildOutputExtra>,
}
