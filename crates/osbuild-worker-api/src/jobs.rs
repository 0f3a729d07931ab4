//! Argument and result schemas for every job kind.
//!
//! Field names follow the queue server's JSON. Every result type carries the
//! common `job_error` field and implements [`JobResultEnvelope`].

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::ClientError;
use crate::kind::JobKind;
use crate::manifest::PipelineNames;
use crate::osbuild::OsbuildResult;
use crate::target::Target;
use crate::target::TargetResult;

/// Access to the `job_error` field every result carries.
pub trait JobResultEnvelope {
    fn job_error(&self) -> Option<&ClientError>;
    fn set_job_error(&mut self, error: ClientError);
}

macro_rules! job_result {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl JobResultEnvelope for $ty {
                fn job_error(&self) -> Option<&ClientError> {
                    self.job_error.as_ref()
                }

                fn set_job_error(&mut self, error: ClientError) {
                    self.job_error = Some(error);
                }
            }
        )+
    };
}

/// The envelope alone, used to inspect a dependency result of any kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<ClientError>,
}

/// Repository definition passed through to the depsolver and image-builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub baseurls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metalink: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mirrorlist: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpgkeys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_gpg: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_ssl: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rhsm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_hotfixes: Option<bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata_expire: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_type_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub package_sets: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sslcacert: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sslclientkey: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sslclientcert: String,
    /// Fields this worker does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageSet {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub repositories: Vec<RepoConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepsolveJob {
    #[serde(default)]
    pub grouped_package_sets: BTreeMap<String, Vec<PackageSet>>,
    #[serde(default)]
    pub module_platform_id: String,
    pub arch: String,
    #[serde(default)]
    pub releasever: String,
    /// Ask the depsolver for one SBOM document per package set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sbom_type: Option<SbomType>,
}

/// SBOM standards the depsolver can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SbomType {
    Spdx,
}

impl SbomType {
    pub fn as_str(self) -> &'static str {
        match self {
            SbomType::Spdx => "spdx",
        }
    }

    /// Suffix of uploaded documents of this type.
    pub fn file_extension(self) -> &'static str {
        match self {
            SbomType::Spdx => "spdx.json",
        }
    }
}

/// An SBOM document of one depsolved package set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SbomDoc {
    #[serde(rename = "type")]
    pub doc_type: SbomType,
    pub document: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepsolveJobResult {
    /// Resolved packages per package-set name. Entries are passed through verbatim.
    #[serde(default)]
    pub package_specs: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub repo_configs: BTreeMap<String, Vec<RepoConfig>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub solver: String,
    /// SBOM documents per package-set name, when requested.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sbom_docs: BTreeMap<String, SbomDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<ClientError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchPackagesJob {
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
    #[serde(default)]
    pub module_platform_id: String,
    pub arch: String,
    #[serde(default)]
    pub releasever: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchPackagesJobResult {
    #[serde(default)]
    pub packages: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<ClientError>,
}

/// Arguments of `osbuild` and `bootc-image-builder` jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsbuildJob {
    /// Inline manifest. When absent the manifest comes from a dependency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Value>,
    /// Dependency index holding the manifest job result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_dyn_args_idx: Option<usize>,
    /// Dependency index holding the depsolve result whose SBOMs go to Koji.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depsolve_dyn_args_idx: Option<usize>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_names: Option<PipelineNames>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_boot_mode: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsbuildJobResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osbuild_output: Option<OsbuildResult>,
    #[serde(default)]
    pub target_results: Vec<TargetResult>,
    #[serde(default)]
    pub upload_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_names: Option<PipelineNames>,
    #[serde(default)]
    pub host_os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_boot_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osbuild_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<ClientError>,
}

impl OsbuildJobResult {
    /// Results of every target with the given name.
    pub fn target_results_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TargetResult> + 'a {
        self.target_results.iter().filter(move |r| r.name == name)
    }

    /// True when the engine ran and reported success.
    pub fn osbuild_succeeded(&self) -> bool {
        self.osbuild_output.as_ref().is_some_and(|o| o.success)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KojiInitJob {
    pub server: String,
    pub name: String,
    pub version: String,
    pub release: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KojiInitJobResult {
    #[serde(default)]
    pub build_id: u64,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub koji_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<ClientError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KojiFinalizeJob {
    pub server: String,
    pub name: String,
    pub version: String,
    pub release: String,
    /// Legacy list of uploaded image names.
    #[serde(default)]
    pub koji_filenames: Vec<String>,
    #[serde(default)]
    pub koji_directory: String,
    #[serde(default)]
    pub task_id: u64,
    #[serde(default)]
    pub start_time: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KojiFinalizeJobResult {
    #[serde(default)]
    pub koji_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<ClientError>,
}

/// Arguments of `manifest-id-only`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestJobById {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Value>,
    /// Kinds of the dependencies, in order. Defaults to a single depsolve job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_kinds: Option<Vec<JobKind>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub osbuild_composer_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_names: Option<PipelineNames>,
}

/// Result of every manifest-producing kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestJobByIdResult {
    #[serde(default, rename = "data", skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Value>,
    #[serde(default)]
    pub info: ManifestInfo,
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<ClientError>,
}

pub type BootcManifestJobResult = ManifestJobByIdResult;
pub type ImageBuilderManifestJobResult = ManifestJobByIdResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub source: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "tls-verify", skip_serializing_if = "Option::is_none")]
    pub tls_verify: Option<bool>,
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default, rename = "list-digest", skip_serializing_if = "String::is_empty")]
    pub list_digest: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerResolveJob {
    pub arch: String,
    #[serde(default)]
    pub specs: Vec<ContainerSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerResolveJobResult {
    #[serde(default)]
    pub specs: Vec<ContainerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<ClientError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileResolveJob {
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileResolveJobResultItem {
    pub url: String,
    #[serde(default, with = "base64_bytes")]
    pub content: Vec<u8>,
    #[serde(default, rename = "target_error", skip_serializing_if = "Option::is_none")]
    pub resolution_error: Option<ClientError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileResolveJobResult {
    pub success: bool,
    #[serde(default)]
    pub results: Vec<FileResolveJobResultItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<ClientError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OstreeResolveSpec {
    pub url: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub rhsm: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OstreeResolveJob {
    #[serde(default, rename = "ostree_resolve_specs")]
    pub specs: Vec<OstreeResolveSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OstreeResolveResultSpec {
    pub url: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub checksum: String,
    /// Older composers read the rhsm flag from this key.
    #[serde(default, rename = "bool")]
    pub rhsm: bool,
    #[serde(default)]
    pub secrets: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OstreeResolveJobResult {
    #[serde(default, rename = "ostree_resolve_result_specs")]
    pub specs: Vec<OstreeResolveResultSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<ClientError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsEc2CopyJob {
    pub ami: String,
    pub source_region: String,
    pub target_region: String,
    pub target_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsEc2CopyJobResult {
    #[serde(default)]
    pub ami: String,
    #[serde(default)]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<ClientError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsEc2ShareJob {
    #[serde(default)]
    pub ami: String,
    #[serde(default)]
    pub region: String,
    #[serde(default, rename = "shareWithAccounts")]
    pub share_with_accounts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsEc2ShareJobResult {
    #[serde(default)]
    pub ami: String,
    #[serde(default)]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<ClientError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootcManifestJob {
    #[serde(rename = "reference")]
    pub image_ref: String,
    #[serde(default, rename = "build_reference")]
    pub build_ref: String,
    pub arch: String,
    pub image_type: String,
    #[serde(default)]
    pub repositories: Vec<RepoConfig>,
    #[serde(default)]
    pub blueprint: Value,
}

/// Command-line inputs of `image-builder manifest`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageBuilderArgs {
    pub distro: String,
    pub arch: String,
    pub image_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<RepoConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageBuilderManifestJob {
    pub args: ImageBuilderArgs,
    /// `KEY=value` pairs added to the child environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_env: Vec<String>,
}

job_result!(
    DepsolveJobResult,
    SearchPackagesJobResult,
    OsbuildJobResult,
    KojiInitJobResult,
    KojiFinalizeJobResult,
    ManifestJobByIdResult,
    ContainerResolveJobResult,
    FileResolveJobResult,
    OstreeResolveJobResult,
    AwsEc2CopyJobResult,
    AwsEc2ShareJobResult,
    JobResult,
);

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = Option::<String>::deserialize(d)?.unwrap_or_default();
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_envelope_from_any_result() {
        let raw = r#"{"success": false, "upload_status": "failure", "job_error": {"id": 10, "reason": "osbuild build failed"}}"#;
        let envelope: JobResult = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.job_error.unwrap().code, ErrorCode::BUILD_JOB);
    }

    #[test]
    fn test_image_builder_args_use_pascal_case() {
        let raw = r#"{"Args": {"Distro": "centos-9", "Arch": "x86_64", "ImageType": "qcow2"}, "ExtraEnv": ["A=1"]}"#;
        let job: ImageBuilderManifestJob = serde_json::from_str(raw).unwrap();
        assert_eq!(job.args.distro, "centos-9");
        assert_eq!(job.args.image_type, "qcow2");
        assert_eq!(job.extra_env, vec!["A=1"]);
    }

    #[test]
    fn test_file_content_is_base64() {
        let item = FileResolveJobResultItem {
            url: "https://example.com/f".into(),
            content: b"hello".to_vec(),
            resolution_error: None,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["content"], "aGVsbG8=");
    }

    #[test]
    fn test_repo_config_keeps_unknown_fields() {
        let raw = r#"{"id": "baseos", "baseurls": ["https://example.org/baseos"], "priority": 10}"#;
        let repo: RepoConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(repo.extra["priority"], 10);
        let back = serde_json::to_value(&repo).unwrap();
        assert_eq!(back["priority"], 10);
        assert!(back.get("rhsm").is_none());
    }
}
