//! Upload targets attached to build jobs and the results recorded for them.

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ClientError;

pub const TARGET_WORKER_SERVER: &str = "org.osbuild.worker.server";
pub const TARGET_KOJI: &str = "org.osbuild.koji";
pub const TARGET_AWS: &str = "org.osbuild.aws";
pub const TARGET_AWS_S3: &str = "org.osbuild.aws.s3";
pub const TARGET_GENERIC_S3: &str = "org.osbuild.generic.s3";
pub const TARGET_CONTAINER: &str = "org.osbuild.container";
pub const TARGET_OCI: &str = "org.osbuild.oci";
pub const TARGET_OCI_OBJECT_STORAGE: &str = "org.osbuild.oci.objectstorage";

/// Which osbuild export a target consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsbuildArtifact {
    /// File name of the artifact inside the export directory.
    #[serde(default)]
    pub export_filename: String,
    /// Pipeline to export.
    #[serde(default)]
    pub export_name: String,
}

/// One upload destination of a build job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub image_name: String,
    #[serde(default)]
    pub osbuild_artifact: OsbuildArtifact,
    #[serde(default)]
    pub options: Value,
}

impl Target {
    /// Decode the options for this target's name.
    pub fn options<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        let options = if self.options.is_null() {
            Value::Object(Default::default())
        } else {
            self.options.clone()
        };
        serde_json::from_value(options)
    }
}

/// Outcome of uploading to one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetResult {
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_error: Option<ClientError>,
    /// Export the target uploaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osbuild_artifact: Option<OsbuildArtifact>,
}

impl TargetResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Value::Null,
            target_error: None,
            osbuild_artifact: None,
        }
    }

    /// Result for `target`, carrying its export.
    pub fn for_target(target: &Target) -> Self {
        Self {
            osbuild_artifact: Some(target.osbuild_artifact.clone()),
            ..Self::new(target.name.clone())
        }
    }

    /// Attach result options.
    pub fn with_options(mut self, options: impl Serialize) -> Self {
        self.options = serde_json::to_value(options).unwrap_or(Value::Null);
        self
    }

    /// Decode the result options.
    pub fn options<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.options.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerServerTargetResultOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_relative_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KojiTargetOptions {
    /// Tracking-service hub URL.
    pub server: String,
    /// Directory on the hub the image is uploaded into.
    pub upload_directory: String,
}

/// File uploaded to the tracking service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KojiOutputInfo {
    pub filename: String,
    pub checksum_type: String,
    pub checksum: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KojiTargetResultOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<KojiOutputInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<KojiOutputInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osbuild_manifest: Option<KojiOutputInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sbom_docs: Vec<KojiOutputInfo>,
}

/// Options shared by the AWS S3 and generic S3 targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3TargetOptions {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub ca_bundle: String,
    #[serde(default)]
    pub skip_ssl_verification: bool,
    #[serde(default)]
    pub public: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3TargetResultOptions {
    pub url: String,
}

/// Upload to S3 and import as an EC2 image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsTargetOptions {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    #[serde(default, rename = "shareWithAccounts")]
    pub share_with_accounts: Vec<String>,
    #[serde(default, rename = "bootMode", skip_serializing_if = "Option::is_none")]
    pub boot_mode: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsTargetResultOptions {
    pub ami: String,
    pub region: String,
}

/// Push an OCI archive to a container registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerTargetOptions {
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_verify: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerTargetResultOptions {
    pub url: String,
    pub digest: String,
}

/// Oracle Cloud credentials and storage location. Empty fields fall back to
/// the worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciTargetOptions {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub tenancy: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub compartment_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciTargetResultOptions {
    pub image_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciObjectStorageTargetResultOptions {
    pub url: String,
}
