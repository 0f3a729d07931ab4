//! AWS operations through the `aws` command-line client.

use std::path::Path;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::error;
use crate::error::Error;
use crate::error::Result;
use crate::process;
use crate::process::Invocation;

/// Lifetime of presigned object URLs, in seconds (one week).
pub const PRESIGN_EXPIRY_SECS: u64 = 604_800;

static ERROR_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"An error occurred \(([^)]+)\)").expect("error code pattern is valid"));

/// Extract the API error code from the CLI's diagnostics.
pub fn parse_error_code(stderr: &str) -> Option<String> {
    ERROR_CODE.captures(stderr).map(|c| c[1].to_string())
}

/// Boot mode requested for a registered image.
pub fn ec2_boot_mode(mode: &str) -> Option<&'static str> {
    match mode {
        "uefi" => Some("uefi"),
        "legacy" => Some("legacy-bios"),
        "hybrid" => Some("uefi-preferred"),
        _ => None,
    }
}

/// EC2 architecture name for a distribution architecture.
pub fn ec2_arch(arch: &str) -> &str {
    match arch {
        "aarch64" => "arm64",
        other => other,
    }
}

/// Invocation context for `aws`.
#[derive(Debug, Clone)]
pub struct AwsCli {
    program: String,
    region: Option<String>,
    credentials: Option<PathBuf>,
    endpoint: Option<String>,
    ca_bundle: Option<PathBuf>,
    no_verify_ssl: bool,
}

impl AwsCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            region: None,
            credentials: None,
            endpoint: None,
            ca_bundle: None,
            no_verify_ssl: false,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        let region = region.into();
        self.region = (!region.is_empty()).then_some(region);
        self
    }

    pub fn with_credentials(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials = Some(path.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = (!endpoint.is_empty()).then_some(endpoint);
        self
    }

    pub fn with_ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_bundle = Some(path.into());
        self
    }

    pub fn with_no_verify_ssl(mut self, skip: bool) -> Self {
        self.no_verify_ssl = skip;
        self
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    fn invocation(&self, service: &str, operation: &str, args: &[String]) -> Invocation {
        let mut invocation = Invocation::new(&self.program)
            .arg(service)
            .arg(operation)
            .args(args)
            .args(["--output", "json"]);
        if let Some(region) = &self.region {
            invocation = invocation.args(["--region", region.as_str()]);
        }
        if let Some(endpoint) = &self.endpoint {
            invocation = invocation.args(["--endpoint-url", endpoint.as_str()]);
        }
        if let Some(bundle) = &self.ca_bundle {
            invocation = invocation.arg("--ca-bundle").arg(bundle.as_os_str());
        }
        if self.no_verify_ssl {
            invocation = invocation.arg("--no-verify-ssl");
        }
        if let Some(credentials) = &self.credentials {
            invocation = invocation.env("AWS_SHARED_CREDENTIALS_FILE", credentials.to_string_lossy());
        }
        invocation
    }

    /// Run one operation and return its standard output.
    pub async fn run_raw(
        &self,
        service: &str,
        operation: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let invocation = self.invocation(service, operation, args);
        debug!(command = %invocation.display(), "aws");
        let output = process::run(&invocation, cancel).await?;
        if !output.success() {
            let message = output.stderr.trim().to_string();
            return Err(Error::Aws {
                operation: format!("{service} {operation}"),
                code: parse_error_code(&message),
                message,
            });
        }
        Ok(output.stdout_text())
    }

    /// Run one operation and decode its JSON output.
    pub async fn run_json<T: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<T> {
        let stdout = self.run_raw(service, operation, args, cancel).await?;
        serde_json::from_str(&stdout).context(error::DecodeOutputSnafu {
            what: format!("aws {service} {operation} output"),
        })
    }

    /// Upload a local file to `s3://bucket/key`.
    pub async fn s3_upload(&self, file: &Path, bucket: &str, key: &str, cancel: &CancellationToken) -> Result<()> {
        info!(bucket, key, "uploading to s3");
        let args = vec![file.to_string_lossy().into_owned(), format!("s3://{bucket}/{key}")];
        self.run_raw("s3", "cp", &args, cancel).await.map(|_| ())
    }

    pub async fn s3_make_public(&self, bucket: &str, key: &str, cancel: &CancellationToken) -> Result<()> {
        let args = strings(["--bucket", bucket, "--key", key, "--acl", "public-read"]);
        self.run_raw("s3api", "put-object-acl", &args, cancel).await.map(|_| ())
    }

    pub async fn s3_presign(&self, bucket: &str, key: &str, cancel: &CancellationToken) -> Result<String> {
        let args = vec![
            format!("s3://{bucket}/{key}"),
            "--expires-in".to_string(),
            PRESIGN_EXPIRY_SECS.to_string(),
        ];
        let url = self.run_raw("s3", "presign", &args, cancel).await?;
        Ok(url.trim().to_string())
    }

    pub async fn s3_delete(&self, bucket: &str, key: &str, cancel: &CancellationToken) -> Result<()> {
        let args = strings(["--bucket", bucket, "--key", key]);
        self.run_raw("s3api", "delete-object", &args, cancel).await.map(|_| ())
    }

    /// Public URL of an object.
    pub fn object_url(&self, bucket: &str, key: &str) -> String {
        match (&self.endpoint, &self.region) {
            (Some(endpoint), _) => format!("{}/{bucket}/{key}", endpoint.trim_end_matches('/')),
            (None, Some(region)) => format!("https://{bucket}.s3.{region}.amazonaws.com/{key}"),
            (None, None) => format!("https://{bucket}.s3.amazonaws.com/{key}"),
        }
    }

    /// Import an uploaded raw disk as an EBS snapshot and wait for it.
    pub async fn import_snapshot(&self, bucket: &str, key: &str, cancel: &CancellationToken) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Started {
            import_task_id: String,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Tasks {
            import_snapshot_tasks: Vec<Task>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Task {
            snapshot_task_detail: Detail,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Detail {
            #[serde(default)]
            snapshot_id: String,
        }

        let container = format!("Format=raw,UserBucket={{S3Bucket={bucket},S3Key={key}}}");
        let args = strings(["--disk-container", container.as_str(), "--description", key]);
        let started: Started = self.run_json("ec2", "import-snapshot", &args, cancel).await?;
        info!(task = %started.import_task_id, "waiting for snapshot import");

        let ids = strings(["--import-task-ids", started.import_task_id.as_str()]);
        self.run_raw("ec2", "wait", &prepend("snapshot-imported", &ids), cancel).await?;

        let tasks: Tasks = self.run_json("ec2", "describe-import-snapshot-tasks", &ids, cancel).await?;
        tasks
            .import_snapshot_tasks
            .into_iter()
            .map(|t| t.snapshot_task_detail.snapshot_id)
            .find(|id| !id.is_empty())
            .ok_or_else(|| Error::Aws {
                operation: "ec2 describe-import-snapshot-tasks".to_string(),
                code: None,
                message: format!("import task {} produced no snapshot", started.import_task_id),
            })
    }

    /// Register an AMI backed by `snapshot_id`.
    pub async fn register_image(
        &self,
        name: &str,
        snapshot_id: &str,
        arch: &str,
        boot_mode: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Registered {
            image_id: String,
        }

        let mapping = format!(
            "DeviceName=/dev/sda1,Ebs={{SnapshotId={snapshot_id},DeleteOnTermination=true,VolumeType=gp3}}"
        );
        let mut args = strings([
            "--name",
            name,
            "--architecture",
            ec2_arch(arch),
            "--virtualization-type",
            "hvm",
            "--root-device-name",
            "/dev/sda1",
            "--ena-support",
            "--block-device-mappings",
            mapping.as_str(),
        ]);
        if let Some(mode) = boot_mode.and_then(ec2_boot_mode) {
            args.extend(strings(["--boot-mode", mode]));
        }
        let registered: Registered = self.run_json("ec2", "register-image", &args, cancel).await?;
        info!(ami = %registered.image_id, "registered image");
        Ok(registered.image_id)
    }

    /// Snapshots backing an AMI.
    pub async fn image_snapshots(&self, ami: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Images {
            images: Vec<Image>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Image {
            #[serde(default)]
            block_device_mappings: Vec<Mapping>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Mapping {
            #[serde(default)]
            ebs: Option<Ebs>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Ebs {
            #[serde(default)]
            snapshot_id: String,
        }

        let images: Images = self.run_json("ec2", "describe-images", &strings(["--image-ids", ami]), cancel).await?;
        Ok(images
            .images
            .into_iter()
            .flat_map(|i| i.block_device_mappings)
            .filter_map(|m| m.ebs.map(|e| e.snapshot_id))
            .filter(|id| !id.is_empty())
            .collect())
    }

    /// Grant launch permission on an AMI and create-volume permission on its snapshots.
    pub async fn share_image(&self, ami: &str, accounts: &[String], cancel: &CancellationToken) -> Result<()> {
        if accounts.is_empty() {
            return Ok(());
        }
        let snapshots = self.image_snapshots(ami, cancel).await?;

        let users: Vec<String> = accounts.iter().map(|a| format!("{{UserId={a}}}")).collect();
        let permission = format!("Add=[{}]", users.join(","));
        let args = strings(["--image-id", ami, "--launch-permission", permission.as_str()]);
        self.run_raw("ec2", "modify-image-attribute", &args, cancel).await?;

        for snapshot in &snapshots {
            let mut args = strings([
                "--snapshot-id",
                snapshot.as_str(),
                "--attribute",
                "createVolumePermission",
                "--operation-type",
                "add",
                "--user-ids",
            ]);
            args.extend(accounts.iter().cloned());
            self.run_raw("ec2", "modify-snapshot-attribute", &args, cancel).await?;
        }
        info!(ami, accounts = accounts.len(), snapshots = snapshots.len(), "shared image");
        Ok(())
    }

    /// Copy an AMI into this client's region and wait until it is available.
    pub async fn copy_image(
        &self,
        name: &str,
        ami: &str,
        source_region: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Copied {
            image_id: String,
        }

        let args = strings(["--name", name, "--source-image-id", ami, "--source-region", source_region]);
        let copied: Copied = self.run_json("ec2", "copy-image", &args, cancel).await?;
        info!(source = ami, copy = %copied.image_id, "waiting for image copy");
        let wait = prepend("image-available", &strings(["--image-ids", copied.image_id.as_str()]));
        self.run_raw("ec2", "wait", &wait, cancel).await?;
        Ok(copied.image_id)
    }
}

pub(crate) fn strings<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    items.into_iter().map(str::to_string).collect()
}

fn prepend(first: &str, rest: &[String]) -> Vec<String> {
    std::iter::once(first.to_string()).chain(rest.iter().cloned()).collect()
}
