//! Upload targets of a finished build.
//!
//! Each target is independent: a failure is recorded as the target's
//! `target_error` and the next target is still attempted.

use std::path::Path;
use std::path::PathBuf;

use osbuild_worker_api::ClientError;
use osbuild_worker_api::ErrorCode;
use osbuild_worker_api::PipelineNames;
use osbuild_worker_api::jobs::DepsolveJobResult;
use osbuild_worker_api::jobs::OsbuildJob;
use osbuild_worker_api::osbuild::OsbuildResult;
use osbuild_worker_api::target;
use osbuild_worker_api::target::AwsTargetOptions;
use osbuild_worker_api::target::AwsTargetResultOptions;
use osbuild_worker_api::target::ContainerTargetOptions;
use osbuild_worker_api::target::ContainerTargetResultOptions;
use osbuild_worker_api::target::KojiOutputInfo;
use osbuild_worker_api::target::KojiTargetOptions;
use osbuild_worker_api::target::KojiTargetResultOptions;
use osbuild_worker_api::target::OciObjectStorageTargetResultOptions;
use osbuild_worker_api::target::OciTargetOptions;
use osbuild_worker_api::target::OciTargetResultOptions;
use osbuild_worker_api::target::S3TargetOptions;
use osbuild_worker_api::target::S3TargetResultOptions;
use osbuild_worker_api::target::Target;
use osbuild_worker_api::target::TargetResult;
use osbuild_worker_api::target::WorkerServerTargetResultOptions;
use osbuild_worker_koji::Session;
use osbuild_worker_koji::Uploaded;
use serde_json::Value;
use tracing::info;
use tracing::warn;

use crate::cloud::AwsCli;
use crate::cloud::OciCli;
use crate::cloud::RegistryPush;
use crate::cloud::container;
use crate::cloud::container::Destination;
use crate::cloud::oci::ObjectLocation;
use crate::cloud::oci::OciCredentials;
use crate::config::WorkerConfig;
use crate::env::WorkerEnv;
use crate::handler::JobContext;
use crate::koji;

/// Everything the targets read from the finished build.
pub(super) struct Uploader<'a> {
    pub env: &'a WorkerEnv,
    pub ctx: &'a JobContext,
    pub args: &'a OsbuildJob,
    pub output_dir: &'a Path,
    pub manifest: &'a Value,
    pub osbuild_output: &'a OsbuildResult,
}

impl Uploader<'_> {
    /// Handle one target. `Err` is a job-level error that stops target processing.
    pub async fn upload(&self, target: &Target) -> Result<TargetResult, ClientError> {
        info!(target = %target.name, image = %target.image_name, "handling upload target");
        let result = match target.name.as_str() {
            target::TARGET_WORKER_SERVER => self.worker_server(target).await,
            target::TARGET_KOJI => self.koji(target).await,
            target::TARGET_AWS => self.aws(target).await,
            target::TARGET_AWS_S3 | target::TARGET_GENERIC_S3 => self.s3(target).await,
            target::TARGET_CONTAINER => self.container(target).await,
            target::TARGET_OCI => self.oci(target, OciPublish::Image).await,
            target::TARGET_OCI_OBJECT_STORAGE => self.oci(target, OciPublish::PreauthUrl).await,
            other => {
                return Err(ClientError::new(
                    ErrorCode::INVALID_TARGET,
                    format!("invalid target type: {other}"),
                ));
            }
        };
        match &result.target_error {
            None => info!(target = %target.name, "target succeeded"),
            Some(err) => warn!(target = %target.name, code = err.code.0, reason = %err.reason, "target failed"),
        }
        Ok(result)
    }

    fn artifact_path(&self, target: &Target) -> PathBuf {
        self.output_dir
            .join(&target.osbuild_artifact.export_name)
            .join(&target.osbuild_artifact.export_filename)
    }

    async fn worker_server(&self, target: &Target) -> TargetResult {
        let mut result = TargetResult::for_target(target).with_options(WorkerServerTargetResultOptions {
            artifact_relative_path: Some(target.osbuild_artifact.export_filename.clone()),
        });
        let path = self.artifact_path(target);
        if let Err(e) = tokio::fs::metadata(&path).await {
            result.target_error = Some(ClientError::new(
                ErrorCode::INVALID_TARGET_CONFIG,
                format!("open {}: {e}", path.display()),
            ));
            return result;
        }
        if let Err(e) = self.ctx.job().upload_artifact(&target.image_name, &path).await {
            result.target_error = Some(ClientError::new(ErrorCode::UPLOADING_IMAGE, e.to_string()));
        }
        result
    }

    async fn koji(&self, target: &Target) -> TargetResult {
        let mut result = TargetResult::for_target(target);
        let options: KojiTargetOptions = match target.options() {
            Ok(options) => options,
            Err(e) => {
                result.target_error = Some(ClientError::new(ErrorCode::INVALID_TARGET_CONFIG, e.to_string()));
                return result;
            }
        };

        let session = match koji::login(&self.env.config, &options.server).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "koji login failed");
                result.target_error = Some(ClientError::new(ErrorCode::INVALID_TARGET_CONFIG, e.to_string()));
                return result;
            }
        };
        let uploaded = self.koji_upload(&session, target, &options.upload_directory).await;
        if let Err(e) = session.logout().await {
            warn!(error = %e, "koji logout failed");
        }

        match uploaded {
            Ok(outputs) => result.with_options(outputs),
            Err(err) => {
                result.target_error = Some(err);
                result
            }
        }
    }

    async fn koji_upload(
        &self,
        session: &Session,
        target: &Target,
        directory: &str,
    ) -> Result<KojiTargetResultOptions, ClientError> {
        let upload_failed = |e: osbuild_worker_koji::Error| ClientError::new(ErrorCode::UPLOADING_IMAGE, e.to_string());

        let path = self.artifact_path(target);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            ClientError::new(
                ErrorCode::KOJI_BUILD,
                format!("failed to open the image for reading: {e}"),
            )
        })?;
        let image = session.upload(file, directory, &target.image_name).await.map_err(upload_failed)?;
        info!(filename = %target.image_name, size = image.size, "image uploaded to koji");

        let manifest = serde_json::to_vec_pretty(self.manifest)
            .map_err(|e| ClientError::new(ErrorCode::KOJI_BUILD, e.to_string()))?;
        let manifest_name = format!("{}.manifest.json", target.image_name);
        let manifest_upload = session
            .upload(manifest.as_slice(), directory, &manifest_name)
            .await
            .map_err(upload_failed)?;

        let mut log = Vec::new();
        self.osbuild_output
            .write_text(&mut log)
            .map_err(|e| ClientError::new(ErrorCode::KOJI_BUILD, e.to_string()))?;
        let log_name = format!("{}.osbuild.log", target.image_name);
        let log_upload = session.upload(log.as_slice(), directory, &log_name).await.map_err(upload_failed)?;

        let sbom_docs = self.koji_sbom_upload(session, target, directory).await?;

        Ok(KojiTargetResultOptions {
            image: Some(output_info(&target.image_name, image)),
            log: Some(output_info(&log_name, log_upload)),
            osbuild_manifest: Some(output_info(&manifest_name, manifest_upload)),
            sbom_docs,
        })
    }

    /// Upload the SBOM documents of the depsolve dependency, if the job names one.
    async fn koji_sbom_upload(
        &self,
        session: &Session,
        target: &Target,
        directory: &str,
    ) -> Result<Vec<KojiOutputInfo>, ClientError> {
        let Some(index) = self.args.depsolve_dyn_args_idx else {
            return Ok(Vec::new());
        };
        if index >= self.ctx.job().num_dependencies() {
            return Err(ClientError::new(
                ErrorCode::PARSING_DYNAMIC_ARGS,
                "DepsolveDynArgsIdx is out of range of the number of dynamic job arguments",
            ));
        }
        let depsolved: DepsolveJobResult = self
            .ctx
            .dependency(index, "Error parsing DepsolveJobResult from dynamic args")
            .await?;

        let mut uploaded = Vec::with_capacity(depsolved.sbom_docs.len());
        for (pipeline, doc) in &depsolved.sbom_docs {
            let purpose = pipeline_purpose(self.args.pipeline_names.as_ref(), pipeline);
            let filename = format!(
                "{}.{purpose}-{pipeline}.{}",
                target.image_name,
                doc.doc_type.file_extension()
            );
            let document = serde_json::to_vec(&doc.document)
                .map_err(|e| ClientError::new(ErrorCode::KOJI_BUILD, e.to_string()))?;
            let sbom = session
                .upload(document.as_slice(), directory, &filename)
                .await
                .map_err(|e| ClientError::new(ErrorCode::UPLOADING_IMAGE, e.to_string()))?;
            info!(%filename, size = sbom.size, "sbom document uploaded to koji");
            uploaded.push(output_info(&filename, sbom));
        }
        Ok(uploaded)
    }

    async fn s3(&self, target: &Target) -> TargetResult {
        let mut result = TargetResult::for_target(target);
        let options: S3TargetOptions = match target.options() {
            Ok(options) => options,
            Err(e) => {
                result.target_error = Some(ClientError::new(ErrorCode::INVALID_TARGET_CONFIG, e.to_string()));
                return result;
            }
        };
        let (cli, bucket) = match s3_client(self.env, &options) {
            Ok(found) => found,
            Err(reason) => {
                result.target_error = Some(ClientError::new(ErrorCode::INVALID_CONFIG, reason));
                return result;
            }
        };
        if options.key.is_empty() {
            result.target_error = Some(ClientError::new(
                ErrorCode::INVALID_TARGET_CONFIG,
                "No AWS object key provided",
            ));
            return result;
        }

        let key = format!("{}-{}", options.key, target.osbuild_artifact.export_filename);
        let cancel = self.ctx.canceled();
        if let Err(e) = cli.s3_upload(&self.artifact_path(target), &bucket, &key, cancel).await {
            result.target_error = Some(ClientError::new(ErrorCode::UPLOADING_IMAGE, e.to_string()));
            return result;
        }

        let url = if options.public {
            if let Err(e) = cli.s3_make_public(&bucket, &key, cancel).await {
                result.target_error = Some(ClientError::new(ErrorCode::UPLOADING_IMAGE, e.to_string()));
                return result;
            }
            cli.object_url(&bucket, &key)
        } else {
            match cli.s3_presign(&bucket, &key, cancel).await {
                Ok(url) => url,
                Err(e) => {
                    result.target_error = Some(ClientError::new(ErrorCode::GENERATING_SIGNED_URL, e.to_string()));
                    return result;
                }
            }
        };
        result.with_options(S3TargetResultOptions { url })
    }

    async fn aws(&self, target: &Target) -> TargetResult {
        let mut result = TargetResult::for_target(target);
        let options: AwsTargetOptions = match target.options() {
            Ok(options) => options,
            Err(e) => {
                result.target_error = Some(ClientError::new(ErrorCode::INVALID_TARGET_CONFIG, e.to_string()));
                return result;
            }
        };
        if options.key.is_empty() {
            result.target_error = Some(ClientError::new(
                ErrorCode::INVALID_TARGET_CONFIG,
                "No AWS object key provided",
            ));
            return result;
        }
        let bucket = match (options.bucket.as_str(), self.env.config.aws_bucket()) {
            ("", Some(bucket)) => bucket.to_string(),
            ("", None) => {
                result.target_error = Some(ClientError::new(
                    ErrorCode::INVALID_TARGET_CONFIG,
                    "No AWS bucket provided",
                ));
                return result;
            }
            (bucket, _) => bucket.to_string(),
        };

        let cli = self.env.aws().with_region(options.region.clone());
        let cancel = self.ctx.canceled();
        if let Err(e) = cli.s3_upload(&self.artifact_path(target), &bucket, &options.key, cancel).await {
            result.target_error = Some(ClientError::new(ErrorCode::UPLOADING_IMAGE, e.to_string()));
            return result;
        }

        let registered = async {
            let snapshot = cli.import_snapshot(&bucket, &options.key, cancel).await?;
            if let Err(e) = cli.s3_delete(&bucket, &options.key, cancel).await {
                warn!(%bucket, key = %options.key, error = %e, "failed to delete imported object");
            }
            let ami = cli
                .register_image(&target.image_name, &snapshot, &self.env.arch, options.boot_mode.as_deref(), cancel)
                .await?;
            cli.share_image(&ami, &options.share_with_accounts, cancel).await?;
            Ok::<_, crate::error::Error>(ami)
        }
        .await;

        match registered {
            Ok(ami) => result.with_options(AwsTargetResultOptions {
                ami,
                region: options.region,
            }),
            Err(e) => {
                result.target_error = Some(ClientError::new(ErrorCode::IMPORTING_IMAGE, e.to_string()));
                result
            }
        }
    }

    async fn container(&self, target: &Target) -> TargetResult {
        let mut result = TargetResult::for_target(target);
        let options: ContainerTargetOptions = match target.options() {
            Ok(options) => options,
            Err(e) => {
                result.target_error = Some(ClientError::new(ErrorCode::INVALID_TARGET_CONFIG, e.to_string()));
                return result;
            }
        };
        let image_name = if target.image_name.is_empty() {
            options.reference.as_str()
        } else {
            target.image_name.as_str()
        };
        let (push, destination) = match container_push(self.env, image_name, &options) {
            Ok(found) => found,
            Err(e) => {
                result.target_error = Some(ClientError::new(ErrorCode::INVALID_CONFIG, e.to_string()));
                return result;
            }
        };

        let archive = self.artifact_path(target);
        match push.push(&archive, &destination, self.ctx.canceled()).await {
            Ok(digest) => {
                info!(destination = %destination.reference, %digest, "container image pushed");
                result.with_options(ContainerTargetResultOptions {
                    url: destination.reference,
                    digest,
                })
            }
            Err(e) => {
                result.target_error = Some(ClientError::new(ErrorCode::UPLOADING_IMAGE, e.to_string()));
                result
            }
        }
    }

    /// Upload to object storage, then publish the object as `publish` says.
    async fn oci(&self, target: &Target, publish: OciPublish) -> TargetResult {
        let mut result = TargetResult::for_target(target);
        let options: OciTargetOptions = match target.options() {
            Ok(options) => options,
            Err(e) => {
                result.target_error = Some(ClientError::new(ErrorCode::INVALID_TARGET_CONFIG, e.to_string()));
                return result;
            }
        };
        let scratch = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                result.target_error = Some(ClientError::new(ErrorCode::INVALID_CONFIG, e.to_string()));
                return result;
            }
        };
        let (cli, defaults) = match oci_client(self.env, &options, scratch.path()) {
            Ok(found) => found,
            Err(reason) => {
                result.target_error = Some(ClientError::new(ErrorCode::INVALID_CONFIG, reason));
                return result;
            }
        };

        let name = format!("osbuild-upload-{}", uuid::Uuid::new_v4());
        let object = ObjectLocation {
            bucket: or_default(&options.bucket, &defaults.bucket),
            namespace: or_default(&options.namespace, &defaults.namespace),
            name: &name,
        };
        let cancel = self.ctx.canceled();
        if let Err(e) = cli
            .put_object(&self.artifact_path(target), object.bucket, object.namespace, object.name, cancel)
            .await
        {
            result.target_error = Some(ClientError::new(ErrorCode::UPLOADING_IMAGE, e.to_string()));
            return result;
        }

        match publish {
            OciPublish::Image => {
                let compartment = or_default(&options.compartment_id, &defaults.compartment);
                match cli.import_image(&object, compartment, &target.image_name, cancel).await {
                    Ok(image_id) => result.with_options(OciTargetResultOptions { image_id }),
                    Err(e) => {
                        result.target_error = Some(ClientError::new(ErrorCode::UPLOADING_IMAGE, e.to_string()));
                        result
                    }
                }
            }
            OciPublish::PreauthUrl => match cli.preauth_url(&object, cancel).await {
                Ok(url) => result.with_options(OciObjectStorageTargetResultOptions { url }),
                Err(e) => {
                    result.target_error = Some(ClientError::new(ErrorCode::GENERATING_SIGNED_URL, e.to_string()));
                    result
                }
            },
        }
    }
}

/// What an OCI target does with the uploaded object.
#[derive(Debug, Clone, Copy)]
enum OciPublish {
    /// Import it as a compute image.
    Image,
    /// Share it through a pre-authenticated URL.
    PreauthUrl,
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() { default } else { value }
}

/// Qualify the destination and pick the registry credentials.
///
/// References completed from `[containers]` use its certificates and TLS
/// setting; fully qualified references use the target's credentials.
fn container_push(
    env: &WorkerEnv,
    image_name: &str,
    options: &ContainerTargetOptions,
) -> crate::error::Result<(RegistryPush, Destination)> {
    let defaults = env.config.containers.clone().unwrap_or_default();
    let (reference, applied) = container::apply_default_domain_path(image_name, &defaults.domain, &defaults.path_prefix);
    let destination = container::normalize_reference(&reference)?;

    let mut push = RegistryPush::new(&env.tools.skopeo);
    if let Some(auth_file) = &defaults.auth_file_path {
        push = push.with_auth_file(auth_file);
    }
    if applied {
        if let Some(cert_dir) = &defaults.cert_path {
            push = push.with_cert_dir(cert_dir);
        }
        push = push.with_tls_verify(defaults.tls_verify);
    } else {
        if !options.username.is_empty() || !options.password.is_empty() {
            push = push.with_credentials(options.username.clone(), options.password.clone());
        }
        push = push.with_tls_verify(options.tls_verify.unwrap_or(true));
    }
    Ok((push, destination))
}

/// Storage defaults of `[oci]` after target overrides.
#[derive(Debug, Default)]
struct OciDefaults {
    bucket: String,
    namespace: String,
    compartment: String,
}

/// CLI for an OCI target: a profile written from the target's key material
/// when it is complete, the configured credentials file otherwise.
fn oci_client(env: &WorkerEnv, options: &OciTargetOptions, scratch: &Path) -> Result<(OciCli, OciDefaults), String> {
    let config = env.config.oci.clone().unwrap_or_default();
    let defaults = OciDefaults {
        bucket: config.bucket,
        namespace: config.namespace,
        compartment: config.compartment,
    };
    let cli = OciCli::new(&env.tools.oci).with_region(options.region.clone());
    let credentials = OciCredentials {
        user: options.user.clone(),
        tenancy: options.tenancy.clone(),
        region: options.region.clone(),
        fingerprint: options.fingerprint.clone(),
        private_key: options.private_key.clone(),
    };
    if credentials.is_complete() {
        let path = credentials.write_config(scratch).map_err(|e| e.to_string())?;
        return Ok((cli.with_config_file(path), defaults));
    }
    match config.credentials {
        Some(path) => Ok((cli.with_config_file(path), defaults)),
        None => Err("no OCI credentials provided".to_string()),
    }
}

/// `buildroot` for build pipelines, `image` for payload pipelines.
pub(super) fn pipeline_purpose(names: Option<&PipelineNames>, pipeline: &str) -> &'static str {
    let Some(names) = names else {
        return "";
    };
    if names.build.iter().any(|name| name == pipeline) {
        "buildroot"
    } else if names.payload.iter().any(|name| name == pipeline) {
        "image"
    } else {
        ""
    }
}

fn output_info(filename: &str, uploaded: Uploaded) -> KojiOutputInfo {
    KojiOutputInfo {
        filename: filename.to_string(),
        checksum_type: "md5".to_string(),
        checksum: uploaded.md5,
        size: uploaded.size,
    }
}

fn aws_cli(env: &WorkerEnv, credentials: Option<&Path>) -> AwsCli {
    let cli = AwsCli::new(&env.tools.aws);
    match credentials {
        Some(path) => cli.with_credentials(path),
        None => cli,
    }
}

/// Pick the S3 endpoint for a target and the bucket to upload into.
///
/// - region only: AWS itself, bucket defaulting to `[aws] bucket`
/// - endpoint and region: a generic S3 server named by the target
/// - neither: the generic S3 server of `[generic_s3]`
fn s3_client(env: &WorkerEnv, options: &S3TargetOptions) -> Result<(AwsCli, String), String> {
    let config: &WorkerConfig = &env.config;
    match (options.endpoint.is_empty(), options.region.is_empty()) {
        (true, false) => {
            let bucket = match (options.bucket.as_str(), config.aws_bucket()) {
                ("", Some(bucket)) => bucket.to_string(),
                ("", None) => return Err("No AWS bucket provided".to_string()),
                (bucket, _) => bucket.to_string(),
            };
            Ok((env.aws().with_region(options.region.clone()), bucket))
        }
        (false, false) => {
            let credentials = config
                .generic_s3
                .as_ref()
                .and_then(|s3| s3.credentials.as_deref())
                .ok_or_else(|| "no credentials found".to_string())?;
            let mut cli = aws_cli(env, Some(credentials))
                .with_region(options.region.clone())
                .with_endpoint(options.endpoint.clone())
                .with_no_verify_ssl(options.skip_ssl_verification);
            if !options.ca_bundle.is_empty() {
                cli = cli.with_ca_bundle(&options.ca_bundle);
            }
            Ok((cli, options.bucket.clone()))
        }
        (true, true) => {
            let s3 = config
                .generic_s3
                .as_ref()
                .ok_or_else(|| "no default endpoint for S3 was set".to_string())?;
            if s3.endpoint.is_empty() {
                return Err("no default endpoint for S3 was set".to_string());
            }
            if s3.region.is_empty() {
                return Err("no default region for S3 was set".to_string());
            }
            if s3.bucket.is_empty() {
                return Err("no default bucket for S3 was set".to_string());
            }
            let credentials = s3
                .credentials
                .as_deref()
                .ok_or_else(|| "no default credentials for S3 was set".to_string())?;
            let mut cli = aws_cli(env, Some(credentials))
                .with_region(s3.region.clone())
                .with_endpoint(s3.endpoint.clone())
                .with_no_verify_ssl(s3.skip_ssl_verification);
            if let Some(bundle) = &s3.ca_bundle {
                cli = cli.with_ca_bundle(bundle);
            }
            Ok((cli, s3.bucket.clone()))
        }
        (false, true) => Err("s3 server configuration is incomplete".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AwsConfig;
    use crate::config::ContainersConfig;
    use crate::config::GenericS3Config;
    use crate::config::OciConfig;
    use crate::env::CachePaths;

    fn env(config: WorkerConfig) -> WorkerEnv {
        WorkerEnv::new(config, CachePaths::new("/var/cache/osbuild-worker"))
    }

    #[test]
    fn test_pipeline_purpose() {
        let names = PipelineNames {
            build: vec!["build".into()],
            payload: vec!["os".into(), "image".into()],
        };
        assert_eq!(pipeline_purpose(Some(&names), "build"), "buildroot");
        assert_eq!(pipeline_purpose(Some(&names), "os"), "image");
        assert_eq!(pipeline_purpose(Some(&names), "qcow2"), "");
        assert_eq!(pipeline_purpose(None, "os"), "");
    }

    #[test]
    fn test_s3_on_aws_uses_default_bucket() {
        let mut config = WorkerConfig::default();
        config.aws = Some(AwsConfig {
            credentials: None,
            bucket: Some("images".into()),
        });
        let options = S3TargetOptions {
            region: "eu-west-1".into(),
            ..Default::default()
        };
        let (cli, bucket) = s3_client(&env(config), &options).unwrap();
        assert_eq!(bucket, "images");
        assert_eq!(cli.region(), Some("eu-west-1"));

        let err = s3_client(&env(WorkerConfig::default()), &options).unwrap_err();
        assert_eq!(err, "No AWS bucket provided");
    }

    #[test]
    fn test_generic_s3_from_config() {
        let mut config = WorkerConfig::default();
        config.generic_s3 = Some(GenericS3Config {
            credentials: Some("/etc/osbuild-worker/s3-creds".into()),
            endpoint: "https://minio.example:9000".into(),
            region: "us-east-1".into(),
            bucket: "ci".into(),
            ..Default::default()
        });
        let (cli, bucket) = s3_client(&env(config), &S3TargetOptions::default()).unwrap();
        assert_eq!(bucket, "ci");
        assert_eq!(cli.object_url("ci", "k"), "https://minio.example:9000/ci/k");
    }

    #[test]
    fn test_generic_s3_config_gaps() {
        let mut config = WorkerConfig::default();
        config.generic_s3 = Some(GenericS3Config {
            endpoint: "https://minio.example:9000".into(),
            region: "us-east-1".into(),
            ..Default::default()
        });
        let err = s3_client(&env(config), &S3TargetOptions::default()).unwrap_err();
        assert_eq!(err, "no default bucket for S3 was set");

        let options = S3TargetOptions {
            endpoint: "https://minio.example:9000".into(),
            ..Default::default()
        };
        let err = s3_client(&env(WorkerConfig::default()), &options).unwrap_err();
        assert_eq!(err, "s3 server configuration is incomplete");
    }

    #[test]
    fn test_container_push_completes_bare_references() {
        let mut config = WorkerConfig::default();
        config.containers = Some(ContainersConfig {
            domain: "registry.example.com".into(),
            path_prefix: "builds".into(),
            ..Default::default()
        });
        let options = ContainerTargetOptions {
            username: "ignored".into(),
            password: "ignored".into(),
            ..Default::default()
        };
        let env = env(config);
        let (_, destination) = container_push(&env, "fedora-bootc:40", &options).unwrap();
        assert_eq!(destination.reference, "registry.example.com/builds/fedora-bootc:40");

        let (_, destination) = container_push(&env, "quay.io/team/app", &options).unwrap();
        assert_eq!(destination.domain, "quay.io");
        assert_eq!(destination.reference, "quay.io/team/app:latest");

        let err = container_push(&env, "quay.io/Team/App", &options).unwrap_err();
        assert!(err.to_string().contains("quay.io/Team/App"));
    }

    #[test]
    fn test_oci_client_credentials() {
        let scratch = tempfile::tempdir().unwrap();
        let err = oci_client(&env(WorkerConfig::default()), &OciTargetOptions::default(), scratch.path()).unwrap_err();
        assert_eq!(err, "no OCI credentials provided");

        let mut config = WorkerConfig::default();
        config.oci = Some(OciConfig {
            credentials: Some("/etc/osbuild-worker/oci-config".into()),
            bucket: "images".into(),
            namespace: "ns".into(),
            compartment: "ocid1.compartment.oc1..c".into(),
        });
        let (_, defaults) = oci_client(&env(config.clone()), &OciTargetOptions::default(), scratch.path()).unwrap();
        assert_eq!(defaults.bucket, "images");
        assert!(!scratch.path().join("config").exists());

        let options = OciTargetOptions {
            user: "ocid1.user.oc1..u".into(),
            tenancy: "ocid1.tenancy.oc1..t".into(),
            region: "eu-frankfurt-1".into(),
            fingerprint: "aa:bb".into(),
            private_key: "key".into(),
            ..Default::default()
        };
        oci_client(&env(config), &options, scratch.path()).unwrap();
        assert!(scratch.path().join("config").exists());
        assert_eq!(or_default("", "images"), "images");
        assert_eq!(or_default("mine", "images"), "mine");
    }
}
