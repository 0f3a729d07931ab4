//! `koji-finalize`: import the images of a finished compose into Koji.
//!
//! Dependency 0 is the paired `koji-init` result, dependencies 1.. are the
//! build results. If anything upstream failed the reserved build is moved to
//! FAILED instead. Files were already uploaded by the builds' koji targets,
//! so finalization only posts metadata.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use osbuild_worker_api::ClientError;
use osbuild_worker_api::ErrorCode;
use osbuild_worker_api::jobs::KojiFinalizeJob;
use osbuild_worker_api::jobs::KojiFinalizeJobResult;
use osbuild_worker_api::jobs::KojiInitJobResult;
use osbuild_worker_api::jobs::OsbuildJobResult;
use osbuild_worker_api::target::KojiOutputInfo;
use osbuild_worker_api::target::KojiTargetResultOptions;
use osbuild_worker_api::target::TARGET_KOJI;
use osbuild_worker_koji::Metadata;
use osbuild_worker_koji::metadata::Build;
use osbuild_worker_koji::metadata::BuildExtra;
use osbuild_worker_koji::metadata::BuildOutput;
use osbuild_worker_koji::metadata::BuildOutputExtra;
use osbuild_worker_koji::metadata::BuildRoot;
use osbuild_worker_koji::metadata::ChecksumType;
use osbuild_worker_koji::metadata::ImageExtraInfo;
use osbuild_worker_koji::metadata::ManifestExtraInfo;
use osbuild_worker_koji::metadata::ManifestInfo;
use osbuild_worker_koji::metadata::OutputExtraInfo;
use osbuild_worker_koji::metadata::OutputType;
use osbuild_worker_koji::metadata::SbomDocExtraInfo;
use osbuild_worker_koji::metadata::TypeInfoBuild;
use osbuild_worker_koji::rpm;
use tracing::info;
use tracing::warn;

use crate::env::WorkerEnv;
use crate::handler::JobContext;
use crate::handler::TypedHandler;
use crate::koji;

/// Version recorded in the manifest outputs' extra info.
pub const COMPOSER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct KojiFinalizeHandler {
    env: Arc<WorkerEnv>,
}

impl KojiFinalizeHandler {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env }
    }

    /// Move the reserved build to FAILED. Errors land in `koji_error`.
    async fn fail_build(&self, server: &str, init: &KojiInitJobResult, result: &mut KojiFinalizeJobResult) {
        if init.token.is_empty() {
            return;
        }
        let session = match koji::login(&self.env.config, server).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "cannot fail koji build");
                result.koji_error = e.to_string();
                return;
            }
        };
        match session.cg_fail_build(init.build_id, &init.token).await {
            Ok(()) => info!(build_id = init.build_id, "koji build marked as failed"),
            Err(e) => {
                warn!(build_id = init.build_id, error = %e, "failed to fail koji build");
                result.koji_error = e.to_string();
            }
        }
        if let Err(e) = session.logout().await {
            warn!(error = %e, "koji logout failed");
        }
    }

    async fn import(
        &self,
        args: &KojiFinalizeJob,
        metadata: &Metadata,
        token: &str,
        result: &mut KojiFinalizeJobResult,
    ) -> Result<(), ClientError> {
        let session = koji::login(&self.env.config, &args.server).await.map_err(|e| {
            result.koji_error = e.to_string();
            ClientError::new(ErrorCode::KOJI_FINALIZE, e.to_string())
        })?;
        let imported = session.cg_import(metadata, &args.koji_directory, token).await;
        if let Err(e) = session.logout().await {
            warn!(error = %e, "koji logout failed");
        }
        imported.map_err(|e| {
            let reason = format!("Could not import build into koji: {e}");
            result.koji_error = reason.clone();
            ClientError::new(ErrorCode::KOJI_FINALIZE, reason)
        })?;
        Ok(())
    }
}

#[async_trait]
impl TypedHandler for KojiFinalizeHandler {
    type Output = KojiFinalizeJobResult;

    async fn execute(&self, ctx: &JobContext, result: &mut KojiFinalizeJobResult) -> Result<(), ClientError> {
        let args: KojiFinalizeJob = ctx.args()?;
        let init: KojiInitJobResult = ctx.dependency(0, "Error parsing dynamic args as koji-init job").await?;

        let mut failed = init.job_error.is_some() || !init.koji_error.is_empty();
        let mut builds = Vec::new();
        for i in 1..ctx.job().num_dependencies() {
            let build: OsbuildJobResult = ctx.dependency(i, "Error parsing dynamic args as osbuild job").await?;
            if build.job_error.is_some() || !build.osbuild_succeeded() {
                warn!(dependency = i, "build dependency failed");
                failed = true;
            }
            builds.push(build);
        }

        if failed {
            self.fail_build(&args.server, &init, result).await;
            return Err(ClientError::new(
                ErrorCode::KOJI_FAILED_DEPENDENCY,
                "At least one job dependency failed",
            ));
        }

        let end_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let metadata = match build_metadata(&args, &init, &builds, end_time) {
            Ok(metadata) => metadata,
            Err(err) => {
                self.fail_build(&args.server, &init, result).await;
                return Err(err);
            }
        };

        self.import(&args, &metadata, &init.token, result).await?;
        info!(build_id = init.build_id, outputs = metadata.output.len(), "koji build imported");
        Ok(())
    }
}

fn checksum_type(info: &KojiOutputInfo) -> Result<ChecksumType, ClientError> {
    match info.checksum_type.as_str() {
        "md5" => Ok(ChecksumType::Md5),
        "adler32" => Ok(ChecksumType::Adler32),
        "sha256" => Ok(ChecksumType::Sha256),
        other => Err(ClientError::new(
            ErrorCode::KOJI_FINALIZE,
            format!("unsupported checksum type {other:?} for {}", info.filename),
        )),
    }
}

fn output(
    buildroot_id: u64,
    info: &KojiOutputInfo,
    arch: &str,
    kind: OutputType,
    components: Vec<rpm::Rpm>,
    extra: Option<OutputExtraInfo>,
) -> Result<BuildOutput, ClientError> {
    Ok(BuildOutput {
        buildroot_id,
        filename: info.filename.clone(),
        filesize: info.size,
        arch: arch.to_string(),
        checksum_type: checksum_type(info)?,
        checksum: info.checksum.clone(),
        kind,
        components,
        extra: extra.map(|image| BuildOutputExtra { image }),
    })
}

/// Assemble the content-generator metadata of the finished builds.
///
/// A build without a koji target result (an older composer's result shape)
/// is rejected with `old-result-compatible`.
pub fn build_metadata(
    args: &KojiFinalizeJob,
    init: &KojiInitJobResult,
    builds: &[OsbuildJobResult],
    end_time: i64,
) -> Result<Metadata, ClientError> {
    let mut buildroots = Vec::with_capacity(builds.len());
    let mut outputs = Vec::new();
    let mut images = BTreeMap::new();
    let mut manifests = BTreeMap::new();

    for (i, build) in builds.iter().enumerate() {
        let buildroot_id = i as u64 + 1;
        let koji_result = build.target_results_named(TARGET_KOJI).next().ok_or_else(|| {
            ClientError::new(
                ErrorCode::OLD_RESULT_COMPATIBLE,
                format!("build job {buildroot_id} has no koji target result"),
            )
        })?;
        let options: KojiTargetResultOptions = koji_result.options().map_err(|e| {
            ClientError::with_details(
                ErrorCode::OLD_RESULT_COMPATIBLE,
                format!("build job {buildroot_id} has an unreadable koji target result"),
                e.to_string(),
            )
        })?;
        let image = options.image.as_ref().ok_or_else(|| {
            ClientError::new(
                ErrorCode::OLD_RESULT_COMPATIBLE,
                format!("build job {buildroot_id} uploaded no image to koji"),
            )
        })?;

        let osbuild_output = build.osbuild_output.clone().unwrap_or_default();
        let (build_components, payload_components) = match &build.pipeline_names {
            Some(names) => (
                rpm::components(&osbuild_output, names.build.iter().map(String::as_str)),
                rpm::components(&osbuild_output, names.payload.iter().map(String::as_str)),
            ),
            None => (
                Vec::new(),
                rpm::components(&osbuild_output, osbuild_output.metadata.keys().map(String::as_str)),
            ),
        };
        buildroots.push(BuildRoot::host(buildroot_id, &build.host_os, &build.arch, build_components));

        let image_info = ImageExtraInfo {
            arch: build.arch.clone(),
            boot_mode: build.image_boot_mode.clone(),
            osbuild_artifact: koji_result.osbuild_artifact.clone(),
            osbuild_version: build.osbuild_version.clone(),
            upload_target_results: build
                .target_results
                .iter()
                .filter(|r| r.name != TARGET_KOJI)
                .cloned()
                .collect(),
        };
        images.insert(image.filename.clone(), image_info.clone());
        outputs.push(output(
            buildroot_id,
            image,
            &build.arch,
            OutputType::Image,
            payload_components,
            Some(OutputExtraInfo::Image(image_info)),
        )?);

        if let Some(manifest) = &options.osbuild_manifest {
            let manifest_info = ManifestExtraInfo {
                arch: build.arch.clone(),
                info: Some(ManifestInfo {
                    osbuild_composer_version: COMPOSER_VERSION.to_string(),
                }),
            };
            manifests.insert(manifest.filename.clone(), manifest_info.clone());
            outputs.push(output(
                buildroot_id,
                manifest,
                &build.arch,
                OutputType::Manifest,
                Vec::new(),
                Some(OutputExtraInfo::Manifest(manifest_info)),
            )?);
        }

        if let Some(log) = &options.log {
            outputs.push(output(buildroot_id, log, "noarch", OutputType::Log, Vec::new(), None)?);
        }

        for sbom in &options.sbom_docs {
            let sbom_info = SbomDocExtraInfo {
                arch: build.arch.clone(),
            };
            outputs.push(output(
                buildroot_id,
                sbom,
                &build.arch,
                OutputType::SbomDoc,
                Vec::new(),
                Some(OutputExtraInfo::SbomDoc(sbom_info)),
            )?);
        }
    }

    let build = Build {
        build_id: init.build_id,
        task_id: args.task_id,
        name: args.name.clone(),
        version: args.version.clone(),
        release: args.release.clone(),
        source: String::new(),
        start_time: args.start_time as i64,
        end_time,
        extra: BuildExtra {
            typeinfo: TypeInfoBuild { image: images },
            manifests: (!manifests.is_empty()).then_some(manifests),
        },
    };
    Ok(Metadata::new(build, buildroots, outputs))
}
