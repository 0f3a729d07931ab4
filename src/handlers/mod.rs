//! One handler per job kind.
//!
//! - `depsolve` - `depsolve` and `search-packages` through the depsolver
//! - `osbuild` - `osbuild` and `bootc-image-builder` builds plus their upload targets
//! - `koji_init`, `koji_finalize` - content generator build lifecycle
//! - `aws_ec2` - AMI copy and share
//! - `container_resolve`, `ostree_resolve`, `file_resolve` - resolvers
//! - `manifest_id_only`, `bootc_manifest`, `image_builder_manifest` - manifest producers

pub mod aws_ec2;
pub mod bootc_manifest;
pub mod container_resolve;
pub mod depsolve;
pub mod file_resolve;
pub mod image_builder_manifest;
pub mod koji_finalize;
pub mod koji_init;
pub mod manifest;
pub mod manifest_id_only;
pub mod osbuild;
pub mod ostree_resolve;

use std::sync::Arc;

use osbuild_worker_api::JobKind;

use crate::env::WorkerEnv;
use crate::registry::Registry;

/// Registry with a handler for every job kind.
pub fn register_all(env: Arc<WorkerEnv>) -> Registry {
    let build = Arc::new(osbuild::OsbuildHandler::new(env.clone()));

    let mut registry = Registry::new();
    registry
        .register(JobKind::Depsolve, Arc::new(depsolve::DepsolveHandler::new(env.clone())))
        .register(JobKind::SearchPackages, Arc::new(depsolve::SearchPackagesHandler::new(env.clone())))
        .register(JobKind::Osbuild, build.clone())
        .register(JobKind::BootcImageBuilder, build)
        .register(JobKind::AwsEc2Copy, Arc::new(aws_ec2::AwsEc2CopyHandler::new(env.clone())))
        .register(JobKind::AwsEc2Share, Arc::new(aws_ec2::AwsEc2ShareHandler::new(env.clone())))
        .register(JobKind::KojiInit, Arc::new(koji_init::KojiInitHandler::new(env.clone())))
        .register(JobKind::KojiFinalize, Arc::new(koji_finalize::KojiFinalizeHandler::new(env.clone())))
        .register(
            JobKind::ContainerResolve,
            Arc::new(container_resolve::ContainerResolveHandler::new(env.clone())),
        )
        .register(JobKind::OstreeResolve, Arc::new(ostree_resolve::OstreeResolveHandler::new(env.clone())))
        .register(JobKind::FileResolve, Arc::new(file_resolve::FileResolveHandler::new(env.clone())))
        .register(JobKind::ManifestIdOnly, Arc::new(manifest_id_only::ManifestIdOnlyHandler))
        .register(JobKind::BootcManifest, Arc::new(bootc_manifest::BootcManifestHandler::new(env.clone())))
        .register(
            JobKind::ImageBuilderManifest,
            Arc::new(image_builder_manifest::ImageBuilderManifestHandler::new(env)),
        );
    registry
}
