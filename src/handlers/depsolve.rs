//! `depsolve` and `search-packages`.

use std::sync::Arc;

use async_trait::async_trait;
use osbuild_worker_api::ClientError;
use osbuild_worker_api::ErrorCode;
use osbuild_worker_api::jobs::DepsolveJob;
use osbuild_worker_api::jobs::DepsolveJobResult;
use osbuild_worker_api::jobs::RepoConfig;
use osbuild_worker_api::jobs::SearchPackagesJob;
use osbuild_worker_api::jobs::SearchPackagesJobResult;
use tracing::error;
use tracing::info;

use crate::config::RepositoryMtlsConfig;
use crate::dnfjson;
use crate::dnfjson::DnfJson;
use crate::dnfjson::Platform;
use crate::env::WorkerEnv;
use crate::handler::JobContext;
use crate::handler::TypedHandler;

/// Attach the configured mTLS material to `repo` if one of its base URLs is covered.
pub fn apply_repository_mtls(repo: &mut RepoConfig, mtls: &RepositoryMtlsConfig) -> Result<(), ClientError> {
    let mut covered = false;
    for baseurl in &repo.baseurls {
        match mtls.matches(baseurl) {
            Ok(matched) => covered |= matched,
            Err(e) => {
                return Err(ClientError::with_details(
                    ErrorCode::INVALID_REPOSITORY_URL,
                    "Repository URL is malformed",
                    e.to_string(),
                ));
            }
        }
    }
    if covered {
        repo.sslcacert = mtls.ca.as_ref().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        repo.sslclientkey = mtls.mtls_client_key.to_string_lossy().into_owned();
        repo.sslclientcert = mtls.mtls_client_cert.to_string_lossy().into_owned();
    }
    Ok(())
}

fn solver(env: &WorkerEnv) -> DnfJson {
    let proxy = env.config.repository_mtls.as_ref().and_then(|m| m.proxy.clone());
    DnfJson::new(&env.tools.dnf_json, &env.paths.rpmmd).with_proxy(proxy)
}

pub struct DepsolveHandler {
    env: Arc<WorkerEnv>,
}

impl DepsolveHandler {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl TypedHandler for DepsolveHandler {
    type Output = DepsolveJobResult;

    async fn execute(&self, ctx: &JobContext, result: &mut DepsolveJobResult) -> Result<(), ClientError> {
        let mut args: DepsolveJob = ctx.args()?;

        if let Some(mtls) = &self.env.config.repository_mtls {
            for chain in args.grouped_package_sets.values_mut() {
                for set in chain.iter_mut() {
                    for repo in set.repositories.iter_mut() {
                        apply_repository_mtls(repo, mtls)?;
                    }
                }
            }
        }

        let dnf = solver(&self.env);
        let solved = depsolve_all(&dnf, &args, ctx, result).await;
        if let Err(e) = dnf.clean_cache() {
            error!(error = %e, "error during rpm repo cache cleanup");
        }
        solved
    }
}

async fn depsolve_all(
    dnf: &DnfJson,
    args: &DepsolveJob,
    ctx: &JobContext,
    result: &mut DepsolveJobResult,
) -> Result<(), ClientError> {
    let platform = Platform {
        module_platform_id: &args.module_platform_id,
        arch: &args.arch,
        releasever: &args.releasever,
    };
    for (name, chain) in &args.grouped_package_sets {
        let solved = dnf.depsolve(chain, platform, args.sbom_type, ctx.canceled()).await.map_err(|e| {
            error!(package_set = %name, error = %e, "depsolve failed");
            dnfjson::client_error(&e)
        })?;
        info!(package_set = %name, packages = solved.packages.len(), "depsolved");
        result.package_specs.insert(name.clone(), solved.packages);
        result.repo_configs.insert(name.clone(), solved.repos);
        if let Some(sbom) = solved.sbom {
            result.sbom_docs.insert(name.clone(), sbom);
        }
        result.solver = solved.solver;
    }
    Ok(())
}

pub struct SearchPackagesHandler {
    env: Arc<WorkerEnv>,
}

impl SearchPackagesHandler {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl TypedHandler for SearchPackagesHandler {
    type Output = SearchPackagesJobResult;

    async fn execute(&self, ctx: &JobContext, result: &mut SearchPackagesJobResult) -> Result<(), ClientError> {
        let mut args: SearchPackagesJob = ctx.args()?;
        if let Some(mtls) = &self.env.config.repository_mtls {
            for repo in args.repos.iter_mut() {
                apply_repository_mtls(repo, mtls)?;
            }
        }

        let platform = Platform {
            module_platform_id: &args.module_platform_id,
            arch: &args.arch,
            releasever: &args.releasever,
        };
        result.packages = solver(&self.env)
            .search(&args.repos, &args.packages, platform, ctx.canceled())
            .await
            .map_err(|e| {
                error!(error = %e, "package search failed");
                dnfjson::client_error(&e)
            })?;
        Ok(())
    }
}
