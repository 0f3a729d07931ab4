//! `image-builder-manifest`: generate a manifest with the image-builder CLI.
//!
//! Inputs the CLI reads from files are written into a per-job temporary
//! directory:
//!
//! - `blueprint.json` for `--blueprint`
//! - `datadir/repositories/<distro>.json` for `--data-dir`, plus a link at
//!   `datadir/<distro>.json` for CLI releases that look in the data dir root
//! - `subscription.json` for `--registrations`

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use osbuild_worker_api::ClientError;
use osbuild_worker_api::jobs::ImageBuilderArgs;
use osbuild_worker_api::jobs::ImageBuilderManifestJob;
use osbuild_worker_api::jobs::ManifestJobByIdResult;
use osbuild_worker_api::jobs::RepoConfig;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::env::WorkerEnv;
use crate::handler::JobContext;
use crate::handler::TypedHandler;
use crate::handlers::manifest;
use crate::handlers::manifest::generation_error;
use crate::process::Invocation;

/// Repository in the CLI's on-disk format. Only the first base URL is kept.
#[derive(Debug, Serialize)]
struct DiskRepository {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    baseurl: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    metalink: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    mirrorlist: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    gpgkeys: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    check_gpg: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    ignore_ssl: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    rhsm: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    module_hotfixes: Option<bool>,
    #[serde(skip_serializing_if = "String::is_empty")]
    metadata_expire: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    image_type_tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    package_sets: Vec<String>,
}

impl From<&RepoConfig> for DiskRepository {
    fn from(repo: &RepoConfig) -> Self {
        Self {
            name: repo.name.clone(),
            baseurl: repo.baseurls.first().cloned(),
            metalink: repo.metalink.clone(),
            mirrorlist: repo.mirrorlist.clone(),
            gpgkeys: repo.gpgkeys.clone(),
            check_gpg: repo.check_gpg.unwrap_or(false),
            ignore_ssl: repo.ignore_ssl.unwrap_or(false),
            rhsm: repo.rhsm,
            module_hotfixes: repo.module_hotfixes,
            metadata_expire: repo.metadata_expire.clone(),
            image_type_tags: repo.image_type_tags.clone(),
            package_sets: repo.package_sets.clone(),
        }
    }
}

fn write_repositories(args: &ImageBuilderArgs, dir: &Path) -> Result<std::path::PathBuf, ClientError> {
    let datadir = dir.join("datadir");
    let repos_dir = datadir.join("repositories");
    std::fs::create_dir_all(&repos_dir)
        .map_err(|e| generation_error(format!("failed to create repositories directory: {e}")))?;

    let repos: Vec<DiskRepository> = args.repositories.iter().map(DiskRepository::from).collect();
    let by_arch = BTreeMap::from([(args.arch.as_str(), repos)]);
    let file_name = format!("{}.json", args.distro);
    let repos_file = manifest::write_json(&repos_dir, &file_name, &by_arch)?;

    let legacy = datadir.join(&file_name);
    std::os::unix::fs::symlink(&repos_file, &legacy).map_err(|e| {
        generation_error(format!(
            "failed to symlink repos file in data-dir [{} -> {}]: {e}",
            repos_file.display(),
            legacy.display()
        ))
    })?;
    Ok(datadir)
}

/// Write the input files for `args` into `dir` and build the command line.
pub fn command(
    program: &str,
    args: &ImageBuilderArgs,
    extra_env: &[String],
    dir: &Path,
) -> Result<Invocation, ClientError> {
    let mut invocation = Invocation::new(program)
        .arg("manifest")
        .arg("--use-librepo=false")
        .args(["--distro", args.distro.as_str(), "--arch", args.arch.as_str()]);

    if let Some(blueprint) = &args.blueprint {
        let path = manifest::write_json(dir, "blueprint.json", blueprint)?;
        invocation = invocation.arg("--blueprint").arg(path);
    }
    if !args.repositories.is_empty() {
        let datadir = write_repositories(args, dir)?;
        invocation = invocation.arg("--data-dir").arg(datadir);
    }
    if let Some(subscription) = &args.subscription {
        let registrations = json!({ "redhat": { "subscription": subscription } });
        let path = manifest::write_json(dir, "subscription.json", &registrations)?;
        invocation = invocation.arg("--registrations").arg(path);
    }

    Ok(invocation
        .arg("--")
        .arg(args.image_type.as_str())
        .env_pairs(extra_env.iter().map(String::as_str))
        .current_dir(dir))
}

pub struct ImageBuilderManifestHandler {
    env: Arc<WorkerEnv>,
}

impl ImageBuilderManifestHandler {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl TypedHandler for ImageBuilderManifestHandler {
    type Output = ManifestJobByIdResult;

    async fn execute(&self, ctx: &JobContext, result: &mut ManifestJobByIdResult) -> Result<(), ClientError> {
        let job: ImageBuilderManifestJob = ctx.args()?;
        let dir = tempfile::Builder::new()
            .prefix("image-builder-manifest-")
            .tempdir()
            .map_err(|e| generation_error(format!("failed to create temporary directory: {e}")))?;

        let invocation = command(&self.env.tools.image_builder, &job.args, &job.extra_env, dir.path())?;
        let generated = manifest::generate(&invocation, ctx.canceled()).await?;
        manifest::set_manifest(result, generated);

        info!(distro = %job.args.distro, image_type = %job.args.image_type, "manifest generated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn args() -> ImageBuilderArgs {
        ImageBuilderArgs {
            distro: "centos-9".into(),
            arch: "x86_64".into(),
            image_type: "qcow2".into(),
            blueprint: None,
            repositories: Vec::new(),
            subscription: None,
        }
    }

    #[test]
    fn test_minimal_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = command("image-builder", &args(), &[], dir.path()).unwrap();
        assert_eq!(
            invocation.arg_strings(),
            vec!["manifest", "--use-librepo=false", "--distro", "centos-9", "--arch", "x86_64", "--", "qcow2"]
        );
        assert!(invocation.env_vars().is_empty());
    }

    #[test]
    fn test_full_command_line_writes_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = args();
        args.blueprint = Some(serde_json::json!({"name": "bp"}));
        args.subscription = Some(serde_json::json!({"organization": "42"}));
        args.repositories = vec![serde_json::from_value(serde_json::json!({
            "name": "baseos",
            "baseurls": ["https://mirror.example/baseos", "https://other.example/baseos"],
            "check_gpg": true,
        }))
        .unwrap()];

        let extra_env = vec!["IMAGE_BUILDER_EXPERIMENTAL=1".to_string()];
        let invocation = command("image-builder", &args, &extra_env, dir.path()).unwrap();
        let root = dir.path().display().to_string();
        assert_eq!(
            invocation.arg_strings(),
            vec![
                "manifest".to_string(),
                "--use-librepo=false".into(),
                "--distro".into(),
                "centos-9".into(),
                "--arch".into(),
                "x86_64".into(),
                "--blueprint".into(),
                format!("{root}/blueprint.json"),
                "--data-dir".into(),
                format!("{root}/datadir"),
                "--registrations".into(),
                format!("{root}/subscription.json"),
                "--".into(),
                "qcow2".into(),
            ]
        );
        assert_eq!(
            invocation.env_vars(),
            &[("IMAGE_BUILDER_EXPERIMENTAL".to_string(), "1".to_string())]
        );

        let repos: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("datadir/repositories/centos-9.json")).unwrap())
                .unwrap();
        assert_eq!(repos["x86_64"][0]["name"], "baseos");
        assert_eq!(repos["x86_64"][0]["baseurl"], "https://mirror.example/baseos");
        assert_eq!(repos["x86_64"][0]["check_gpg"], true);

        let legacy = dir.path().join("datadir/centos-9.json");
        assert!(std::fs::symlink_metadata(&legacy).unwrap().file_type().is_symlink());

        let registrations: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("subscription.json")).unwrap()).unwrap();
        assert_eq!(registrations["redhat"]["subscription"]["organization"], "42");
    }
}
