//! RPM component records and their aggregation from build results.

use std::collections::HashSet;

use osbuild_worker_api::osbuild::OsbuildResult;
use osbuild_worker_api::osbuild::RpmPackageMetadata;
use serde::Deserialize;
use serde::Serialize;

/// An RPM component of a build root or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rpm {
    /// Always `rpm`.
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub version: String,
    pub release: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<String>,
    pub arch: String,
    pub sigmd5: String,
    pub signature: Option<String>,
}

impl Rpm {
    /// `name-[epoch:]version-release.arch`.
    pub fn nevra(&self) -> String {
        match &self.epoch {
            Some(epoch) => format!("{}-{}:{}-{}.{}", self.name, epoch, self.version, self.release, self.arch),
            None => format!("{}-{}-{}.{}", self.name, self.version, self.release, self.arch),
        }
    }
}

impl From<RpmPackageMetadata> for Rpm {
    fn from(pkg: RpmPackageMetadata) -> Self {
        let signature = pkg.siggpg.or(pkg.sigpgp);
        Self {
            kind: "rpm".to_string(),
            name: pkg.name,
            version: pkg.version,
            release: pkg.release,
            epoch: pkg.epoch,
            arch: pkg.arch,
            sigmd5: pkg.sigmd5,
            signature,
        }
    }
}

/// Convert stage packages to components, keeping the first record of each NEVRA.
pub fn deduplicate(packages: impl IntoIterator<Item = RpmPackageMetadata>) -> Vec<Rpm> {
    let mut seen = HashSet::new();
    packages
        .into_iter()
        .map(Rpm::from)
        .filter(|rpm| seen.insert(rpm.nevra()))
        .collect()
}

/// Components installed by the named pipelines of `result`.
pub fn components<'a>(result: &OsbuildResult, pipelines: impl IntoIterator<Item = &'a str>) -> Vec<Rpm> {
    deduplicate(result.rpm_packages_of(pipelines))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str, version: &str, epoch: Option<&str>) -> RpmPackageMetadata {
        RpmPackageMetadata {
            name: name.into(),
            version: version.into(),
            release: "1".into(),
            epoch: epoch.map(Into::into),
            arch: "x86_64".into(),
            sigmd5: "md5".into(),
            sigpgp: None,
            siggpg: None,
        }
    }

    #[test]
    fn test_signature_prefers_gpg() {
        let mut p = pkg("a", "1", None);
        p.sigpgp = Some("pgp".into());
        p.siggpg = Some("gpg".into());
        assert_eq!(Rpm::from(p.clone()).signature.as_deref(), Some("gpg"));

        p.siggpg = None;
        assert_eq!(Rpm::from(p.clone()).signature.as_deref(), Some("pgp"));

        p.sigpgp = None;
        assert_eq!(Rpm::from(p).signature, None);
    }

    #[test]
    fn test_nevra() {
        assert_eq!(Rpm::from(pkg("vim-minimal", "8.0", Some("2"))).nevra(), "vim-minimal-2:8.0-1.x86_64");
        assert_eq!(Rpm::from(pkg("bash", "5.2", None)).nevra(), "bash-5.2-1.x86_64");
    }

    #[test]
    fn test_single_package_passes_through() {
        let mut p = pkg("bash", "5.2", Some("0"));
        p.siggpg = Some("sig".into());
        let rpms = deduplicate([p]);
        assert_eq!(
            rpms,
            vec![Rpm {
                kind: "rpm".into(),
                name: "bash".into(),
                version: "5.2".into(),
                release: "1".into(),
                epoch: Some("0".into()),
                arch: "x86_64".into(),
                sigmd5: "md5".into(),
                signature: Some("sig".into()),
            }]
        );
    }

    #[test]
    fn test_signature_serializes_as_null_when_absent() {
        let value = serde_json::to_value(Rpm::from(pkg("bash", "5.2", None))).unwrap();
        assert!(value["signature"].is_null());
        assert!(value.get("epoch").is_none());
        assert_eq!(value["type"], "rpm");
    }
}
