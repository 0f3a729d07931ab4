//! Job kinds and the lanes that run them.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::ParseError;

/// Closed set of job kinds the worker knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Depsolve,
    SearchPackages,
    #[serde(rename = "osbuild")]
    Osbuild,
    BootcImageBuilder,
    #[serde(rename = "aws-ec2-copy")]
    AwsEc2Copy,
    #[serde(rename = "aws-ec2-share")]
    AwsEc2Share,
    KojiInit,
    KojiFinalize,
    ContainerResolve,
    OstreeResolve,
    FileResolve,
    ManifestIdOnly,
    BootcManifest,
    ImageBuilderManifest,
}

impl JobKind {
    /// Every kind, in lane order.
    pub const ALL: [JobKind; 14] = [
        JobKind::Depsolve,
        JobKind::SearchPackages,
        JobKind::Osbuild,
        JobKind::BootcImageBuilder,
        JobKind::AwsEc2Copy,
        JobKind::AwsEc2Share,
        JobKind::KojiFinalize,
        JobKind::KojiInit,
        JobKind::ContainerResolve,
        JobKind::OstreeResolve,
        JobKind::FileResolve,
        JobKind::ManifestIdOnly,
        JobKind::BootcManifest,
        JobKind::ImageBuilderManifest,
    ];

    /// Wire tag used by the queue server.
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Depsolve => "depsolve",
            JobKind::SearchPackages => "search-packages",
            JobKind::Osbuild => "osbuild",
            JobKind::BootcImageBuilder => "bootc-image-builder",
            JobKind::AwsEc2Copy => "aws-ec2-copy",
            JobKind::AwsEc2Share => "aws-ec2-share",
            JobKind::KojiInit => "koji-init",
            JobKind::KojiFinalize => "koji-finalize",
            JobKind::ContainerResolve => "container-resolve",
            JobKind::OstreeResolve => "ostree-resolve",
            JobKind::FileResolve => "file-resolve",
            JobKind::ManifestIdOnly => "manifest-id-only",
            JobKind::BootcManifest => "bootc-manifest",
            JobKind::ImageBuilderManifest => "image-builder-manifest",
        }
    }

    /// Lane this kind runs on.
    pub fn lane(self) -> Lane {
        match self {
            JobKind::Depsolve | JobKind::SearchPackages => Lane::Depsolve,
            JobKind::Osbuild | JobKind::BootcImageBuilder => Lane::Build,
            JobKind::AwsEc2Copy | JobKind::AwsEc2Share | JobKind::KojiFinalize => Lane::CopyShare,
            JobKind::KojiInit
            | JobKind::ContainerResolve
            | JobKind::OstreeResolve
            | JobKind::FileResolve
            | JobKind::ManifestIdOnly
            | JobKind::BootcManifest
            | JobKind::ImageBuilderManifest => Lane::Misc,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseError::UnknownJobKind { kind: s.to_string() })
    }
}

/// A group of job kinds sharing a resource profile.
///
/// Each lane runs one job at a time; lanes run concurrently with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// CPU-heavy, short, latency-sensitive.
    Depsolve,
    /// Long image builds.
    Build,
    /// Mostly idle, bound by remote latency.
    CopyShare,
    /// Short and cheap.
    Misc,
}

impl Lane {
    pub const ALL: [Lane; 4] = [Lane::Depsolve, Lane::Build, Lane::CopyShare, Lane::Misc];

    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Depsolve => "depsolve",
            Lane::Build => "build",
            Lane::CopyShare => "copy-share",
            Lane::Misc => "misc",
        }
    }

    /// Kinds claimed by this lane.
    pub fn kinds(self) -> Vec<JobKind> {
        JobKind::ALL.into_iter().filter(|kind| kind.lane() == self).collect()
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_membership() {
        assert_eq!(Lane::Depsolve.kinds(), vec![JobKind::Depsolve, JobKind::SearchPackages]);
        assert_eq!(Lane::Build.kinds(), vec![JobKind::Osbuild, JobKind::BootcImageBuilder]);
        assert_eq!(Lane::CopyShare.kinds(), vec![
            JobKind::AwsEc2Copy,
            JobKind::AwsEc2Share,
            JobKind::KojiFinalize
        ]);
        assert_eq!(Lane::Misc.kinds().len(), 7);
    }

    #[test]
    fn test_serde_tag_matches_as_str() {
        for kind in JobKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind() {
        assert!("x".parse::<JobKind>().is_err());
    }
}
