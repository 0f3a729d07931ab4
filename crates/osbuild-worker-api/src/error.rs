//! Job-level error taxonomy.
//!
//! A failed job never surfaces as a Rust error to the queue server. Instead the
//! handler writes a [`ClientError`] into the `job_error` field of the result
//! envelope. The numeric [`ErrorCode`] is stable across releases; the queue
//! server uses [`ErrorCode::status_class`] to decide whether the failure is the
//! user's fault (4xx) or ours (5xx).

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

/// Stable numeric code identifying a job failure.
///
/// Codes outside the known set are accepted when decoding results written by
/// other workers and classify as [`StatusClass::Internal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NO_DYNAMIC_ARGS: Self = Self(1);
    pub const INVALID_TARGET_CONFIG: Self = Self(2);
    pub const SHARING_TARGET: Self = Self(3);
    pub const INVALID_TARGET: Self = Self(4);
    pub const DEPSOLVE_DEPENDENCY: Self = Self(5);
    pub const READING_JOB_STATUS: Self = Self(6);
    pub const PARSING_DYNAMIC_ARGS: Self = Self(7);
    pub const MANIFEST_GENERATION: Self = Self(8);
    pub const MANIFEST_DEPENDENCY: Self = Self(9);
    pub const BUILD_JOB: Self = Self(10);
    pub const UPLOADING_IMAGE: Self = Self(11);
    pub const IMPORTING_IMAGE: Self = Self(12);
    pub const KOJI_FAILED_DEPENDENCY: Self = Self(13);
    pub const KOJI_BUILD: Self = Self(14);
    pub const KOJI_INIT: Self = Self(15);
    pub const KOJI_FINALIZE: Self = Self(16);
    pub const INVALID_CONFIG: Self = Self(17);
    pub const OLD_RESULT_COMPATIBLE: Self = Self(18);
    pub const EMPTY_MANIFEST: Self = Self(19);
    pub const DNF_DEPSOLVE: Self = Self(20);
    pub const DNF_MARKING: Self = Self(21);
    pub const DNF_OTHER: Self = Self(22);
    pub const RPMMD: Self = Self(23);
    pub const EMPTY_PACKAGE_SPECS: Self = Self(24);
    pub const DNF_REPO: Self = Self(25);
    pub const JOB_DEPENDENCY: Self = Self(26);
    pub const JOB_MISSING_HEARTBEAT: Self = Self(27);
    pub const TARGET: Self = Self(28);
    pub const PARSING_JOB_ARGS: Self = Self(29);
    pub const CONTAINER_RESOLUTION: Self = Self(30);
    pub const CONTAINER_DEPENDENCY: Self = Self(31);
    pub const OSTREE_REF_INVALID: Self = Self(32);
    pub const OSTREE_REF_RESOLUTION: Self = Self(33);
    pub const OSTREE_PARAMS_INVALID: Self = Self(34);
    pub const OSTREE_DEPENDENCY: Self = Self(35);
    pub const REMOTE_FILE_RESOLUTION: Self = Self(36);
    pub const JOB_PANICKED: Self = Self(37);
    pub const GENERATING_SIGNED_URL: Self = Self(38);
    pub const INVALID_REPOSITORY_URL: Self = Self(39);

    /// Codes whose failure is attributable to the request.
    const USER_INPUT: [Self; 13] = [
        Self::NO_DYNAMIC_ARGS,
        Self::INVALID_TARGET_CONFIG,
        Self::SHARING_TARGET,
        Self::INVALID_TARGET,
        Self::DEPSOLVE_DEPENDENCY,
        Self::MANIFEST_DEPENDENCY,
        Self::EMPTY_MANIFEST,
        Self::DNF_DEPSOLVE,
        Self::DNF_MARKING,
        Self::JOB_DEPENDENCY,
        Self::TARGET,
        Self::CONTAINER_RESOLUTION,
        Self::OSTREE_DEPENDENCY,
    ];

    /// Codes meaning a predecessor failed rather than this job.
    const DEPENDENCY: [Self; 6] = [
        Self::DEPSOLVE_DEPENDENCY,
        Self::MANIFEST_DEPENDENCY,
        Self::KOJI_FAILED_DEPENDENCY,
        Self::JOB_DEPENDENCY,
        Self::CONTAINER_DEPENDENCY,
        Self::OSTREE_DEPENDENCY,
    ];

    /// Classify the code for the queue server.
    pub fn status_class(self) -> StatusClass {
        if Self::USER_INPUT.contains(&self) {
            StatusClass::UserInput
        } else {
            StatusClass::Internal
        }
    }

    /// True when the code records a failed predecessor job.
    pub fn is_dependency(self) -> bool {
        Self::DEPENDENCY.contains(&self)
    }

    /// Short kebab-case name, `None` for codes this worker does not know.
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            1 => "no-dynamic-args",
            2 => "invalid-target-config",
            3 => "sharing-target",
            4 => "invalid-target",
            5 => "depsolve-dependency",
            6 => "reading-job-status",
            7 => "parsing-dynamic-args",
            8 => "manifest-generation",
            9 => "manifest-dependency",
            10 => "build-job",
            11 => "uploading-image",
            12 => "importing-image",
            13 => "koji-failed-dependency",
            14 => "koji-build",
            15 => "koji-init",
            16 => "koji-finalize",
            17 => "invalid-config",
            18 => "old-result-compatible",
            19 => "empty-manifest",
            20 => "dnf-depsolve",
            21 => "dnf-marking",
            22 => "dnf-other",
            23 => "rpmmd",
            24 => "empty-package-specs",
            25 => "dnf-repo",
            26 => "job-dependency",
            27 => "job-missing-heartbeat",
            28 => "target",
            29 => "parsing-job-args",
            30 => "container-resolution",
            31 => "container-dependency",
            32 => "ostree-ref-invalid",
            33 => "ostree-ref-resolution",
            34 => "ostree-params-invalid",
            35 => "ostree-dependency",
            36 => "remote-file-resolution",
            37 => "job-panicked",
            38 => "generating-signed-url",
            39 => "invalid-repository-url",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({name})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

/// How the queue server should report a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// No error recorded.
    Success,
    /// The request was at fault (4xx).
    UserInput,
    /// The worker or its infrastructure was at fault (5xx).
    Internal,
}

/// Classify an optional job error. No error is a success.
pub fn status_class(error: Option<&ClientError>) -> StatusClass {
    match error {
        None => StatusClass::Success,
        Some(err) => err.code.status_class(),
    }
}

/// Structured job failure written into the result envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientError {
    /// Stable failure code.
    #[serde(alias = "id")]
    pub code: ErrorCode,
    /// Short human-readable reason.
    pub reason: String,
    /// Optional free-form details (nested errors, stderr excerpts, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.reason, self.code.0)
    }
}

impl std::error::Error for ClientError {}

impl ClientError {
    /// Create an error without details.
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            details: None,
        }
    }

    /// Create an error carrying details.
    pub fn with_details(code: ErrorCode, reason: impl Into<String>, details: impl Serialize) -> Self {
        Self {
            code,
            reason: reason.into(),
            details: serde_json::to_value(details).ok().filter(|v| !v.is_null()),
        }
    }

    /// Shorthand for `self.code.is_dependency()`.
    pub fn is_dependency(&self) -> bool {
        self.code.is_dependency()
    }
}

/// Failures decoding worker-side schemas.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ParseError {
    /// The queue server offered a kind this worker does not know.
    #[snafu(display("unknown job kind: {kind}"))]
    UnknownJobKind { kind: String },

    /// The manifest document has no content.
    #[snafu(display("manifest is empty"))]
    ManifestEmpty,

    /// The manifest is not valid JSON.
    #[snafu(display("{source}"))]
    ManifestJson { source: serde_json::Error },

    /// The manifest is not a version 2 manifest.
    #[snafu(display("unexpected manifest version: {version} != 2"))]
    ManifestVersion { version: String },

    /// The manifest has an empty pipeline list.
    #[snafu(display("no pipelines found"))]
    NoPipelines,

    /// A pipeline's `build` property is not of the form `name:<pipeline>`.
    #[snafu(display("unexpected pipeline build property format: {value}"))]
    BuildProperty { value: String },

    /// A job argument or result payload could not be decoded.
    #[snafu(display("failed to decode {what}: {source}"))]
    Decode { what: String, source: serde_json::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_input_codes() {
        let user: Vec<u32> = (1..=39).filter(|c| ErrorCode(*c).status_class() == StatusClass::UserInput).collect();
        assert_eq!(user, vec![1, 2, 3, 4, 5, 9, 19, 20, 21, 26, 28, 30, 35]);
    }

    #[test]
    fn test_dependency_codes() {
        let deps: Vec<u32> = (1..=39).filter(|c| ErrorCode(*c).is_dependency()).collect();
        assert_eq!(deps, vec![5, 9, 13, 26, 31, 35]);
    }

    #[test]
    fn test_unknown_code_is_internal() {
        assert_eq!(ErrorCode(1000).status_class(), StatusClass::Internal);
        assert!(ErrorCode(1000).name().is_none());
        assert!(!ErrorCode(1000).is_dependency());
    }

    #[test]
    fn test_repo_metadata_failure_is_internal() {
        assert_eq!(ErrorCode::DNF_REPO.status_class(), StatusClass::Internal);
        assert_eq!(ErrorCode::DNF_DEPSOLVE.status_class(), StatusClass::UserInput);
    }

    #[test]
    fn test_status_class_of_missing_error() {
        assert_eq!(status_class(None), StatusClass::Success);
        let err = ClientError::new(ErrorCode::JOB_PANICKED, "boom");
        assert_eq!(status_class(Some(&err)), StatusClass::Internal);
    }

    #[test]
    fn test_decodes_legacy_id_field() {
        let err: ClientError = serde_json::from_str(r#"{"id": 10, "reason": "osbuild build failed"}"#).unwrap();
        assert_eq!(err.code, ErrorCode::BUILD_JOB);
        assert!(err.details.is_none());

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], 10);
    }

    #[test]
    fn test_null_details_are_dropped() {
        let err = ClientError::with_details(ErrorCode::TARGET, "at least one target failed", Option::<String>::None);
        assert!(err.details.is_none());
    }
}
