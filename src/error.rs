//! Errors of the worker's collaborators.
//!
//! Job-level failures are not represented here: handlers translate these
//! into [`ClientError`](osbuild_worker_api::ClientError) values carried in the
//! job result.

use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Failed to spawn a child process.
    #[snafu(display("failed to spawn '{command}': {source}"))]
    SpawnProcess { command: String, source: std::io::Error },

    /// Failed to feed the child's standard input.
    #[snafu(display("failed to write stdin of '{command}': {source}"))]
    WriteStdin { command: String, source: std::io::Error },

    /// Failed to collect the child's output or exit status.
    #[snafu(display("failed to wait for '{command}': {source}"))]
    WaitProcess { command: String, source: std::io::Error },

    /// The child exited unsuccessfully.
    #[snafu(display("'{command}' failed ({status}): {stderr}"))]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The job was canceled while the child was running.
    #[snafu(display("'{command}' was terminated because the job was canceled"))]
    Canceled { command: String },

    /// A child's output could not be decoded.
    #[snafu(display("failed to decode {what}: {source}"))]
    DecodeOutput { what: String, source: serde_json::Error },

    /// A JSON document could not be encoded.
    #[snafu(display("failed to encode {what}: {source}"))]
    EncodeInput { what: String, source: serde_json::Error },

    /// Filesystem operation failed.
    #[snafu(display("{action} {}: {source}", path.display()))]
    Filesystem {
        action: String,
        path: PathBuf,
        source: std::io::Error,
    },

    /// A helper's reply lacks a part that was requested.
    #[snafu(display("reply does not contain the requested {what}"))]
    MissingOutput { what: String },

    /// The depsolver reported a structured error.
    #[snafu(display("{kind}: {reason}"))]
    DnfJson { kind: String, reason: String },

    /// An AWS API call failed.
    #[snafu(display("aws {operation} failed: {message}"))]
    Aws {
        operation: String,
        /// API error code parsed from the CLI diagnostics, e.g. `InvalidAMIID.NotFound`.
        code: Option<String>,
        message: String,
    },

    /// An Oracle Cloud API call failed.
    #[snafu(display("oci {operation} failed: {message}"))]
    Oci { operation: String, message: String },

    /// A container image reference cannot be used as a push destination.
    #[snafu(display("invalid image reference '{reference}': {reason}"))]
    InvalidReference { reference: String, reason: String },

    /// HTTP request to a remote resource failed.
    #[snafu(display("request to {url} failed: {source}"))]
    Http { url: String, source: reqwest::Error },

    /// Remote resource answered with an error status.
    #[snafu(display("{url} returned {status}"))]
    HttpStatus { url: String, status: u16 },

    /// A registry manifest could not be used.
    #[snafu(display("{reference}: {reason}"))]
    ContainerManifest { reference: String, reason: String },

    /// Instance metadata is unavailable.
    #[snafu(display("instance metadata unavailable: {reason}"))]
    InstanceMetadata { reason: String },
}

impl Error {
    /// AWS API error code, if this is an AWS error that carried one.
    pub fn aws_code(&self) -> Option<&str> {
        match self {
            Error::Aws { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
