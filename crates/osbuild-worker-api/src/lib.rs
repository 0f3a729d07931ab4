//! Shared vocabulary of the osbuild worker.
//!
//! This crate holds everything both sides of the queue protocol agree on:
//!
//! - [`JobKind`] and [`Lane`]: the closed set of job kinds and how the worker groups them
//! - [`jobs`]: argument and result schemas per kind
//! - [`ClientError`] and [`ErrorCode`]: the stable failure taxonomy
//! - [`osbuild`]: the engine's `--json` result document
//! - [`manifest`]: the build/payload pipeline split
//! - [`target`]: upload targets and their results
//!
//! It performs no I/O.

pub mod error;
pub mod jobs;
pub mod kind;
pub mod manifest;
pub mod osbuild;
pub mod target;

pub use error::ClientError;
pub use error::ErrorCode;
pub use error::ParseError;
pub use error::StatusClass;
pub use error::status_class;
pub use jobs::JobResult;
pub use jobs::JobResultEnvelope;
pub use kind::JobKind;
pub use kind::Lane;
pub use manifest::PipelineNames;
pub use manifest::parse_manifest_pipelines;
