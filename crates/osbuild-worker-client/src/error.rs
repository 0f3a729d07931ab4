//! Errors returned by the queue client.

use std::path::PathBuf;

use snafu::Snafu;

/// Errors talking to the queue server or the OAuth endpoint.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Transport failure after the retry budget was spent.
    #[snafu(display("request to {url} failed: {source}"))]
    Http { url: String, source: reqwest::Error },

    /// The server answered with an unexpected status.
    #[snafu(display("{url} returned {status}: {reason}"))]
    Status {
        url: String,
        status: u16,
        /// Error code from the server's `{code, reason}` body, when present.
        code: Option<i64>,
        reason: String,
    },

    /// A refreshed token was rejected as well.
    #[snafu(display("authentication failed for {url}: server rejected refreshed token"))]
    Unauthorized { url: String },

    /// `finish` on a job that already reached a terminal state.
    #[snafu(display("job {job_id} is already finished"))]
    AlreadyFinished { job_id: uuid::Uuid },

    /// Token exchange failed.
    #[snafu(display("oauth token exchange failed: {reason}"))]
    OAuth { reason: String },

    /// A response or request body could not be (de)serialized.
    #[snafu(display("invalid json in {what}: {source}"))]
    Json { what: String, source: serde_json::Error },

    /// Local file access failed.
    #[snafu(display("failed to read {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    /// TLS material could not be loaded.
    #[snafu(display("invalid tls material {}: {source}", path.display()))]
    Tls { path: PathBuf, source: reqwest::Error },

    /// Building the HTTP client failed.
    #[snafu(display("failed to build http client: {source}"))]
    BuildClient { source: reqwest::Error },

    /// A URL could not be built from the configured address.
    #[snafu(display("invalid url {url}: {source}"))]
    InvalidUrl { url: String, source: url::ParseError },

    /// The worker has not registered yet.
    #[snafu(display("worker is not registered"))]
    NotRegistered,
}

impl Error {
    /// True for errors the retrying transport may replay.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http { source, .. } => source.is_connect() || source.is_timeout() || source.is_request(),
            Error::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
