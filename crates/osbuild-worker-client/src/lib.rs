//! Queue-server client for the osbuild worker.
//!
//! [`Client`] speaks the worker REST API (`/api/worker/v1` by default):
//! registration, claims, job status, updates, finish, artifacts and dependency
//! results. Requests carry a bearer token when OAuth is configured; a 401 makes
//! the client refresh the token once and replay the request. Server errors and
//! connection failures are retried with exponential backoff ([`RetryPolicy`]).
//!
//! A successful claim yields a [`Job`] handle that carries the job's id, kind,
//! arguments and dependency ids and reports back through the shared client.

pub mod auth;
pub mod client;
pub mod error;
pub mod job;
pub mod retry;

pub use auth::Grant;
pub use auth::OAuthConfig;
pub use client::Client;
pub use client::ClientConfig;
pub use client::Endpoint;
pub use client::JobStatus;
pub use error::Error;
pub use error::Result;
pub use job::Job;
pub use retry::RetryPolicy;
