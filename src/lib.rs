//! Worker side of the OS image build pipeline.
//!
//! The worker registers with the queue server, then runs one lane per job
//! class (see [`osbuild_worker_api::Lane`]). Each lane claims a job, keeps it
//! alive with heartbeats, dispatches it through the [`registry::Registry`] to
//! its handler and reports the result.
//!
//! Handlers drive external tools ([`process`]), cloud CLIs ([`cloud`]) and
//! Koji hubs ([`koji`]). While a build is in flight the [`protector`] keeps
//! the hosting instance from being scaled in.

pub mod cloud;
pub mod config;
pub mod dnfjson;
pub mod env;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod koji;
pub mod process;
pub mod protector;
pub mod registry;
pub mod runtime;

pub use config::WorkerConfig;
pub use env::WorkerEnv;
pub use error::Error;
pub use registry::Registry;
pub use runtime::Runtime;
