//! Koji build-tracking client.
//!
//! - [`xmlrpc`]: the XML-RPC codec the hub speaks
//! - [`Session`]: password or GSSAPI login, `CGInitBuild`, `CGRefundBuild`,
//!   `CGImport` and the chunked upload protocol
//! - [`metadata`]: content-generator metadata for `CGImport`
//! - [`rpm`]: RPM components aggregated from osbuild results

pub mod error;
pub mod metadata;
pub mod rpm;
pub mod session;
pub mod upload;
pub mod xmlrpc;

pub use error::Error;
pub use error::Result;
pub use metadata::Metadata;
pub use rpm::Rpm;
pub use session::GssapiCredentials;
pub use session::InitBuild;
pub use session::Session;
pub use upload::CHUNK_SIZE;
pub use upload::Uploaded;
