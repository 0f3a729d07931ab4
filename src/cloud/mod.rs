//! Cloud collaborators.

pub mod aws;
pub mod container;
pub mod oci;

pub use aws::AwsCli;
pub use container::RegistryPush;
pub use oci::OciCli;
