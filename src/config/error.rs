//! Configuration error types

use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// The configuration file exists but cannot be read.
    #[snafu(display("failed to read {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    /// The configuration file is not valid TOML for this worker.
    #[snafu(display("failed to parse {}: {source}", path.display()))]
    ParseFile { path: PathBuf, source: toml::de::Error },

    /// A configuration value is invalid
    #[snafu(display("Invalid configuration for {key}: '{value}' ({reason})"))]
    InvalidValue { key: String, value: String, reason: String },

    /// A required configuration value is missing
    #[snafu(display("Missing required configuration: {key} ({hint})"))]
    MissingRequired { key: String, hint: String },
}
