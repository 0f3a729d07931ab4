//! Worker configuration
//!
//! Loaded from a TOML file (default [`DEFAULT_CONFIG_PATH`]). Every section is
//! optional; a missing file yields the defaults. Unknown keys are ignored.

pub mod error;

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use snafu::ResultExt;
use tracing::info;
use url::Url;

pub use error::ConfigError;
use error::InvalidValueSnafu;
use error::MissingRequiredSnafu;
use error::ParseFileSnafu;
use error::ReadFileSnafu;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/osbuild-worker/osbuild-worker.toml";
pub const DEFAULT_BASE_PATH: &str = "/api/worker/v1";
pub const DEFAULT_DNF_JSON: &str = "/usr/libexec/osbuild-depsolve-dnf";

/// Top-level worker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub base_path: String,
    #[serde(rename = "dnf-json")]
    pub dnf_json: PathBuf,
    pub composer: Option<ComposerConfig>,
    pub authentication: Option<AuthenticationConfig>,
    /// Koji hubs keyed by host name.
    pub koji: BTreeMap<String, KojiServerConfig>,
    pub aws: Option<AwsConfig>,
    pub azure: Option<AzureConfig>,
    pub gcp: Option<GcpConfig>,
    pub generic_s3: Option<GenericS3Config>,
    pub oci: Option<OciConfig>,
    pub containers: Option<ContainersConfig>,
    pub osbuild_executor: OsbuildExecutorConfig,
    pub repository_mtls: Option<RepositoryMtlsConfig>,
    pub protector: ProtectorConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            base_path: DEFAULT_BASE_PATH.to_string(),
            dnf_json: PathBuf::from(DEFAULT_DNF_JSON),
            composer: None,
            authentication: None,
            koji: BTreeMap::new(),
            aws: None,
            azure: None,
            gcp: None,
            generic_s3: None,
            oci: None,
            containers: None,
            osbuild_executor: OsbuildExecutorConfig::default(),
            repository_mtls: None,
            protector: ProtectorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComposerConfig {
    /// HTTP proxy for queue-server traffic.
    pub proxy: Option<String>,
}

/// OAuth settings. `client_secret` and `offline_token` are file paths.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthenticationConfig {
    pub oauth_url: String,
    pub client_id: String,
    #[serde(rename = "client_secret")]
    pub client_secret_path: Option<PathBuf>,
    #[serde(rename = "offline_token")]
    pub offline_token_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KojiServerConfig {
    pub kerberos: Option<KerberosConfig>,
    /// Multiplier for the hub's timeouts on slow networks.
    pub relax_timeout_factor: u32,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for KojiServerConfig {
    fn default() -> Self {
        Self {
            kerberos: None,
            relax_timeout_factor: 1,
            user: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KerberosConfig {
    pub principal: String,
    pub keytab: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub credentials: Option<PathBuf>,
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub credentials: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GcpConfig {
    pub credentials: Option<PathBuf>,
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GenericS3Config {
    pub credentials: Option<PathBuf>,
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub ca_bundle: Option<PathBuf>,
    pub skip_ssl_verification: bool,
}

/// Oracle Cloud defaults. `credentials` is an `oci` CLI config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OciConfig {
    pub credentials: Option<PathBuf>,
    pub bucket: String,
    pub namespace: String,
    pub compartment: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainersConfig {
    pub auth_file_path: Option<PathBuf>,
    pub domain: String,
    pub path_prefix: String,
    pub cert_path: Option<PathBuf>,
    pub tls_verify: bool,
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            auth_file_path: None,
            domain: String::new(),
            path_prefix: String::new(),
            cert_path: None,
            tls_verify: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OsbuildExecutorConfig {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for OsbuildExecutorConfig {
    fn default() -> Self {
        Self {
            kind: "host".to_string(),
        }
    }
}

/// mTLS material for repositories under `baseurl`.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryMtlsConfig {
    pub baseurl: String,
    #[serde(default)]
    pub ca: Option<PathBuf>,
    pub mtls_client_key: PathBuf,
    pub mtls_client_cert: PathBuf,
    #[serde(default)]
    pub proxy: Option<String>,
}

impl RepositoryMtlsConfig {
    /// True when `url` lives under the configured base URL.
    pub fn matches(&self, url: &str) -> Result<bool, url::ParseError> {
        let base = Url::parse(&self.baseurl)?;
        let url = Url::parse(url)?;
        Ok(url.scheme() == base.scheme() && url.host_str() == base.host_str() && url.path().starts_with(base.path()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectorBackendKind {
    #[default]
    None,
    Aws,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtectorConfig {
    pub protect_timeout_ms: u64,
    pub unprotect_timeout_ms: u64,
    pub queue_size: usize,
    pub backend: ProtectorBackendKind,
}

impl Default for ProtectorConfig {
    fn default() -> Self {
        Self {
            protect_timeout_ms: 10_000,
            unprotect_timeout_ms: 60_000,
            queue_size: 1024,
            backend: ProtectorBackendKind::None,
        }
    }
}

impl ProtectorConfig {
    pub fn protect_timeout(&self) -> Duration {
        Duration::from_millis(self.protect_timeout_ms)
    }

    pub fn unprotect_timeout(&self) -> Duration {
        Duration::from_millis(self.unprotect_timeout_ms)
    }
}

impl WorkerConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        let config = Self::from_toml(&contents).map_err(|e| match e {
            FromTomlError::Parse(source) => ConfigError::ParseFile {
                path: path.to_path_buf(),
                source,
            },
            FromTomlError::Invalid(e) => e,
        })?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(contents: &str) -> Result<Self, FromTomlError> {
        let config: Self = toml::from_str(contents).map_err(FromTomlError::Parse)?;
        config.validate().map_err(FromTomlError::Invalid)?;
        Ok(config)
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.osbuild_executor.kind != "host" {
            return InvalidValueSnafu {
                key: "osbuild_executor.type",
                value: self.osbuild_executor.kind.clone(),
                reason: "only 'host' is supported",
            }
            .fail();
        }

        for (host, server) in &self.koji {
            if server.relax_timeout_factor == 0 {
                return InvalidValueSnafu {
                    key: format!("koji.\"{host}\".relax_timeout_factor"),
                    value: "0",
                    reason: "must be at least 1",
                }
                .fail();
            }
        }

        if let Some(auth) = &self.authentication {
            if auth.oauth_url.is_empty() {
                return MissingRequiredSnafu {
                    key: "authentication.oauth_url",
                    hint: "required when [authentication] is present",
                }
                .fail();
            }
            if auth.offline_token_path.is_none() && auth.client_secret_path.is_none() {
                return MissingRequiredSnafu {
                    key: "authentication.offline_token",
                    hint: "either offline_token or client_secret must be set",
                }
                .fail();
            }
        }

        if let Some(mtls) = &self.repository_mtls {
            Url::parse(&mtls.baseurl).map_err(|e| {
                InvalidValueSnafu {
                    key: "repository_mtls.baseurl",
                    value: mtls.baseurl.clone(),
                    reason: e.to_string(),
                }
                .build()
            })?;
        }

        if let Some(azure) = &self.azure {
            if azure.credentials.is_none() {
                return MissingRequiredSnafu {
                    key: "azure.credentials",
                    hint: "path to the azure credentials file",
                }
                .fail();
            }
        }

        if let Some(s3) = &self.generic_s3 {
            if s3.endpoint.is_empty() {
                return MissingRequiredSnafu {
                    key: "generic_s3.endpoint",
                    hint: "required when [generic_s3] is present",
                }
                .fail();
            }
        }

        if self.protector.queue_size == 0 {
            return InvalidValueSnafu {
                key: "protector.queue_size",
                value: "0",
                reason: "must be at least 1",
            }
            .fail();
        }

        Ok(())
    }

    /// Settings for the Koji hub at `host`.
    pub fn koji_server(&self, host: &str) -> Option<&KojiServerConfig> {
        self.koji.get(host)
    }

    pub fn aws_credentials(&self) -> Option<&Path> {
        self.aws.as_ref().and_then(|a| a.credentials.as_deref())
    }

    pub fn aws_bucket(&self) -> Option<&str> {
        self.aws.as_ref().and_then(|a| a.bucket.as_deref()).filter(|b| !b.is_empty())
    }

    pub fn containers_auth_file(&self) -> Option<&Path> {
        self.containers.as_ref().and_then(|c| c.auth_file_path.as_deref())
    }
}

/// Failure of [`WorkerConfig::from_toml`].
#[derive(Debug)]
pub enum FromTomlError {
    Parse(toml::de::Error),
    Invalid(ConfigError),
}

impl std::fmt::Display for FromTomlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FromTomlError::Parse(e) => write!(f, "{e}"),
            FromTomlError::Invalid(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FromTomlError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = WorkerConfig::from_toml("").unwrap();
        assert_eq!(config.base_path, "/api/worker/v1");
        assert_eq!(config.dnf_json, PathBuf::from(DEFAULT_DNF_JSON));
        assert_eq!(config.protector.queue_size, 1024);
        assert_eq!(config.protector.protect_timeout(), Duration::from_secs(10));
        assert_eq!(config.protector.unprotect_timeout(), Duration::from_secs(60));
        assert_eq!(config.protector.backend, ProtectorBackendKind::None);
        assert_eq!(config.osbuild_executor.kind, "host");
    }

    #[test]
    fn test_full_config() {
        let config = WorkerConfig::from_toml(
            r#"
base_path = "/api/image-builder-worker/v1"
dnf-json = "/usr/libexec/osbuild-composer/dnf-json"
unknown_key = "ignored"

[composer]
proxy = "http://proxy.example:3128"

[authentication]
oauth_url = "https://sso.example/token"
client_id = "rhsm-api"
offline_token = "/etc/osbuild-worker/offline-token"

[koji."koji.example.com"]
relax_timeout_factor = 4

[koji."koji.example.com".kerberos]
principal = "osbuild-worker@EXAMPLE.COM"
keytab = "/etc/osbuild-worker/client.keytab"

[koji."plain.example.com"]
user = "osbuild"
password = "hunter2"

[aws]
credentials = "/etc/osbuild-worker/aws-credentials"
bucket = "images"

[gcp]
credentials = "/etc/osbuild-worker/gcp.json"

[generic_s3]
endpoint = "https://minio.example:9000"
region = "us-east-1"
bucket = "ci"
skip_ssl_verification = true

[oci]
credentials = "/etc/osbuild-worker/oci-config"
bucket = "images"
namespace = "tenancy-ns"
compartment = "ocid1.compartment.oc1..x"

[containers]
auth_file_path = "/etc/osbuild-worker/containers-auth.json"
domain = "registry.example.com"
path_prefix = "builds"
tls_verify = false

[repository_mtls]
baseurl = "https://cdn.example/content"
mtls_client_key = "/etc/pki/key.pem"
mtls_client_cert = "/etc/pki/cert.pem"

[protector]
backend = "aws"
protect_timeout_ms = 5000
"#,
        )
        .unwrap();

        assert_eq!(config.base_path, "/api/image-builder-worker/v1");
        assert_eq!(config.composer.as_ref().unwrap().proxy.as_deref(), Some("http://proxy.example:3128"));
        let koji = config.koji_server("koji.example.com").unwrap();
        assert_eq!(koji.relax_timeout_factor, 4);
        assert_eq!(koji.kerberos.as_ref().unwrap().principal, "osbuild-worker@EXAMPLE.COM");
        let plain = config.koji_server("plain.example.com").unwrap();
        assert_eq!(plain.relax_timeout_factor, 1);
        assert_eq!(plain.user.as_deref(), Some("osbuild"));
        assert_eq!(config.aws_bucket(), Some("images"));
        assert!(config.generic_s3.as_ref().unwrap().skip_ssl_verification);
        assert!(!config.containers.as_ref().unwrap().tls_verify);
        assert_eq!(config.containers.as_ref().unwrap().domain, "registry.example.com");
        let oci = config.oci.as_ref().unwrap();
        assert_eq!(oci.namespace, "tenancy-ns");
        assert_eq!(oci.credentials.as_deref(), Some(Path::new("/etc/osbuild-worker/oci-config")));
        assert_eq!(config.protector.backend, ProtectorBackendKind::Aws);
        assert_eq!(config.protector.protect_timeout(), Duration::from_secs(5));
        assert_eq!(config.protector.unprotect_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_non_host_executor() {
        let err = WorkerConfig::from_toml("[osbuild_executor]\ntype = \"aws.ec2\"\n").unwrap_err();
        assert!(err.to_string().contains("osbuild_executor.type"));
    }

    #[test]
    fn test_rejects_zero_relax_factor() {
        let err = WorkerConfig::from_toml("[koji.\"k\"]\nrelax_timeout_factor = 0\n").unwrap_err();
        assert!(matches!(err, FromTomlError::Invalid(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_authentication_needs_a_credential() {
        let err = WorkerConfig::from_toml("[authentication]\noauth_url = \"https://sso\"\nclient_id = \"x\"\n").unwrap_err();
        assert!(matches!(err, FromTomlError::Invalid(ConfigError::MissingRequired { .. })));
    }

    #[test]
    fn test_mtls_base_url_matching() {
        let mtls = RepositoryMtlsConfig {
            baseurl: "https://cdn.example/content".into(),
            ca: None,
            mtls_client_key: "/k".into(),
            mtls_client_cert: "/c".into(),
            proxy: None,
        };
        assert!(mtls.matches("https://cdn.example/content/dist/rhel9/os").unwrap());
        assert!(!mtls.matches("http://cdn.example/content/dist").unwrap());
        assert!(!mtls.matches("https://other.example/content").unwrap());
        assert!(mtls.matches("not a url").is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig::load(dir.path().join("absent.toml")).unwrap();
        assert!(config.koji.is_empty());
    }
}
