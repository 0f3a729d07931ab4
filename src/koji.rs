//! Logging into a configured Koji hub.

use osbuild_worker_koji::GssapiCredentials;
use osbuild_worker_koji::Session;
use snafu::OptionExt;
use snafu::ResultExt;
use snafu::Snafu;
use tracing::debug;

use crate::config::WorkerConfig;

#[derive(Debug, Snafu)]
pub enum LoginError {
    #[snafu(display("failed to parse Koji server URL"))]
    InvalidUrl { source: url::ParseError },

    #[snafu(display("Koji server has not been configured: {host}"))]
    NotConfigured { host: String },

    #[snafu(display("Koji server {host} has neither kerberos nor user credentials configured"))]
    NoCredentials { host: String },

    #[snafu(display("failed to authenticate with Koji server \"{host}\": {source}"))]
    Auth {
        host: String,
        source: osbuild_worker_koji::Error,
    },
}

/// Host part of a hub URL, the key of the `[koji]` table.
pub fn server_host(server: &str) -> Result<String, LoginError> {
    let url = url::Url::parse(server).context(InvalidUrlSnafu)?;
    url.host_str()
        .map(str::to_string)
        .context(NotConfiguredSnafu { host: String::new() })
}

/// Open a session with the hub at `server` using the credentials configured for its host.
pub async fn login(config: &WorkerConfig, server: &str) -> Result<Session, LoginError> {
    let host = server_host(server)?;
    let settings = config.koji_server(&host).context(NotConfiguredSnafu { host: host.clone() })?;

    let session = match (&settings.kerberos, &settings.user, &settings.password) {
        (Some(kerberos), _, _) => {
            debug!(%host, principal = %kerberos.principal, "logging into koji with kerberos");
            let credentials = GssapiCredentials {
                principal: kerberos.principal.clone(),
                keytab: kerberos.keytab.clone(),
            };
            Session::login_gssapi(server, &credentials, settings.relax_timeout_factor).await
        }
        (None, Some(user), Some(password)) => {
            debug!(%host, %user, "logging into koji with a password");
            Session::login_password(server, user, password, settings.relax_timeout_factor).await
        }
        _ => return NoCredentialsSnafu { host }.fail(),
    };
    session.context(AuthSnafu { host })
}
