//! Authenticated session against a Koji hub.

use std::process::Stdio;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use snafu::ResultExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use tracing::info;
use url::Url;

use crate::error::BuildClientSnafu;
use crate::error::CredentialCacheSnafu;
use crate::error::EncodeMetadataSnafu;
use crate::error::GssapiSnafu;
use crate::error::HttpSnafu;
use crate::error::InvalidServerSnafu;
use crate::error::LoginHelperSnafu;
use crate::error::LoginReplySnafu;
use crate::error::Result;
use crate::error::StatusSnafu;
use crate::metadata::Metadata;
use crate::xmlrpc;
use crate::xmlrpc::Value;

/// Connect timeout before `relax_timeout_factor` is applied.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Content generator name registered with the hub.
pub const CONTENT_GENERATOR: &str = "osbuild";

/// Koji `BUILD_STATES` values accepted by `CGRefundBuild`.
const BUILD_STATE_FAILED: i64 = 3;
const BUILD_STATE_CANCELED: i64 = 4;

/// Kerberos credentials used for `sslLogin`.
#[derive(Debug, Clone)]
pub struct GssapiCredentials {
    pub principal: String,
    pub keytab: std::path::PathBuf,
}

/// Reply of `CGInitBuild`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitBuild {
    pub build_id: u64,
    pub token: String,
}

/// A logged-in hub session.
///
/// Every request carries `session-id`, `session-key` and a `callnum` that
/// grows by one per request, uploads included.
#[derive(Debug)]
pub struct Session {
    http: reqwest::Client,
    server: Url,
    session_id: i64,
    session_key: String,
    callnum: AtomicU64,
}

fn http_client(relax_timeout_factor: u32) -> Result<reqwest::Client> {
    let factor = relax_timeout_factor.max(1);
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT * factor)
        .build()
        .context(BuildClientSnafu)
}

fn parse_server(server: &str) -> Result<Url> {
    Url::parse(server).context(InvalidServerSnafu { url: server })
}

async fn post_xml(http: &reqwest::Client, url: Url, body: Vec<u8>, content_type: &str) -> Result<Value> {
    let display = url.to_string();
    let response = http
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, content_type)
        .body(body)
        .send()
        .await
        .context(HttpSnafu { url: display.clone() })?;

    let status = response.status();
    if !status.is_success() {
        return StatusSnafu {
            url: display,
            status: status.as_u16(),
        }
        .fail();
    }

    let text = response.text().await.context(HttpSnafu { url: display })?;
    xmlrpc::decode_response(&text)
}

fn session_from_reply(http: reqwest::Client, server: Url, reply: &Value) -> Result<Session> {
    let session_id = reply.int_member("session-id", "login reply")?;
    let session_key = reply.str_member("session-key", "login reply")?;
    Ok(Session {
        http,
        server,
        session_id,
        session_key,
        callnum: AtomicU64::new(0),
    })
}

impl Session {
    /// Log in with a user name and password.
    pub async fn login_password(
        server: &str,
        user: &str,
        password: &str,
        relax_timeout_factor: u32,
    ) -> Result<Self> {
        let url = parse_server(server)?;
        let http = http_client(relax_timeout_factor)?;
        let body = xmlrpc::encode_call("login", &[Value::from(user), Value::from(password)]);
        let reply = post_xml(&http, url.clone(), body.into_bytes(), "text/xml").await?;
        let session = session_from_reply(http, url, &reply)?;
        info!(server, session_id = session.session_id, "logged into koji");
        Ok(session)
    }

    /// Log in through `<server>/ssllogin` with a Kerberos keytab.
    ///
    /// Tickets are obtained with `kinit` into a private credential cache and
    /// the SPNEGO exchange is performed by `curl --negotiate`.
    pub async fn login_gssapi(
        server: &str,
        credentials: &GssapiCredentials,
        relax_timeout_factor: u32,
    ) -> Result<Self> {
        let url = parse_server(server)?;
        let http = http_client(relax_timeout_factor)?;

        let ccache = tempfile::Builder::new()
            .prefix("koji-krb5cc-")
            .tempfile()
            .context(CredentialCacheSnafu)?;
        let ccache_env = format!("FILE:{}", ccache.path().display());

        let mut kinit = Command::new("kinit");
        kinit
            .arg("-k")
            .arg("-t")
            .arg(&credentials.keytab)
            .arg(&credentials.principal)
            .env("KRB5CCNAME", &ccache_env)
            .stdin(Stdio::null());
        let kinit = helper_output(kinit, "kinit").await?;
        if !kinit.status.success() {
            return GssapiSnafu {
                reason: format!("kinit failed: {}", String::from_utf8_lossy(&kinit.stderr).trim()),
            }
            .fail();
        }

        let login_url = format!("{}/ssllogin", server.trim_end_matches('/'));
        let reply = curl_negotiate(&login_url, &ccache_env, relax_timeout_factor).await?;
        let reply = xmlrpc::decode_response(&reply)?;
        let session = session_from_reply(http, url, &reply)?;
        info!(server, principal = %credentials.principal, "logged into koji with gssapi");
        Ok(session)
    }

    pub fn server(&self) -> &Url {
        &self.server
    }

    /// Hub URL with the session parameters and extra `query` pairs attached.
    fn session_url(&self, query: &[(&str, String)]) -> Url {
        let callnum = self.callnum.fetch_add(1, Ordering::SeqCst);
        let mut url = self.server.clone();
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            pairs
                .append_pair("session-id", &self.session_id.to_string())
                .append_pair("session-key", &self.session_key)
                .append_pair("callnum", &callnum.to_string());
        }
        url
    }

    /// Perform an XML-RPC call within the session.
    pub async fn call(&self, method: &str, params: &[Value]) -> Result<Value> {
        debug!(method, "koji call");
        let url = self.session_url(&[]);
        let body = xmlrpc::encode_call(method, params);
        post_xml(&self.http, url, body.into_bytes(), "text/xml").await
    }

    /// POST raw bytes to the hub with extra query parameters.
    pub(crate) async fn post_raw(&self, query: &[(&str, String)], body: Vec<u8>) -> Result<Value> {
        let url = self.session_url(query);
        post_xml(&self.http, url, body, "application/octet-stream").await
    }

    pub async fn get_api_version(&self) -> Result<i64> {
        let reply = self.call("getAPIVersion", &[]).await?;
        reply.as_i64().ok_or_else(|| {
            crate::error::DecodeSnafu {
                what: "getAPIVersion",
                reason: "not an integer",
            }
            .build()
        })
    }

    pub async fn logout(&self) -> Result<()> {
        self.call("logout", &[]).await?;
        Ok(())
    }

    /// Reserve a build for this content generator.
    pub async fn cg_init_build(&self, name: &str, version: &str, release: &str) -> Result<InitBuild> {
        let build = Value::structure([
            ("name", Value::from(name)),
            ("version", Value::from(version)),
            ("release", Value::from(release)),
        ]);
        let reply = self.call("CGInitBuild", &[Value::from(CONTENT_GENERATOR), build]).await?;
        let build_id = reply.int_member("build_id", "CGInitBuild reply")?;
        let token = reply.str_member("token", "CGInitBuild reply")?;
        Ok(InitBuild {
            build_id: u64::try_from(build_id).map_err(|_| {
                crate::error::DecodeSnafu {
                    what: "CGInitBuild reply",
                    reason: format!("negative build id {build_id}"),
                }
                .build()
            })?,
            token,
        })
    }

    async fn cg_refund_build(&self, build_id: u64, token: &str, state: i64) -> Result<()> {
        self.call(
            "CGRefundBuild",
            &[
                Value::from(CONTENT_GENERATOR),
                Value::Int(build_id as i64),
                Value::from(token),
                Value::Int(state),
            ],
        )
        .await?;
        Ok(())
    }

    /// Move a reserved build to FAILED.
    pub async fn cg_fail_build(&self, build_id: u64, token: &str) -> Result<()> {
        self.cg_refund_build(build_id, token, BUILD_STATE_FAILED).await
    }

    /// Move a reserved build to CANCELED.
    pub async fn cg_cancel_build(&self, build_id: u64, token: &str) -> Result<()> {
        self.cg_refund_build(build_id, token, BUILD_STATE_CANCELED).await
    }

    /// Import a build from files previously uploaded to `directory`.
    pub async fn cg_import(&self, metadata: &Metadata, directory: &str, token: &str) -> Result<Value> {
        let metadata = serde_json::to_string(metadata).context(EncodeMetadataSnafu)?;
        self.call("CGImport", &[Value::from(metadata), Value::from(directory), Value::from(token)])
            .await
    }
}

async fn helper_output(mut command: Command, program: &str) -> Result<std::process::Output> {
    command.output().await.context(LoginHelperSnafu { program })
}

async fn curl_negotiate(url: &str, ccache: &str, relax_timeout_factor: u32) -> Result<String> {
    let body = xmlrpc::encode_call("sslLogin", &[]);
    let connect_timeout = (CONNECT_TIMEOUT * relax_timeout_factor.max(1)).as_secs();

    let mut child = Command::new("curl")
        .args(["--silent", "--show-error", "--fail", "--negotiate", "-u", ":"])
        .arg("--connect-timeout")
        .arg(connect_timeout.to_string())
        .args(["-H", "Content-Type: text/xml", "--data-binary", "@-"])
        .arg(url)
        .env("KRB5CCNAME", ccache)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context(LoginHelperSnafu { program: "curl" })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(body.as_bytes())
            .await
            .context(LoginHelperSnafu { program: "curl" })?;
    }

    let output = child.wait_with_output().await.context(LoginHelperSnafu { program: "curl" })?;
    if !output.status.success() {
        return GssapiSnafu {
            reason: format!("sslLogin failed: {}", String::from_utf8_lossy(&output.stderr).trim()),
        }
        .fail();
    }
    String::from_utf8(output.stdout).context(LoginReplySnafu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_missing_login_helper_keeps_io_source() {
        let err = helper_output(Command::new("/nonexistent/kinit"), "kinit").await.unwrap_err();
        match &err {
            Error::LoginHelper { program, source } => {
                assert_eq!(program, "kinit");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().starts_with("failed to run kinit: "));
    }
}
