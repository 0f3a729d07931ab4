//! Scale-in protection for EC2 instances in an autoscaling group.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use snafu::ResultExt;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ProtectionBackend;
use crate::cloud::AwsCli;
use crate::error;
use crate::error::Error;
use crate::error::Result;

pub const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254";
const IMDS_TOKEN_TTL_SECS: &str = "21600";
const IMDS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Instance {
    id: String,
    region: String,
    group: String,
}

/// Protects this instance through the autoscaling API.
///
/// The instance id, region and group name are looked up on first use.
pub struct AwsProtection {
    cli: AwsCli,
    http: reqwest::Client,
    imds: String,
    instance: OnceCell<Instance>,
}

impl AwsProtection {
    pub fn new(cli: AwsCli) -> Self {
        Self::with_metadata_endpoint(cli, DEFAULT_IMDS_ENDPOINT)
    }

    pub fn with_metadata_endpoint(cli: AwsCli, imds: impl Into<String>) -> Self {
        Self {
            cli,
            http: reqwest::Client::new(),
            imds: imds.into().trim_end_matches('/').to_string(),
            instance: OnceCell::new(),
        }
    }

    async fn metadata(&self, token: &str, path: &str) -> Result<String> {
        let url = format!("{}/latest/meta-data/{path}", self.imds);
        let response = self
            .http
            .get(&url)
            .header("X-aws-ec2-metadata-token", token)
            .timeout(IMDS_TIMEOUT)
            .send()
            .await
            .context(error::HttpSnafu { url: url.clone() })?;
        if !response.status().is_success() {
            return error::HttpStatusSnafu {
                url,
                status: response.status().as_u16(),
            }
            .fail();
        }
        let text = response.text().await.context(error::HttpSnafu { url })?;
        Ok(text.trim().to_string())
    }

    async fn session_token(&self) -> Result<String> {
        let url = format!("{}/latest/api/token", self.imds);
        let response = self
            .http
            .put(&url)
            .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECS)
            .timeout(IMDS_TIMEOUT)
            .send()
            .await
            .context(error::HttpSnafu { url: url.clone() })?;
        if !response.status().is_success() {
            return error::InstanceMetadataSnafu {
                reason: format!("token request returned {}", response.status()),
            }
            .fail();
        }
        response.text().await.context(error::HttpSnafu { url })
    }

    async fn lookup(&self) -> Result<Instance> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Described {
            auto_scaling_instances: Vec<AsgInstance>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct AsgInstance {
            auto_scaling_group_name: String,
        }

        let token = self.session_token().await?;
        let id = self.metadata(&token, "instance-id").await?;
        let region = self.metadata(&token, "placement/region").await?;

        let cli = self.cli.clone().with_region(&region);
        let described: Described = cli
            .run_json(
                "autoscaling",
                "describe-auto-scaling-instances",
                &["--instance-ids".to_string(), id.clone()],
                &CancellationToken::new(),
            )
            .await?;
        let group = described
            .auto_scaling_instances
            .into_iter()
            .next()
            .map(|i| i.auto_scaling_group_name)
            .ok_or_else(|| Error::InstanceMetadata {
                reason: format!("instance {id} is not part of an autoscaling group"),
            })?;

        info!(instance = %id, %region, %group, "resolved autoscaling group");
        Ok(Instance { id, region, group })
    }
}

#[async_trait]
impl ProtectionBackend for AwsProtection {
    async fn set_protection(&self, protected: bool) -> Result<()> {
        let instance = self.instance.get_or_try_init(|| self.lookup()).await?;
        let flag = if protected {
            "--protected-from-scale-in"
        } else {
            "--no-protected-from-scale-in"
        };
        let args = [
            "--instance-ids",
            instance.id.as_str(),
            "--auto-scaling-group-name",
            instance.group.as_str(),
            flag,
        ]
        .map(str::to_string);
        self.cli
            .clone()
            .with_region(&instance.region)
            .run_raw("autoscaling", "set-instance-protection", &args, &CancellationToken::new())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::http::HeaderMap;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::routing::put;
    use tokio::net::TcpListener;

    use super::*;

    async fn spawn_imds() -> String {
        async fn token(headers: HeaderMap) -> (StatusCode, String) {
            if headers.contains_key("x-aws-ec2-metadata-token-ttl-seconds") {
                (StatusCode::OK, "tok".into())
            } else {
                (StatusCode::BAD_REQUEST, String::new())
            }
        }
        async fn instance_id(headers: HeaderMap) -> (StatusCode, String) {
            match headers.get("x-aws-ec2-metadata-token") {
                Some(v) if v == "tok" => (StatusCode::OK, "i-0123\n".into()),
                _ => (StatusCode::UNAUTHORIZED, String::new()),
            }
        }

        let router = Router::new()
            .route("/latest/api/token", put(token))
            .route("/latest/meta-data/instance-id", get(instance_id))
            .route("/latest/meta-data/placement/region", get(|| async { "eu-central-1" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_instance_metadata_uses_session_token() {
        let imds = spawn_imds().await;
        let backend = AwsProtection::with_metadata_endpoint(AwsCli::new("aws"), imds);
        let token = backend.session_token().await.unwrap();
        assert_eq!(token, "tok");
        assert_eq!(backend.metadata(&token, "instance-id").await.unwrap(), "i-0123");
        assert_eq!(backend.metadata(&token, "placement/region").await.unwrap(), "eu-central-1");
        assert!(backend.metadata("wrong", "instance-id").await.is_err());
    }
}
