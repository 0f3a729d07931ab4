//! `aws-ec2-copy` and `aws-ec2-share`.

use std::sync::Arc;

use async_trait::async_trait;
use osbuild_worker_api::ClientError;
use osbuild_worker_api::ErrorCode;
use osbuild_worker_api::jobs::AwsEc2CopyJob;
use osbuild_worker_api::jobs::AwsEc2CopyJobResult;
use osbuild_worker_api::jobs::AwsEc2ShareJob;
use osbuild_worker_api::jobs::AwsEc2ShareJobResult;
use tracing::error;
use tracing::info;

use crate::env::WorkerEnv;
use crate::error::Error;
use crate::handler::JobContext;
use crate::handler::TypedHandler;

/// Account list in the composer's `[a b]` notation.
fn account_list(accounts: &[String]) -> String {
    format!("[{}]", accounts.join(" "))
}

/// Classify a failed image copy.
pub fn copy_error(args: &AwsEc2CopyJob, err: &Error) -> ClientError {
    let reason = match err.aws_code() {
        Some("InvalidRegion") => format!("Invalid source region '{}'", args.source_region),
        Some("InvalidAMIID.Malformed") => format!("Malformed source ami id '{}'", args.ami),
        // copy-image reports a missing source as InvalidRequest
        Some("InvalidAMIID.NotFound") | Some("InvalidRequest") => format!("Source ami '{}' not found", args.ami),
        Some(_) => format!("Error copying ami {}", args.ami),
        None => {
            return ClientError::with_details(
                ErrorCode::SHARING_TARGET,
                format!("Unknown error copying ami '{}'", args.ami),
                err.to_string(),
            );
        }
    };
    ClientError::new(ErrorCode::SHARING_TARGET, reason)
}

/// Classify a failed share.
pub fn share_error(args: &AwsEc2ShareJob, err: &Error) -> ClientError {
    let accounts = account_list(&args.share_with_accounts);
    let reason = match err.aws_code() {
        Some("InvalidAMIID.Malformed") => format!("Malformed ami id '{}'", args.ami),
        Some("InvalidAMIID.NotFound") => format!("Ami '{}' not found in region '{}'", args.ami, args.region),
        Some("InvalidAMIAttributeItemValue") => format!("Invalid user id to share ami with: {accounts}"),
        Some(_) => format!("Error sharing image with target {accounts}"),
        None => {
            return ClientError::with_details(
                ErrorCode::SHARING_TARGET,
                format!("Unknown error sharing ami '{}' with {accounts}", args.ami),
                err.to_string(),
            );
        }
    };
    ClientError::new(ErrorCode::SHARING_TARGET, reason)
}

pub struct AwsEc2CopyHandler {
    env: Arc<WorkerEnv>,
}

impl AwsEc2CopyHandler {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl TypedHandler for AwsEc2CopyHandler {
    type Output = AwsEc2CopyJobResult;

    async fn execute(&self, ctx: &JobContext, result: &mut AwsEc2CopyJobResult) -> Result<(), ClientError> {
        let args: AwsEc2CopyJob = ctx.args()?;
        let aws = self.env.aws().with_region(args.target_region.clone());

        let ami = aws
            .copy_image(&args.target_name, &args.ami, &args.source_region, ctx.canceled())
            .await
            .map_err(|e| {
                error!(ami = %args.ami, error = %e, "error copying ami");
                copy_error(&args, &e)
            })?;

        info!(source = %args.ami, copy = %ami, region = %args.target_region, "ami copied");
        result.ami = ami;
        result.region = args.target_region;
        Ok(())
    }
}

pub struct AwsEc2ShareHandler {
    env: Arc<WorkerEnv>,
}

impl AwsEc2ShareHandler {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl TypedHandler for AwsEc2ShareHandler {
    type Output = AwsEc2ShareJobResult;

    async fn execute(&self, ctx: &JobContext, result: &mut AwsEc2ShareJobResult) -> Result<(), ClientError> {
        let mut args: AwsEc2ShareJob = ctx.args()?;

        if args.ami.is_empty() || args.region.is_empty() {
            if ctx.job().num_dependencies() != 1 {
                return Err(ClientError::new(
                    ErrorCode::NO_DYNAMIC_ARGS,
                    "An ec2 share job should have args or depend on an ec2 copy job",
                ));
            }
            let copied: AwsEc2CopyJobResult = ctx.dependency(0, "Error parsing dynamic args as ec2 copy job").await?;
            if copied.job_error.is_some() {
                return Err(ClientError::new(ErrorCode::JOB_DEPENDENCY, "AWSEC2CopyJob dependency failed"));
            }
            args.ami = copied.ami;
            args.region = copied.region;
        }

        let aws = self.env.aws().with_region(args.region.clone());
        aws.share_image(&args.ami, &args.share_with_accounts, ctx.canceled())
            .await
            .map_err(|e| {
                error!(ami = %args.ami, error = %e, "error sharing image");
                share_error(&args, &e)
            })?;

        info!(ami = %args.ami, region = %args.region, "ami shared");
        result.ami = args.ami;
        result.region = args.region;
        Ok(())
    }
}
