//! osbuild-worker binary.
//!
//! ```text
//! osbuild-worker [--unix] [--config PATH] <address>
//! ```
//!
//! With `--unix` (also accepted as `-unix`) the address is the path of the
//! queue server's Unix socket; otherwise it is a `host:port` reached over
//! HTTPS. The cache directory comes from `CACHE_DIRECTORY`.
//!
//! SIGTERM and SIGINT stop new claims. Jobs already running finish and report,
//! then the protector drops instance protection and the process exits 0.
//! Fatal errors and panics outside a job exit 1.

use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use osbuild_worker::config::AuthenticationConfig;
use osbuild_worker::config::DEFAULT_CONFIG_PATH;
use osbuild_worker::config::ProtectorBackendKind;
use osbuild_worker::env::CachePaths;
use osbuild_worker::handlers;
use osbuild_worker::protector::AwsProtection;
use osbuild_worker::protector::NoProtection;
use osbuild_worker::protector::ProtectionBackend;
use osbuild_worker::protector::Protector;
use osbuild_worker::protector::Timeouts;
use osbuild_worker::Runtime;
use osbuild_worker::WorkerConfig;
use osbuild_worker::WorkerEnv;
use osbuild_worker_client::Client;
use osbuild_worker_client::ClientConfig;
use osbuild_worker_client::Endpoint;
use osbuild_worker_client::Grant;
use osbuild_worker_client::OAuthConfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CA_CERT: &str = "/etc/osbuild-composer/ca-crt.pem";
const CLIENT_CERT: &str = "/etc/osbuild-composer/worker-crt.pem";
const CLIENT_KEY: &str = "/etc/osbuild-composer/worker-key.pem";

#[derive(Parser, Debug)]
#[command(name = "osbuild-worker", version, about = "Runs image build jobs claimed from the queue server")]
struct Args {
    /// Treat the address as the path of a Unix socket.
    #[arg(long)]
    unix: bool,

    /// Configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// `host:port` of the queue server, or a socket path with `--unix`.
    address: String,
}

/// Accept the single-dash `-unix` spelling.
fn normalize_args(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    args.into_iter()
        .map(|arg| if arg == "-unix" { OsString::from("--unix") } else { arg })
        .collect()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn read_secret(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(contents.trim().to_string())
}

fn oauth_config(auth: &AuthenticationConfig) -> Result<OAuthConfig> {
    let grant = match (&auth.offline_token_path, &auth.client_secret_path) {
        (Some(path), _) => Grant::RefreshToken {
            offline_token: read_secret(path).context("loading offline token")?,
        },
        (None, Some(path)) => Grant::ClientCredentials {
            client_secret: read_secret(path).context("loading client secret")?,
        },
        (None, None) => anyhow::bail!("[authentication] needs offline_token or client_secret"),
    };
    Ok(OAuthConfig {
        token_url: auth.oauth_url.clone(),
        client_id: auth.client_id.clone(),
        grant,
    })
}

fn client_config(args: &Args, config: &WorkerConfig) -> Result<ClientConfig> {
    let mut client = if args.unix {
        ClientConfig::new(Endpoint::Unix {
            path: PathBuf::from(&args.address),
        })
    } else {
        let mut client = ClientConfig::new(Endpoint::Https {
            address: args.address.clone(),
        });
        if Path::new(CA_CERT).exists() {
            client.ca_cert = Some(PathBuf::from(CA_CERT));
        }
        if config.authentication.is_none() {
            client.client_identity = Some((PathBuf::from(CLIENT_CERT), PathBuf::from(CLIENT_KEY)));
        }
        client
    };

    client.base_path = config.base_path.clone();
    client.proxy = config.composer.as_ref().and_then(|c| c.proxy.clone());
    if let Some(auth) = &config.authentication {
        client.oauth = Some(oauth_config(auth)?);
    }
    Ok(client)
}

fn protection_backend(env: &WorkerEnv) -> Arc<dyn ProtectionBackend> {
    match env.config.protector.backend {
        ProtectorBackendKind::None => Arc::new(NoProtection),
        ProtectorBackendKind::Aws => Arc::new(AwsProtection::new(env.aws())),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", err);
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!("failed to install SIGTERM handler: {}", err),
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
        _ = terminate => info!("received SIGTERM, initiating graceful shutdown"),
    }
}

async fn run(args: Args) -> Result<()> {
    let config = WorkerConfig::load(&args.config).context("loading configuration")?;

    let cache = std::env::var_os("CACHE_DIRECTORY").context("CACHE_DIRECTORY is not set")?;
    let paths = CachePaths::new(cache);
    paths.create_all().context("creating cache directories")?;

    let client = Arc::new(Client::new(client_config(&args, &config)?).context("building queue client")?);
    let env = Arc::new(WorkerEnv::new(config, paths));
    info!(address = %args.address, arch = %env.arch, host_os = %env.host_os, "starting osbuild worker");

    client.register_worker(&env.arch).await.context("registering with the queue server")?;

    let protector_cancel = CancellationToken::new();
    let (protector, protector_task) = Protector::spawn(
        protection_backend(&env),
        Timeouts::from(&env.config.protector),
        env.config.protector.queue_size,
        protector_cancel.clone(),
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    let registry = handlers::register_all(Arc::clone(&env));
    Runtime::new(client, registry, protector, env.arch.clone()).run(shutdown).await;

    protector_cancel.cancel();
    if let Err(e) = protector_task.await {
        error!(error = %e, "protector task failed");
    }
    info!("osbuild worker stopped");
    Ok(())
}

/// Run the worker on its own task so a panic is reported like any fatal error.
async fn supervise<F>(worker: F) -> ExitCode
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    match tokio::spawn(worker).await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
        Err(e) if e.is_panic() => {
            error!("fatal: worker panicked: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("fatal: worker task failed: {e}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse_from(normalize_args(std::env::args_os()));
    supervise(run(args)).await
}
