//! Lemur gateway - main entry point
//!
//! Obtains the gateway's serving certificate from a Lemur CA, serves the
//! application and admin listeners over TLS and keeps the certificate fresh
//! in the background.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lemur_common::{init_tracing, CertMetrics};
use lemur_config::validate::validate_full;
use lemur_config::Config;
use lemur_gateway::auth;
use lemur_gateway::certs::{CaClient, CertificateSource, KeypairReloader, RefreshScheduler};
use lemur_gateway::request::CertRequestService;
use lemur_gateway::server::{self, handle_admin, handle_app};

/// Lemur gateway - TLS front door with CA-managed certificates
#[derive(Parser, Debug)]
#[command(name = "lemur-gateway")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "LEMUR_GATEWAY_CONFIG",
        default_value = "config.toml"
    )]
    config: String,

    /// Application listener, as a port or host:port
    #[arg(long = "listen", env = "HOST_PORT")]
    listen: Option<String>,

    /// Admin listener, as a port or host:port
    #[arg(long = "admin-listen", env = "ADMIN_PORT")]
    admin_listen: Option<String>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test {
        /// Configuration file to test
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
    },
    /// Run the gateway (default)
    Run {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (test, path) = match &cli.command {
        Some(Commands::Test { config }) => (true, config.clone()),
        Some(Commands::Run { config }) => (cli.test, config.clone()),
        None => (cli.test, None),
    };
    let path = path.unwrap_or_else(|| cli.config.clone());

    let mut config = Config::from_file(&path)
        .with_context(|| format!("Failed to load configuration file {}", path))?;
    config
        .apply_listen_overrides(cli.listen.as_deref(), cli.admin_listen.as_deref())
        .context("Invalid listener override")?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }

    init_tracing(&config.logging).context("Failed to initialize logging")?;
    let config = config.validated().context("Configuration validation failed")?;

    if test {
        test_config(&config, &path).await
    } else {
        run_server(config).await
    }
}

async fn test_config(config: &Config, path: &str) -> Result<()> {
    info!("Testing configuration file: {}", path);

    let result = validate_full(config).await;
    for warning in &result.warnings {
        warn!("{}", warning);
    }
    if !result.is_ok() {
        for error in &result.errors {
            eprintln!("lemur-gateway: {}", error);
        }
        bail!(
            "configuration file {} test failed with {} error(s)",
            path,
            result.errors.len()
        );
    }

    println!(
        "lemur-gateway: configuration file {} test is successful ({} warning(s))",
        path,
        result.warnings.len()
    );
    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    info!(
        listen = %config.server.listen,
        admin_listen = %config.server.admin_listen,
        ca = %config.ca.base_url,
        "Starting lemur-gateway"
    );

    let authenticator =
        auth::from_config(&config.auth).context("Unable to set up request authentication")?;
    let metrics = CertMetrics::new().context("Failed to create metrics registry")?;
    let ca: Arc<dyn CertificateSource> =
        Arc::new(CaClient::new(&config.ca).context("Failed to create CA client")?);

    let reloader = Arc::new(
        KeypairReloader::new(&config, Arc::clone(&ca), metrics.clone())
            .await
            .context("Unable to obtain the server certificate")?,
    );
    let tls = server::server_config(Arc::clone(&reloader))?;
    let app_listener = server::bind(config.server.listen).await?;
    let admin_listener = server::bind(config.server.admin_listen).await?;

    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    let scheduler = RefreshScheduler::new(Arc::clone(&reloader), config.tls.refresh_interval());
    tasks.spawn(scheduler.run(shutdown.clone()));

    let service = Arc::new(CertRequestService::new(ca, metrics.clone()));
    tasks.spawn(server::serve(
        "app",
        app_listener,
        Arc::clone(&tls),
        move |req| {
            let service = Arc::clone(&service);
            let authenticator = Arc::clone(&authenticator);
            async move { handle_app(&service, authenticator.as_ref(), req).await }
        },
        shutdown.clone(),
    ));

    tasks.spawn(server::serve(
        "admin",
        admin_listener,
        tls,
        move |req| {
            let metrics = metrics.clone();
            async move { handle_admin(&metrics, req).await }
        },
        shutdown.clone(),
    ));

    info!("lemur-gateway started");

    wait_for_shutdown().await;
    info!("Received shutdown signal, initiating graceful shutdown");
    shutdown.cancel();

    while tasks.join_next().await.is_some() {}
    info!("lemur-gateway stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
