//! Unregistrar - unregister persistent volumes without destroying their storage

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use unregistrar::backoff::BackoffTracker;
use unregistrar::controller::{reconcile, Context, KubeVolumeClient};
use unregistrar::crd::{RegisterVolume, UnregisterVolume};
use unregistrar::dispatcher::{watch, Dispatcher, DispatcherConfig, DEFAULT_MAX_WORKERS};
use unregistrar::events::KubeEventPublisher;
use unregistrar::telemetry::{init_telemetry, TelemetryConfig};
use unregistrar::webhook::{self, ServeConfig, WebhookState};
use unregistrar::{CONTROLLER_NAME, DEFAULT_WEBHOOK_PORT};

/// Unregistrar - unregister persistent volumes without destroying their storage
#[derive(Parser, Debug)]
#[command(name = "unregistrar", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile UnregisterVolume resources (default mode)
    Controller(ControllerArgs),

    /// Serve the validating admission webhook
    Webhook(WebhookArgs),
}

/// Controller mode arguments
#[derive(Args, Debug)]
struct ControllerArgs {
    /// Maximum concurrent reconciliations (1..=1024)
    #[arg(long, env = "WORKER_THREADS_UNREGISTER_VOLUME", default_value_t = DEFAULT_MAX_WORKERS)]
    max_workers: usize,

    /// First requeue delay after a failure, in milliseconds
    #[arg(long, default_value_t = 1000)]
    min_backoff_ms: u64,

    /// Requeue delay ceiling in seconds; 0 disables the ceiling
    #[arg(long, default_value_t = 300)]
    max_backoff_secs: u64,

    /// Log as JSON
    #[arg(long, env = "LOG_JSON", default_value_t = true, action = clap::ArgAction::Set)]
    log_json: bool,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            min_backoff_ms: 1000,
            max_backoff_secs: 300,
            log_json: true,
        }
    }
}

/// Webhook mode arguments
#[derive(Args, Debug)]
struct WebhookArgs {
    /// Listen port
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    port: u16,

    /// PEM certificate; requires --tls-key
    #[arg(long, env = "WEBHOOK_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key; requires --tls-cert
    #[arg(long, env = "WEBHOOK_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Log as JSON
    #[arg(long, env = "LOG_JSON", default_value_t = true, action = clap::ArgAction::Set)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The webhook serves TLS through rustls, which needs a process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let unregister = serde_yaml::to_string(&UnregisterVolume::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        let register = serde_yaml::to_string(&RegisterVolume::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{unregister}---\n{register}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Webhook(args)) => run_webhook(args).await,
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::default()).await,
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        json: args.log_json,
        ..Default::default()
    })?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let mut backoff = BackoffTracker::new(Duration::from_millis(args.min_backoff_ms.max(1)));
    if args.max_backoff_secs > 0 {
        backoff = backoff.with_max_delay(Duration::from_secs(args.max_backoff_secs));
    }

    let shutdown = CancellationToken::new();
    let ctx = Arc::new(
        Context::new(
            Arc::new(KubeVolumeClient::new(client.clone())),
            Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)),
        )
        .with_backoff(backoff)
        .with_shutdown(shutdown.clone()),
    );

    let dispatcher = Dispatcher::new(DispatcherConfig::with_max_workers(args.max_workers));
    let feed = tokio::spawn(watch::feed(
        Api::<UnregisterVolume>::all(client),
        dispatcher.queue(),
        shutdown.clone(),
    ));
    let workers = tokio::spawn(dispatcher.run(
        move |key| reconcile(key, Arc::clone(&ctx)),
        shutdown.clone(),
    ));

    tracing::info!("Unregistrar controller started");
    shutdown_signal().await;
    tracing::info!("Shutdown signal received");
    shutdown.cancel();

    let _ = feed.await;
    workers
        .await
        .map_err(|e| anyhow::anyhow!("Dispatcher task failed: {}", e))?;
    tracing::info!("Unregistrar controller stopped");
    Ok(())
}

async fn run_webhook(args: WebhookArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        service_name: "unregistrar-webhook".to_string(),
        json: args.log_json,
    })?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let state = Arc::new(WebhookState::new(Arc::new(KubeVolumeClient::new(client))));
    let config = ServeConfig {
        addr: SocketAddr::from(([0, 0, 0, 0], args.port)),
        tls: args.tls_cert.zip(args.tls_key),
    };

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(webhook::serve(state, config, shutdown.clone()));

    let result = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
            (&mut server).await
        }
        res = &mut server => res,
    };

    result.map_err(|e| anyhow::anyhow!("Webhook task failed: {}", e))??;
    tracing::info!("Unregistrar webhook stopped");
    Ok(())
}

/// Ensure the operator's CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();

    tracing::info!("Installing UnregisterVolume CRD...");
    crds.patch(
        "unregistervolumes.unregistrar.dev",
        &params,
        &Patch::Apply(&UnregisterVolume::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install UnregisterVolume CRD: {}", e))?;

    tracing::info!("Installing RegisterVolume CRD...");
    crds.patch(
        "registervolumes.unregistrar.dev",
        &params,
        &Patch::Apply(&RegisterVolume::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install RegisterVolume CRD: {}", e))?;

    tracing::info!("All CRDs installed/updated");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
