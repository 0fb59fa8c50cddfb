//! GPU cluster Health Check Runner (HCR)
//!
//! Runs as a single Deployment. Every tick it pairs eligible GPU nodes, runs a
//! health check Job per group, records verdicts on node labels and taints
//! nodes that fail a confirmatory second pass.

mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::Config;
use hcr_core::orchestrator::Orchestrator;
use hcr_k8s::client::K8sClient;
use hcr_k8s::job_executor::JobExecutor;
use hcr_k8s::registry::KubeRegistry;

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Wire the Kubernetes registry and executor into an orchestrator
async fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let orchestrator_config = config.to_orchestrator_config();
    let schema = orchestrator_config.schema();

    let client = K8sClient::new().await?;
    client
        .health_check()
        .await
        .context("Kubernetes API server is not reachable")?;

    let registry = Arc::new(
        KubeRegistry::new(client.clone()).with_gpu_resource(&config.kubernetes.gpu_resource),
    );
    let executor = Arc::new(
        JobExecutor::from_template_file(
            client,
            &config.kubernetes.namespace,
            &config.kubernetes.job_template,
            schema,
        )?
        .with_check_interval(config.kubernetes.check_interval),
    );

    Orchestrator::new(orchestrator_config, registry, executor).context("Invalid configuration")
}

/// Start the Prometheus metrics HTTP server
async fn start_metrics_server(port: u16) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = port, "Metrics server listening");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let metrics_output = prometheus::TextEncoder::new()
                .encode_to_string(&prometheus::gather())
                .unwrap_or_default();

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics_output.len(),
                metrics_output
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "HCR starting");

    // Load configuration
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = ?cli.config, "Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI and environment overrides
    cli.apply_overrides(&mut config);

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    info!(
        dry_run = config.dry_run,
        pairing_mode = %config.pairing_mode,
        nodes_per_test = config.nodes_per_test,
        "Configuration loaded"
    );

    let orchestrator = build_orchestrator(&config).await?;

    // Run single tick if --once flag is set
    if cli.once {
        let report = orchestrator.run_once().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    // Setup shutdown signal handler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }

        let _ = shutdown_tx.send(true);
    });

    // Start metrics server if enabled
    if config.metrics.enabled {
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    // Run main loop
    orchestrator.run(shutdown_rx).await?;

    info!("HCR shutdown complete");
    Ok(())
}
