use anyhow::Context;
use clap::Parser;
use stagepay_service::config::ServiceConfig;
use stagepay_service::sweeper::OverdueSweeper;
use stagepay_service::{build_router, with_cors, ServiceState};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// StagePay daemon CLI
#[derive(Debug, Parser)]
#[command(name = "stagepayd", version, about = "Milestone payment-stage REST service")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "STAGEPAY_CONFIG")]
    config: Option<String>,

    /// Listen address, overrides server.listen_addr
    #[arg(short, long, env = "STAGEPAY_LISTEN_ADDR")]
    listen: Option<SocketAddr>,

    /// Log level, overrides logging.level
    #[arg(long, env = "STAGEPAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "STAGEPAY_LOG_JSON")]
    json: bool,
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        ServiceConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.json;

    init_tracing(&config.logging.level, config.logging.json);

    let state = ServiceState::bootstrap(&config)
        .await
        .context("failed to start payment-stage engine")?;

    let mut app = build_router(state.clone());
    if config.server.enable_cors {
        app = with_cors(app);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = if config.sweeper.enabled {
        let sweeper = OverdueSweeper::new(
            state.engine.clone(),
            Duration::from_secs(config.sweeper.interval_secs),
        );
        Some(sweeper.spawn(shutdown_rx))
    } else {
        None
    };

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    tracing::info!("stagepay-service listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("stagepay-service shutting down");
    let _ = shutdown_tx.send(true);
    if let Some(sweeper) = sweeper {
        sweeper.await?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
