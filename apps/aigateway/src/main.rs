mod bootstrap;
mod cli;
mod config;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = cli::CliArgs::parse();
    let patch = config::ConfigPatch {
        host: args.host,
        port: args.port,
        api_keys: args.api_keys.map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        }),
    };
    let app_config = config::load(args.config.as_deref(), patch)?;

    let gateway = bootstrap::build(app_config)?;

    let listener = tokio::net::TcpListener::bind(&gateway.bind).await?;
    tracing::info!(bind = %gateway.bind, "aigateway listening");

    axum::serve(listener, gateway.router)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    gateway.registry.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
