//! FluxSeries Server - HTTP and memcached front doors for the engine

mod api;
mod config;
mod protocol;

use anyhow::Context;
use clap::Parser;
use config::ServerArgs;
use fluxseries_core::SeriesEngine;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    init_logging(args.log_json);

    info!("Starting FluxSeries server...");
    info!("Data directory: {:?}", args.root);

    let engine = SeriesEngine::open(args.engine_config())
        .with_context(|| format!("opening data directory {:?}", args.root))?;
    let engine = Arc::new(engine);

    let app = api::create_router(engine.clone(), args.log_access);

    let mc_task = match &args.memcbind {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding memcached listener to {}", addr))?;
            Some(tokio::spawn(protocol::memcached::serve(
                listener,
                engine.clone(),
            )))
        }
        None => None,
    };

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("binding HTTP listener to {}", args.addr))?;
    info!("FluxSeries server listening on http://{}", args.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(task) = mc_task {
        task.abort();
    }

    let bound = args.shutdown_timeout;
    tokio::task::spawn_blocking(move || engine.shutdown(bound))
        .await?
        .with_context(|| format!("databases did not close within {:?}", bound))?;

    info!("FluxSeries server stopped");
    Ok(())
}
