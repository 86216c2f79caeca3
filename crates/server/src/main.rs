mod auth;
mod autopilot;
mod config;
mod db;
mod error;
mod manager;
mod ratelimit;
mod registry;
mod resource;
mod web;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::db::PostgresDirectory;
use crate::web::AppState;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/quill.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

/// Spawn one background service: a named loop that sleeps, then works.
fn spawn_service<F, Fut>(name: &'static str, interval: Duration, work: F) -> (&'static str, JoinHandle<()>)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let handle = tokio::spawn(async move {
        tracing::info!("{name} started");
        loop {
            tokio::time::sleep(interval).await;
            work().await;
        }
    });
    (name, handle)
}

/// Stop background services in reverse start order, swallowing
/// cancellation and reporting anything else.
async fn stop_services(mut services: Vec<(&'static str, JoinHandle<()>)>) {
    services.reverse();
    for (name, handle) in services {
        handle.abort();
        match handle.await {
            Err(error) if error.is_cancelled() => tracing::info!("{name} cancelled"),
            Err(error) => tracing::error!("{name} panicked: {error}"),
            Ok(()) => tracing::info!("{name} finished"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    // Load configuration
    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.api.port = p;
    }
    // Validate configuration semantics
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.api.host, config.server.api.port)
        .parse()
        .context("Invalid bind address")?;
    let task_interval = Duration::from_secs(config.server.api.task_interval);

    let directory = Arc::new(
        PostgresDirectory::connect(&config.server.postgres)
            .context("Failed to set up Postgres")?,
    );
    let state = Arc::new(AppState::new(config, directory));

    // Background services, one task per concern, started leaves-first.
    let mut services = Vec::new();
    services.push({
        let state = Arc::clone(&state);
        spawn_service("SweeperTask", task_interval, move || {
            let state = Arc::clone(&state);
            async move { state.registry.sweep(&state.resources).await }
        })
    });
    services.push({
        let state = Arc::clone(&state);
        spawn_service("EvictorTask", task_interval, move || {
            let state = Arc::clone(&state);
            async move { state.resources.evict_idle().await }
        })
    });
    services.push(("DispatcherTask", state.scheduler.spawn_dispatcher()));

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  Quill Control Plane v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Listening on http://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("Server ready, accepting connections");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("Server error")?;

    stop_services(services).await;

    tracing::info!("Quill server shut down cleanly");

    Ok(())
}
