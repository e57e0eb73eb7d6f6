use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{any, get};
use axum::{Json, Router};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use mediacache_proxy::admission::OriginAdmission;
use mediacache_proxy::cache_port::{CachePort, InMemoryCachePort};
use mediacache_proxy::config::Config;
use mediacache_proxy::handlers::{
    delete_handler, health_handler, media_handler, metrics_handler, options_handler,
    stats_handler, AppState,
};
use mediacache_proxy::logging;
use mediacache_proxy::metrics::Metrics;
use mediacache_proxy::origin_fetcher::{OriginFetch, OriginFetcher};
use mediacache_proxy::registry::{InMemoryRegistry, Registry};
use mediacache_proxy::usage::UsageAggregator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    logging::init(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "starting mediacache-proxy");

    let config = Arc::new(config);
    // Only bind a registry when one is actually configured; an operator who
    // sets `registered` mode without a backend gets a logged configuration
    // error on every request instead of a silently-empty registry.
    let registry: Option<Arc<dyn Registry>> = match config.admission.registry_backend.as_deref() {
        Some("memory") => Some(Arc::new(InMemoryRegistry::new())),
        Some(other) => {
            tracing::error!(backend = %other, "unknown REGISTRY_BACKEND, leaving registry unbound");
            None
        }
        None => None,
    };
    let cache: Arc<dyn CachePort> = Arc::new(InMemoryCachePort::new());
    let admission = Arc::new(OriginAdmission::new(
        &config.admission.mode,
        &config.admission.allowed_origins,
        &config.admission.blocked_origins,
        registry,
    ));
    let origin: Arc<dyn OriginFetch> = Arc::new(OriginFetcher::new(config.fetch.user_agent.clone()));
    // No `BillingStore` is wired by default; the flush loop below notices
    // this and exits immediately rather than spin polling a dead sink.
    let usage = Arc::new(UsageAggregator::new(None));
    let metrics = Arc::new(Metrics::new());

    let state = Arc::new(AppState {
        cache,
        admission,
        origin,
        usage: usage.clone(),
        metrics,
        config: config.clone(),
    });

    tokio::spawn(
        usage.run_flush_loop(std::time::Duration::from_secs(config.usage.flush_interval_secs)),
    );

    let app = build_router(state);

    let addr: SocketAddr = config.server.listen_addr.parse()?;
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(config.server.shutdown_grace_secs))
    .await?;

    info!("server shutdown complete");
    Ok(())
}

/// `/ping` shares `/health`'s body shape (§6) but is kept as its own thin
/// wrapper so a load balancer's health check and an operator's liveness
/// probe can be routed/logged independently if they diverge later.
async fn ping_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let _ = &state;
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

fn build_router(state: Arc<AppState>) -> Router {
    let operational = Router::new()
        .route("/health", get(health_handler))
        .route("/ping", get(ping_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler));

    let media = Router::new()
        .route(
            "/{*rest}",
            any(media_handler).options(options_handler).delete(delete_handler),
        );

    operational
        .merge(media)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

async fn shutdown_signal(grace_secs: u64) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(grace_secs, "shutdown signal received, draining in-flight requests");
    tokio::time::sleep(std::time::Duration::from_secs(grace_secs)).await;
}
