use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ConnectInfo;
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use axum_prometheus::PrometheusMetricLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use realtime_gateway::auth::AllowAllDirectory;
use realtime_gateway::config::Config;
use realtime_gateway::offline::OfflineDispatcher;
use realtime_gateway::state::AppState;
use realtime_gateway::{health, ingestion, upgrade};

/// Restricts `/metrics` to loopback connections only.
async fn require_loopback(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "realtime_gateway=info,tower_http=info,rdkafka=warn"
            .parse()
            .unwrap()
    });

    let config = Config::load().expect("failed to load configuration");

    if !config.is_dev {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("realtime gateway starting");

    let offline = OfflineDispatcher::new(&config.kafka).expect("failed to construct offline dispatcher");
    let config = Arc::new(config);
    let state = AppState::new(config.clone(), Arc::new(AllowAllDirectory), Arc::new(offline));

    // Background maintenance: stale-connection sweep and presence eviction.
    state
        .manager
        .clone()
        .spawn_cleanup_task(config.websocket.cleanup_interval(), config.websocket.stale_connection_timeout());
    state
        .presence
        .clone()
        .spawn_eviction_task(config.websocket.cleanup_interval(), config.websocket.stale_connection_timeout());

    let cors = if config.is_dev {
        info!("CORS: permissive (dev mode)");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = config
            .websocket
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        if origins.is_empty() {
            tracing::warn!("CORS: no allowed_origins configured — all cross-origin requests denied");
        }
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([
                header::CONTENT_TYPE,
                header::HeaderName::from_static("x-user-id"),
                header::HeaderName::from_static("x-device-id"),
                header::HeaderName::from_static("x-platform"),
                header::HeaderName::from_static("x-internal-service-secret"),
                header::HeaderName::from_static("x-source-service"),
            ])
    };

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    // Global per-IP rate limit on the REST surface (the WebSocket's own
    // per-message limiter is enforced inside the connection pumps).
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(40)
            .finish()
            .expect("invalid governor configuration"),
    );

    let app = AxumRouter::new()
        .route("/ws", get(upgrade::upgrade))
        .route("/broadcast", post(ingestion::broadcast))
        .route("/health", get(health::health))
        .route("/live", get(health::live))
        .route("/ready", get(health::ready))
        .route(
            "/metrics",
            get(move || async move { metric_handle.render() })
                .route_layer(middleware::from_fn(require_loopback)),
        )
        .layer(GovernorLayer { config: governor_conf })
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(prometheus_layer)
        .layer(cors)
        .with_state(state.clone());

    let addr = config.server.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");
    info!("listening on {addr}");

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(state.clone()));

    if let Err(e) = server.await {
        tracing::error!(error = ?e, "server exited with error");
    }

    info!("drain complete, exiting");
}

/// Waits for SIGINT/SIGTERM, then flips the shutdown flag so `/ready` and
/// `/ws` start rejecting new work, closes every live connection, and gives
/// in-flight sends `shutdown.drain_timeout` to land before returning.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining");
    state.begin_shutdown();
    state.manager.close_all().await;
    tokio::time::sleep(state.config.shutdown.drain_timeout()).await;
}
