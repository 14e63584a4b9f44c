//! HTTP server assembly and lifecycle.

use crate::rate_limiter::{create_rate_limiter, gcra_rate_limit};
use crate::routes::{self, AppState};
use crate::ws;
use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::{middleware, Router};
use parley_kernel::Coordinator;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the full route table for `coordinator`.
pub fn build_router(coordinator: Arc<Coordinator>) -> Router {
    let state = Arc::new(AppState { coordinator });
    let limiter = create_rate_limiter();
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/.well-known/agent-card", get(routes::agent_card))
        .route("/discover", post(routes::discover))
        .route("/negotiate", post(routes::negotiate))
        .route("/message", post(routes::message))
        .route("/notify", post(routes::notify))
        .route("/tools", get(routes::list_tools))
        .route("/tools/execute", post(routes::execute_tool))
        .route("/session/revoke", post(routes::revoke_session))
        .route("/health", get(routes::health))
        .route("/stream", get(ws::stream_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(middleware::from_fn_with_state(limiter, gcra_rate_limit)),
        )
        .with_state(state)
}

/// Serve until the coordinator's supervisor signals shutdown.
pub async fn run_server(
    coordinator: Arc<Coordinator>,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    let mut shutdown = coordinator.supervisor.subscribe();
    let app = build_router(coordinator);

    info!("Parley coordinator listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|v| *v).await;
        info!("Server received shutdown signal");
    })
    .await
}
