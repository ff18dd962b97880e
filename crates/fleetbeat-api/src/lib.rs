pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// The full `/api` router, without CORS.
pub fn router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/nodes", get(handlers::handle_nodes))
        .route("/nodes/{id}", get(handlers::handle_node_inspect))
        .route("/nodes/{id}/config", post(handlers::handle_node_config))
        .route("/nodes/{id}/command", post(handlers::handle_node_command))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut shutdown = state.shutdown.subscribe();
    let app = router(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.recv().await })
        .await?;
    Ok(())
}
