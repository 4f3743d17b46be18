use axum::Router;
use axum::routing::{delete, get};
use tower_http::cors::CorsLayer;

use super::routes;
use super::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/downloads",
            get(routes::list_downloads).post(routes::create_download),
        )
        .route("/api/downloads/history", delete(routes::clear_history))
        .route(
            "/api/downloads/{id}",
            get(routes::get_download).delete(routes::cancel_download),
        )
        .route(
            "/api/settings",
            get(routes::get_settings).post(routes::update_settings),
        )
        .route("/api/models/search", get(routes::search_models))
        .route("/api/models/types", get(routes::model_types))
        .route("/api/models/{id}", get(routes::get_model))
        .route("/api/models/{id}/versions", get(routes::get_model_versions))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
