//! API router construction

use axum::{
    extract::DefaultBodyLimit,
    routing::{any, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::handlers;
use crate::state::BrokerState;

/// Build the public router
pub fn build_router(config: &ApiConfig, state: BrokerState) -> Router {
    let broker_routes: Router<BrokerState> = Router::new()
        .route("/broker/{token}", any(handlers::broker::forward))
        .route("/broker/{token}/{*path}", any(handlers::broker::forward))
        .layer(DefaultBodyLimit::max(config.request_body_limit));

    // Uploads are streamed and not subject to the body limit
    let stream_routes: Router<BrokerState> = Router::new()
        .route(
            "/response-data/{token}/{streaming_id}",
            post(handlers::response_data::response_data),
        )
        .layer(DefaultBodyLimit::disable());

    Router::new()
        .merge(broker_routes)
        .merge(stream_routes)
        .route(
            "/connection-status/{token}",
            get(handlers::status::connection_status),
        )
        .route("/connections", get(handlers::status::connections))
        .route("/healthcheck", get(handlers::health::healthcheck))
        .route("/metrics", get(handlers::health::prometheus))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
