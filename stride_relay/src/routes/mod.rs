mod events;
mod health;
mod metrics;
mod socket;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/events", post(events::post_event))
        .route("/ws", get(socket::frame_socket))
}
