use crate::{
    handler::{Acknowledgment, InboundEvent},
    server::SharedState,
};
use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use tracing::instrument;

impl IntoResponse for Acknowledgment {
    fn into_response(self) -> Response {
        (self.status, self.body).into_response()
    }
}

/// Gateway integration: one duplex-channel message per request, answered
/// with the transport acknowledgment.
#[instrument(skip(state, event))]
pub async fn post_event(
    State(state): State<SharedState>,
    Json(event): Json<InboundEvent>,
) -> Acknowledgment {
    state.handler.handle(&event).await
}
