use crate::server::SharedState;
use axum::{extract::State, response::Json};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    status: String,
    open_connections: usize,
}

pub async fn healthcheck(State(state): State<SharedState>) -> Json<Health> {
    Json(Health {
        status: "Available".into(),
        open_connections: state.registry.len(),
    })
}
