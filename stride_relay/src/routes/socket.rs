use crate::{
    handler::{InboundEvent, DEFAULT_ROUTE, FRAME_ROUTE},
    server::SharedState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Deserialize)]
struct RouteSelector {
    action: Option<String>,
}

/// Mirrors gateway route selection on the message's `action` field.
fn route_key_for(message: &str) -> &'static str {
    match serde_json::from_str::<RouteSelector>(message) {
        Ok(RouteSelector {
            action: Some(action),
        }) if action == FRAME_ROUTE => FRAME_ROUTE,
        _ => DEFAULT_ROUTE,
    }
}

pub async fn frame_socket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let domain_name = headers
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .unwrap_or("localhost")
        .to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, state, domain_name))
}

async fn handle_socket(socket: WebSocket, state: SharedState, domain_name: String) {
    let (connection_id, outbound) = state.registry.register();
    tracing::info!("Connection {} opened", connection_id);

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        let mut outbound = UnboundedReceiverStream::new(outbound);
        while let Some(message) = outbound.next().await {
            if let Err(e) = sink.send(Message::Text(message.into())).await {
                tracing::debug!("Socket writer stopped: {}", e);
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let text = text.as_str();
                let event = InboundEvent::new(
                    &connection_id,
                    route_key_for(text),
                    &domain_name,
                    &state.stage,
                    Some(text.to_string()),
                );
                let ack = state.handler.handle(&event).await;
                tracing::debug!("Acknowledged with {}: {}", ack.status, ack.body);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Connection {} errored: {}", connection_id, e);
                break;
            }
        }
    }

    state.registry.unregister(&connection_id);
    if let Err(e) = writer.await {
        tracing::error!("Socket writer for {} failed: {:?}", connection_id, e);
    }
    tracing::info!("Connection {} closed", connection_id);
}
