//! API endpoints for sending and polling messages.
//!
//! Every call answers with a well-formed JSON body. Malformed requests are
//! acknowledged as "not queued" instead of failing at the extractor.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};

use crate::protocol::{BatchDelivery, Delivery, SendAck, SendRequest};

use super::SharedRelay;

/// Enqueue a message; the body names the destination.
pub async fn enqueue(
    State(relay): State<SharedRelay>,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> (StatusCode, Json<SendAck>) {
    match payload {
        Ok(Json(request)) => submit(relay, request).await,
        Err(rejection) => reject(rejection),
    }
}

/// Enqueue a message sent by `who`.
pub async fn send_from(
    State(relay): State<SharedRelay>,
    Path(who): Path<String>,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> (StatusCode, Json<SendAck>) {
    match payload {
        Ok(Json(mut request)) => {
            request.from = Some(who);
            submit(relay, request).await
        }
        Err(rejection) => reject(rejection),
    }
}

/// Hand out the oldest deliverable message for `who`.
pub async fn dequeue(State(relay): State<SharedRelay>, Path(who): Path<String>) -> Json<Delivery> {
    let envelope = tokio::task::spawn_blocking(move || relay.receive(&who))
        .await
        .unwrap_or_else(|e| {
            tracing::error!("dequeue task failed: {}", e);
            None
        });

    Json(Delivery::from(envelope))
}

/// Hand out every deliverable message for `who`.
pub async fn dequeue_all(
    State(relay): State<SharedRelay>,
    Path(who): Path<String>,
) -> Json<BatchDelivery> {
    let envelopes = tokio::task::spawn_blocking(move || relay.receive_all(&who))
        .await
        .unwrap_or_else(|e| {
            tracing::error!("dequeue_all task failed: {}", e);
            Vec::new()
        });

    Json(BatchDelivery::from(envelopes))
}

async fn submit(relay: SharedRelay, request: SendRequest) -> (StatusCode, Json<SendAck>) {
    let ack = tokio::task::spawn_blocking(move || relay.acknowledge(request))
        .await
        .unwrap_or_else(|e| {
            tracing::error!("enqueue task failed: {}", e);
            SendAck::failed("internal error")
        });

    let status = if ack.error.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(ack))
}

fn reject(rejection: JsonRejection) -> (StatusCode, Json<SendAck>) {
    tracing::debug!("Rejected request body: {}", rejection);
    (StatusCode::OK, Json(SendAck::rejected(rejection.body_text())))
}
