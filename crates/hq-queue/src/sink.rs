//! Inbound webhook endpoint answering the way a healthy receiver does.
//!
//! Point a worker's webhook URL at it to exercise the outbound path end to
//! end.

use axum::body::Bytes;
use axum::routing::post;
use axum::Router;
use tracing::info;

pub fn router() -> Router {
    Router::new().route("/webhook", post(webhook_handler))
}

// Any body is accepted, with or without a JSON content type
async fn webhook_handler(body: Bytes) -> &'static str {
    info!(body = %String::from_utf8_lossy(&body), "Webhook received");
    "OK"
}
