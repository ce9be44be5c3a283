//! The thin HTTP layer over the core services.

use crate::AppState;
use axum::http::header;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

mod http;
mod ws;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-admin-token"),
        ]);

    let request_timeout = Duration::from_millis(state.config.request_timeout_ms.max(1_000));

    Router::new()
        .route("/healthz", get(http::healthz))
        .route("/bet", post(http::place_bet))
        .route("/cashout", post(http::cashout))
        .route("/round/status", get(http::round_status))
        .route("/round/history", get(http::round_history))
        .route("/round/:round_id", get(http::round_detail))
        .route("/commitments/latest", get(http::latest_commitment))
        .route("/reveal/:round_id", get(http::reveal))
        .route("/payments/deposit", post(http::deposit))
        .route("/payments/withdraw", post(http::withdraw))
        .route("/payments/status/:transaction_id", get(http::payment_status))
        .route("/payments/history", get(http::payment_history))
        .route("/admin/refund/:bet_id", post(http::admin_refund))
        .route("/stream", get(ws::stream))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
