//! HTTP surface of the payment service

pub mod health;
pub mod payments;
pub mod webview;

use crate::config::Config;
use crate::error::PaymentError;
use crate::service::PaymentService;
use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use http::StatusCode;
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub service: Arc<PaymentService>,
    /// Which pending-payload store backs the service
    pub store_backend: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/payment/initiate", post(payments::initiate))
        .route(
            "/payment/callback",
            get(payments::callback_get).post(payments::callback_post),
        )
        .route("/payment/status/:txn_id", get(payments::status))
        .route("/payment/status/:txn_id/retry", post(payments::retry))
        .route("/payment/status/:txn_id/confirm", post(payments::confirm))
        .route("/webview/navigate", post(webview::navigate))
        .route("/webview/location", post(webview::location))
        .route("/webview/message", post(webview::message))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl PaymentError {
    fn kind(&self) -> &'static str {
        match self {
            PaymentError::Validation { .. } => "validation_error",
            PaymentError::VerificationFailed { .. } => "verification_failed",
            PaymentError::TransientNetwork { .. } => "network_error",
            PaymentError::GatewayRejected { .. } => "gateway_rejected",
            PaymentError::Local { .. } => "local_error",
            PaymentError::Store { .. } => "store_error",
            PaymentError::Configuration { .. } => "configuration_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            PaymentError::Validation { .. } | PaymentError::VerificationFailed { .. } => {
                StatusCode::BAD_REQUEST
            }
            PaymentError::GatewayRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PaymentError::TransientNetwork { .. } => StatusCode::BAD_GATEWAY,
            PaymentError::Store { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PaymentError::Local { .. } | PaymentError::Configuration { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            error: self.kind(),
            message: self.user_message(),
        };
        (status, Json(body)).into_response()
    }
}
