use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Form, Json,
};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use crate::api::AppState;
use crate::error::PaymentError;
use crate::payments::types::GatewayCallback;
use crate::poller::PollOutcome;
use crate::service::{CallbackResponse, InitiatePayment};
use crate::transaction::{TransactionState, Transition};

/// Query parameter some return pages use to forward their full location
const RAW_LOCATION_PARAM: &str = "raw_location";

#[derive(Debug, Serialize)]
pub struct InitiateResponse {
    pub transaction_id: String,
    pub gateway_url: String,
    pub fields: HashMap<&'static str, String>,
    pub form_html: String,
    pub state: TransactionState,
}

pub async fn initiate(
    State(state): State<AppState>,
    Json(body): Json<InitiatePayment>,
) -> Result<Json<InitiateResponse>, PaymentError> {
    let initiated = state.service.initiate(body).await?;
    let fields = initiated
        .signed
        .form_fields()
        .into_iter()
        .map(|(name, value)| (name, value.to_string()))
        .collect();

    Ok(Json(InitiateResponse {
        transaction_id: initiated.transaction_id.clone(),
        gateway_url: initiated.gateway_url.clone(),
        form_html: initiated.auto_submit_form(),
        fields,
        state: initiated.state,
    }))
}

pub async fn callback_get(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<CallbackResponse>, PaymentError> {
    let callback = merge_callback(query, HashMap::new());
    Ok(Json(state.service.handle_callback(callback).await?))
}

pub async fn callback_post(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    Form(body): Form<HashMap<String, String>>,
) -> Result<Json<CallbackResponse>, PaymentError> {
    let callback = merge_callback(query, body);
    Ok(Json(state.service.handle_callback(callback).await?))
}

/// Query string first, form body over it, then anything still missing from
/// the forwarded location
pub fn merge_callback(
    mut query: HashMap<String, String>,
    body: HashMap<String, String>,
) -> GatewayCallback {
    let mut raw_location = query.remove(RAW_LOCATION_PARAM);
    let mut callback = GatewayCallback::from_pairs(query);

    for (key, value) in body {
        if key == RAW_LOCATION_PARAM {
            raw_location = Some(value);
        } else {
            callback.insert(key, value);
        }
    }

    if let Some(location) = raw_location {
        match url::Url::parse(&location) {
            Ok(parsed) => {
                for (key, value) in parsed.query_pairs() {
                    callback.insert_missing(key.into_owned(), value.into_owned());
                }
            }
            Err(e) => debug!("Ignoring unparseable raw location: {}", e),
        }
    }

    callback
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub transaction_id: String,
    #[serde(flatten)]
    pub state: TransactionState,
    pub processing: bool,
}

pub async fn status(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
) -> Response {
    match state.service.status(&txn_id).await {
        Some(transaction_state) => Json(StatusResponse {
            transaction_id: txn_id,
            processing: transaction_state.is_processing(),
            state: transaction_state,
        })
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "not_found",
                "message": "Unknown transaction"
            })),
        )
            .into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub transaction_id: String,
    pub outcome: PollOutcome,
}

pub async fn retry(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
) -> Result<Json<RetryResponse>, PaymentError> {
    let outcome = state.service.retry(&txn_id).await?;
    Ok(Json(RetryResponse {
        transaction_id: txn_id,
        outcome,
    }))
}

/// "I completed the payment"
pub async fn confirm(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
) -> Result<Json<Transition>, PaymentError> {
    Ok(Json(state.service.manual_confirmation(&txn_id).await?))
}
