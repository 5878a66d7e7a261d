use axum::{extract::State, Json};
use serde::Deserialize;

use crate::api::AppState;
use crate::deeplink::{BridgeAction, NavigationDecision};
use crate::error::PaymentError;
use crate::service::SurfaceExit;

#[derive(Debug, Deserialize)]
pub struct NavigateRequest {
    pub url: String,
}

pub async fn navigate(
    State(state): State<AppState>,
    Json(body): Json<NavigateRequest>,
) -> Json<NavigationDecision> {
    Json(state.service.navigate(&body.url))
}

#[derive(Debug, Deserialize)]
pub struct LocationRequest {
    pub url: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

/// `null` while the gateway flow is still running
pub async fn location(
    State(state): State<AppState>,
    Json(body): Json<LocationRequest>,
) -> Result<Json<Option<SurfaceExit>>, PaymentError> {
    let exit = state
        .service
        .location_changed(body.transaction_id.as_deref(), &body.url)
        .await?;
    Ok(Json(exit))
}

/// Raw bridge payload as posted by the page
pub async fn message(State(state): State<AppState>, body: String) -> Json<BridgeAction> {
    Json(state.service.bridge_message(&body))
}
