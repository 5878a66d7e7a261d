//! HTTP routes exercised through the router without binding a socket

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use recharge_payments::api::{self, AppState};
use recharge_payments::config::{
    BackendSettings, Config, GatewayConfig, PollerSettings, ServerConfig, StoreSettings,
};
use recharge_payments::deeplink::ClientLauncher;
use recharge_payments::payments::traits::{StatusBackend, StatusCheckRequest};
use recharge_payments::payments::types::{
    GatewayCallback, PendingPayload, PolledStatus, TransactionStatusResult,
};
use recharge_payments::payments::{CallbackVerifier, RequestSigner};
use recharge_payments::service::PaymentService;
use recharge_payments::store::PendingPayloadStore;
use recharge_payments::PaymentResult;
use serde_json::{json, Value};
use sha2::{Digest, Sha512};
use std::sync::Arc;
use tower::ServiceExt;

struct AlwaysPending;

#[async_trait]
impl StatusBackend for AlwaysPending {
    async fn check_status(
        &self,
        _request: &StatusCheckRequest,
    ) -> PaymentResult<TransactionStatusResult> {
        Ok(TransactionStatusResult::with_status(PolledStatus::Pending))
    }

    async fn fetch_pending_payload(
        &self,
        _transaction_id: &str,
    ) -> PaymentResult<Option<PendingPayload>> {
        Ok(None)
    }
}

fn test_config() -> Config {
    Config {
        server: ServerConfig::default(),
        gateway: GatewayConfig {
            merchant_key: "gtKFFx".to_string(),
            salt: "eCwWELxi".to_string(),
            callback_base_url: "https://pay.example.com".to_string(),
            ..GatewayConfig::default()
        },
        backend: BackendSettings::default(),
        poller: PollerSettings::default(),
        store: StoreSettings::default(),
    }
}

fn app() -> (Router, Arc<PaymentService>) {
    let config = test_config();
    let credentials = config.gateway.credentials();
    let service = Arc::new(PaymentService::new(
        RequestSigner::new(credentials.clone(), config.gateway.service_provider.clone()),
        CallbackVerifier::new(credentials),
        PendingPayloadStore::in_memory(),
        Arc::new(AlwaysPending),
        Arc::new(ClientLauncher),
        config.service_settings(),
    ));
    let state = AppState {
        config: Arc::new(config),
        service: Arc::clone(&service),
        store_backend: "memory",
    };
    (api::router(state), service)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn initiate_body() -> Value {
    json!({
        "amount": 10,
        "product_info": "DTH Recharge",
        "payer_name": "Ravi",
        "payer_email": "ravi@example.com",
        "payer_phone": "9123456780",
        "transaction_id": "T42",
        "operator_id": 7
    })
}

#[tokio::test]
async fn test_health_reports_configuration() {
    let (app, _service) = app();
    let (status, body) = send(
        &app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "memory");
    assert_eq!(body["gateway_configured"], true);
}

#[tokio::test]
async fn test_initiate_then_status() {
    let (app, _service) = app();
    let (status, body) = send(&app, post_json("/payment/initiate", initiate_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transaction_id"], "T42");
    assert_eq!(body["fields"]["amount"], "10.00");
    assert_eq!(
        body["fields"]["surl"],
        "https://pay.example.com/payment/callback"
    );
    assert!(body["form_html"].as_str().unwrap().contains("<form"));

    let (status, body) = send(
        &app,
        Request::builder()
            .uri("/payment/status/T42")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "awaiting_redirect");
    assert_eq!(body["processing"], true);
}

#[tokio::test]
async fn test_invalid_amount_is_a_validation_error() {
    let (app, _service) = app();
    let mut body = initiate_body();
    body["amount"] = json!(0);
    let (status, body) = send(&app, post_json("/payment/initiate", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn test_unknown_transaction_status_is_not_found() {
    let (app, _service) = app();
    let (status, _) = send(
        &app,
        Request::builder()
            .uri("/payment/status/NOPE")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_form_posted_callback_is_verified() {
    let (app, service) = app();
    send(&app, post_json("/payment/initiate", initiate_body())).await;

    let mut callback = GatewayCallback::from_pairs([
        ("txnid", "T42"),
        ("amount", "10.00"),
        ("productinfo", "DTH Recharge"),
        ("firstname", "Ravi"),
        ("email", "ravi@example.com"),
        ("status", "success"),
        ("mode", "CC"),
    ]);
    let hash_input = CallbackVerifier::new(test_config().gateway.credentials())
        .expected_hash_input(&callback)
        .unwrap();
    callback.insert("hash", hex::encode(Sha512::digest(hash_input.as_bytes())));

    let form = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(callback.fields().iter())
        .finish();
    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/payment/callback")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(form))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["txn_id"], "T42");
    assert_eq!(body["transactionId"], "T42");
    assert_eq!(body["paymentStatus"], "success");
    assert_eq!(body["paymentMethod"], "CC");
    assert_eq!(body["isPaymentVerified"], true);
    assert!(service.status("T42").await.unwrap().is_terminal());
}

#[tokio::test]
async fn test_manual_confirmation_parks_pending() {
    let (app, service) = app();
    send(&app, post_json("/payment/initiate", initiate_body())).await;

    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/payment/status/T42/confirm")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "moved");
    assert_eq!(body["to"]["status"], "pending");
    service.stop();
}

#[tokio::test]
async fn test_webview_routes() {
    let (app, _service) = app();

    let (status, body) = send(
        &app,
        post_json(
            "/webview/navigate",
            json!({ "url": "intent://upi/pay?pa=x&pn=y#Intent;scheme=upi;package=com.example;end" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allow"], false);
    assert_eq!(body["dispatched_externally"], true);
    assert_eq!(body["launched_url"], "upi://pay?pa=x&pn=y");

    let (_, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/webview/message")
            .body(Body::from("goto-home"))
            .unwrap(),
    )
    .await;
    assert_eq!(body["action"], "go_home");

    let (_, body) = send(
        &app,
        post_json(
            "/webview/location",
            json!({ "url": "https://secure.payu.in/_payment" }),
        ),
    )
    .await;
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn test_bridge_link_outside_payment_schemes_is_ignored() {
    let (app, _service) = app();
    for url in ["javascript:alert(document.cookie)", "https://evil.example.com/"] {
        let (status, body) = send(
            &app,
            post_json("/webview/message", json!({ "type": "upi-link", "url": url })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["action"], "ignored", "{}", url);
    }
}

#[tokio::test]
async fn test_confirming_unknown_transaction_is_rejected() {
    let (app, service) = app();
    send(&app, post_json("/payment/initiate", initiate_body())).await;

    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/payment/status/FORGED/confirm")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert!(!service.poller().is_running("FORGED"));
}
