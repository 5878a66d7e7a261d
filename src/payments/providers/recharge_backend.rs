//! Recharge backend adapter
//!
//! Talks to the storefront's REST backend for status checks and pending-payload
//! recovery. The backend's envelopes are loosely typed (`status`, `Status` and
//! `STATUS`; `data` or `RDATA`), so everything is normalized here and nothing
//! past this module sees the raw shape.

use crate::error::{PaymentError, PaymentResult};
use crate::payments::traits::{StatusBackend, StatusCheckRequest};
use crate::payments::types::{PendingPayload, PolledStatus, TransactionStatusResult};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;

pub const STATUS_ENDPOINT: &str = "/recharge/status";
pub const PENDING_PAYLOAD_ENDPOINT: &str = "/recharge/pending";

/// Recharge backend configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    /// Session token of the signed-in user
    pub auth_token: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum number of retries for failed requests
    pub max_retries: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_string(),
            auth_token: None,
            timeout_secs: 20,
            max_retries: 2,
        }
    }
}

/// HTTP client for the recharge backend
pub struct RechargeBackend {
    config: BackendConfig,
    client: Client,
}

impl RechargeBackend {
    pub fn new(config: BackendConfig) -> PaymentResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("recharge-payments/0.1")
            .build()
            .map_err(|e| {
                PaymentError::configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { config, client })
    }

    fn auth_header(&self) -> PaymentResult<String> {
        match self.config.auth_token.as_deref() {
            Some(token) if !token.trim().is_empty() => Ok(format!("Bearer {}", token)),
            _ => Err(PaymentError::local("missing session credential")),
        }
    }

    /// Sends a request and returns the raw JSON body, retrying connectivity
    /// failures and server errors with exponential backoff
    async fn make_request(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        segments: &[&str],
        body: Option<&Value>,
    ) -> PaymentResult<Option<Value>> {
        let url = endpoint_url(&self.config.base_url, endpoint, segments)?;
        let mut request = self
            .client
            .request(method, url)
            .header("Authorization", self.auth_header()?)
            .header("Content-Type", "application/json");

        if let Some(body) = body {
            request = request.json(body);
        }

        let mut last_error: Option<PaymentError> = None;
        for attempt in 0..=self.config.max_retries {
            let Some(req) = request.try_clone() else {
                return Err(PaymentError::local("Failed to clone request"));
            };

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == reqwest::StatusCode::NOT_FOUND {
                        return Ok(None);
                    }

                    if status.is_success() {
                        let text = response.text().await.map_err(PaymentError::from)?;
                        let value: Value = serde_json::from_str(&text).map_err(|e| {
                            error!("Failed to parse backend response: {}", e);
                            PaymentError::local(format!("Invalid response format: {}", e))
                        })?;
                        return Ok(Some(value));
                    }

                    if status.is_server_error() && attempt < self.config.max_retries {
                        let backoff = 2_u64.pow(attempt);
                        warn!(
                            "Backend error {}, retrying after {} seconds (attempt {})",
                            status,
                            backoff,
                            attempt + 1
                        );
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                        last_error = Some(PaymentError::transient(format!("HTTP {}", status)));
                        continue;
                    }

                    if status == reqwest::StatusCode::UNAUTHORIZED {
                        return Err(PaymentError::local("session credential rejected"));
                    }

                    error!("Backend request to {} failed with HTTP {}", endpoint, status);
                    return Err(if status.is_server_error() {
                        PaymentError::transient(format!("HTTP {}", status))
                    } else {
                        PaymentError::local(format!("HTTP {}", status))
                    });
                }
                Err(e) => {
                    let err = PaymentError::from(e);
                    if err.is_retryable() && attempt < self.config.max_retries {
                        let backoff = 2_u64.pow(attempt);
                        warn!(
                            "Request error, retrying after {} seconds (attempt {}): {}",
                            backoff,
                            attempt + 1,
                            err
                        );
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            PaymentError::transient(format!(
                "Request failed after {} retries",
                self.config.max_retries
            ))
        }))
    }
}

#[async_trait]
impl StatusBackend for RechargeBackend {
    async fn check_status(
        &self,
        request: &StatusCheckRequest,
    ) -> PaymentResult<TransactionStatusResult> {
        info!(transaction_id = %request.txn_id, "Checking recharge status");

        let body = serde_json::to_value(request)?;
        let response = self
            .make_request(reqwest::Method::POST, STATUS_ENDPOINT, &[], Some(&body))
            .await?
            .ok_or_else(|| PaymentError::local("status endpoint not found"))?;

        let result = normalize_status_envelope(&response)?;
        info!(
            transaction_id = %request.txn_id,
            status = ?result.transaction_status,
            "Recharge status received"
        );
        Ok(result)
    }

    async fn fetch_pending_payload(
        &self,
        transaction_id: &str,
    ) -> PaymentResult<Option<PendingPayload>> {
        if matches!(transaction_id.trim(), "" | "." | "..") {
            return Err(PaymentError::validation(
                "transaction_id",
                format!("'{}' is not a transaction id", transaction_id),
            ));
        }

        let Some(response) = self
            .make_request(
                reqwest::Method::GET,
                PENDING_PAYLOAD_ENDPOINT,
                &[transaction_id],
                None,
            )
            .await?
        else {
            return Ok(None);
        };

        if !envelope_succeeded(&response) {
            return Ok(None);
        }

        match envelope_data(&response) {
            Some(data) if !data.is_null() => Ok(Some(serde_json::from_value(data.clone())?)),
            _ => Ok(None),
        }
    }
}

/// Base URL plus a fixed endpoint path, then each of `segments` escaped into
/// exactly one path segment
pub fn endpoint_url(base_url: &str, endpoint: &str, segments: &[&str]) -> PaymentResult<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| PaymentError::configuration(format!("Invalid backend URL: {}", e)))?;
    url.path_segments_mut()
        .map_err(|_| PaymentError::configuration("Backend URL cannot take a path"))?
        .pop_if_empty()
        .extend(endpoint.split('/').filter(|part| !part.is_empty()))
        .extend(segments.iter().copied());
    Ok(url)
}

/// First present key out of a set of casing variants
fn field<'a>(value: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| value.get(*name))
}

fn field_string(value: &Value, names: &[&str]) -> Option<String> {
    field(value, names).and_then(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn envelope_succeeded(envelope: &Value) -> bool {
    match field(envelope, &["status", "Status", "STATUS"]) {
        Some(Value::Bool(ok)) => *ok,
        Some(Value::String(s)) => {
            let s = s.to_ascii_lowercase();
            s == "success" || s == "true" || s == "1"
        }
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn envelope_data(envelope: &Value) -> Option<&Value> {
    field(envelope, &["data", "Data", "DATA", "RDATA"])
}

/// Converts any status-check envelope variant into the fixed result shape
pub fn normalize_status_envelope(envelope: &Value) -> PaymentResult<TransactionStatusResult> {
    let message = field_string(envelope, &["message", "Message", "MESSAGE", "msg"]);

    if !envelope_succeeded(envelope) {
        return Err(PaymentError::gateway_rejected(
            message.unwrap_or_else(|| "Status check was not accepted".to_string()),
        ));
    }

    let data = envelope_data(envelope).unwrap_or(&Value::Null);
    let raw_status = field_string(
        data,
        &["transactionStatus", "TransactionStatus", "transaction_status", "STATUS", "status"],
    )
    .unwrap_or_default();

    Ok(TransactionStatusResult {
        transaction_status: PolledStatus::parse(&raw_status),
        message: field_string(data, &["message", "Message", "MESSAGE"]).or(message),
        request_id: field_string(data, &["requestId", "RequestId", "REQUESTID"]),
        reference_id: field_string(data, &["referenceId", "ReferenceId", "OPRID", "operatorRef"]),
        commission: field_string(data, &["commission", "Commission", "COMMISSION"]),
    })
}
