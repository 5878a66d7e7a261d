//! Seams to the outside world
//!
//! The core never talks to the network or the OS directly; it goes through
//! these traits so the service can be wired with real adapters in production
//! and fakes in tests.

use crate::error::PaymentResult;
use crate::payments::types::{PendingPayload, TransactionStatusResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Body of the status-check call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCheckRequest {
    pub txn_id: String,
    /// Recharge context of the original request (number/account being recharged)
    pub field1: String,
    pub view_bill_response: serde_json::Value,
    pub validity: Option<i64>,
}

impl StatusCheckRequest {
    pub fn from_payload(transaction_id: &str, payload: &PendingPayload) -> Self {
        let field1 = payload
            .original_request_params
            .get("field1")
            .and_then(|value| match value {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| payload.operator_id.to_string());

        Self {
            txn_id: transaction_id.to_string(),
            field1,
            view_bill_response: payload.view_bill_response.clone(),
            validity: payload.validity,
        }
    }
}

/// Backend that knows the authoritative status of a recharge
#[async_trait]
pub trait StatusBackend: Send + Sync {
    /// Ask the backend for the current status of a transaction
    ///
    /// Network failures must come back as
    /// [`crate::error::PaymentError::TransientNetwork`] so the poller can retry.
    async fn check_status(&self, request: &StatusCheckRequest)
        -> PaymentResult<TransactionStatusResult>;

    /// Re-fetch the recovery payload of a transaction when the local store is empty
    async fn fetch_pending_payload(&self, transaction_id: &str)
        -> PaymentResult<Option<PendingPayload>>;
}

/// Opens URLs with the operating system (native payment apps)
pub trait UrlLauncher: Send + Sync {
    /// Returns `Err` with a short reason when no app handled the URL
    fn open_url(&self, url: &str) -> Result<(), String>;
}

/// Reports whether a popup window opened for the gateway is still open
pub trait WindowProbe: Send + Sync {
    fn is_closed(&self) -> bool;
}
