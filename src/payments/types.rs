//! Payment types and data structures
//!
//! Requests going out to the gateway, callbacks coming back, and the
//! normalized shapes every adapter converts into at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum number of opaque extension fields (`udf1..udf5`)
pub const MAX_EXTENSION_FIELDS: usize = 5;

/// Merchant credentials shared with the gateway
#[derive(Clone, Deserialize)]
pub struct GatewayCredentials {
    pub merchant_key: String,
    pub salt: String,
}

impl GatewayCredentials {
    pub fn new(merchant_key: impl Into<String>, salt: impl Into<String>) -> Self {
        Self {
            merchant_key: merchant_key.into(),
            salt: salt.into(),
        }
    }
}

impl fmt::Debug for GatewayCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayCredentials")
            .field("merchant_key", &self.merchant_key)
            .field("salt", &"<redacted>")
            .finish()
    }
}

/// Payment request built by the storefront for one attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Amount in major currency units (rupees)
    pub amount: f64,
    pub product_info: String,
    pub payer_name: String,
    pub payer_email: String,
    pub payer_phone: String,
    /// Caller-supplied id; generated by the signer when absent
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Opaque pass-through values, at most five
    #[serde(default)]
    pub extension_fields: Vec<String>,
    /// Return URLs; the service points all three at its callback surface
    #[serde(default)]
    pub success_url: String,
    #[serde(default)]
    pub failure_url: String,
    #[serde(default)]
    pub cancel_url: String,
}

/// Signed request ready to be posted to the gateway. Never carries the salt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPaymentRequest {
    pub key: String,
    pub transaction_id: String,
    /// Always two decimals
    pub amount: String,
    pub product_info: String,
    pub payer_name: String,
    pub payer_email: String,
    pub payer_phone: String,
    /// Always exactly five entries, empty strings for unused slots
    pub extension_fields: [String; MAX_EXTENSION_FIELDS],
    pub success_url: String,
    pub failure_url: String,
    pub cancel_url: String,
    pub service_provider: String,
    pub signature: String,
}

/// Raw callback fields as delivered by the gateway. Untrusted until verified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayCallback {
    fields: BTreeMap<String, String>,
}

impl GatewayCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Adds the field only when the callback does not already carry it
    pub fn insert_missing(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.entry(key.into()).or_insert_with(|| value.into());
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Looks up a field by its wire name first, then by the given aliases.
    /// Empty values count as absent.
    pub fn lookup(&self, name: &str, aliases: &[&str]) -> Option<&str> {
        std::iter::once(name)
            .chain(aliases.iter().copied())
            .filter_map(|key| self.fields.get(key))
            .map(|value| value.as_str())
            .find(|value| !value.is_empty())
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.lookup("txnid", &["transactionId", "txn_id", "txnId"])
    }

    pub fn status(&self) -> Option<&str> {
        self.lookup("status", &["Status", "STATUS", "paymentStatus"])
    }

    pub fn amount(&self) -> Option<&str> {
        self.lookup("amount", &["Amount"])
    }

    pub fn product_info(&self) -> Option<&str> {
        self.lookup("productinfo", &["productInfo"])
    }

    pub fn payer_name(&self) -> Option<&str> {
        self.lookup("firstname", &["payerName"])
    }

    pub fn payer_email(&self) -> Option<&str> {
        self.lookup("email", &["payerEmail"])
    }

    pub fn signature(&self) -> Option<&str> {
        self.lookup("hash", &["signature"])
    }

    pub fn additional_charges(&self) -> Option<&str> {
        self.lookup("additionalCharges", &["additional_charges"])
    }

    pub fn gateway_transaction_id(&self) -> Option<&str> {
        self.lookup("mihpayid", &["gatewayTransactionId", "payuMoneyId"])
    }

    /// Extension field `index` in 1..=5
    pub fn extension_field(&self, index: usize) -> &str {
        self.fields
            .get(&format!("udf{}", index))
            .map(|value| value.as_str())
            .unwrap_or("")
    }

    pub fn payment_method(&self) -> Option<&str> {
        self.lookup("mode", &["paymentMethod"])
    }

    pub fn error_message(&self) -> Option<&str> {
        self.lookup("error_Message", &["field9", "error", "message"])
    }
}

/// How a callback's authenticity was decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    /// Signature recomputed and matched
    Verified,
    /// Transaction id or status missing; nothing was checked
    Skipped,
    /// Signature missing or different; treated as tampering
    Mismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub is_valid: bool,
    pub outcome: VerificationOutcome,
    pub status: String,
    pub transaction_id: String,
    pub gateway_transaction_id: String,
    pub amount: String,
}

/// Which rail the user paid through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    Wallet,
    Upi,
    Gateway,
}

impl fmt::Display for PaymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentType::Wallet => write!(f, "wallet"),
            PaymentType::Upi => write!(f, "upi"),
            PaymentType::Gateway => write!(f, "gateway"),
        }
    }
}

/// Recovery record of the in-flight transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPayload {
    pub transaction_id: String,
    /// Opaque bag passed back to the status check unchanged
    #[serde(default)]
    pub view_bill_response: serde_json::Value,
    #[serde(default)]
    pub validity: Option<i64>,
    pub operator_id: i64,
    #[serde(default)]
    pub circle_id: Option<String>,
    pub amount: f64,
    pub payment_type: PaymentType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub original_request_params: serde_json::Value,
}

/// Normalized `transactionStatus` of a status check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolledStatus {
    Success,
    Failed,
    Pending,
    Unknown(String),
}

impl PolledStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => PolledStatus::Success,
            "FAILED" | "FAILURE" => PolledStatus::Failed,
            "PENDING" | "PROCESSING" => PolledStatus::Pending,
            _ => PolledStatus::Unknown(raw.to_string()),
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, PolledStatus::Success | PolledStatus::Failed)
    }
}

/// Status-check result after boundary normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionStatusResult {
    pub transaction_status: PolledStatus,
    pub message: Option<String>,
    pub request_id: Option<String>,
    pub reference_id: Option<String>,
    pub commission: Option<String>,
}

impl TransactionStatusResult {
    pub fn with_status(transaction_status: PolledStatus) -> Self {
        Self {
            transaction_status,
            message: None,
            request_id: None,
            reference_id: None,
            commission: None,
        }
    }
}

/// Result of a wallet/UPI payment made directly against the backend,
/// bypassing the external gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendPaymentResult {
    pub transaction_id: String,
    /// Inner status reported by the backend
    pub status: String,
    pub message: Option<String>,
}

/// The channel a submitted request was handed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectChannel {
    SameTab,
    Popup,
    EmbeddedBrowser,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_lookup_prefers_wire_name() {
        let callback = GatewayCallback::from_pairs([
            ("txnid", "WIRE"),
            ("transactionId", "ALIAS"),
        ]);
        assert_eq!(callback.transaction_id(), Some("WIRE"));
    }

    #[test]
    fn test_callback_lookup_falls_back_to_alias() {
        let callback = GatewayCallback::from_pairs([("txnid", ""), ("transactionId", "ALIAS")]);
        assert_eq!(callback.transaction_id(), Some("ALIAS"));
    }

    #[test]
    fn test_missing_extension_field_is_empty() {
        let callback = GatewayCallback::from_pairs([("udf2", "x")]);
        assert_eq!(callback.extension_field(1), "");
        assert_eq!(callback.extension_field(2), "x");
    }

    #[test]
    fn test_polled_status_parse() {
        assert_eq!(PolledStatus::parse("SUCCESS"), PolledStatus::Success);
        assert_eq!(PolledStatus::parse("failed"), PolledStatus::Failed);
        assert_eq!(PolledStatus::parse("PENDING"), PolledStatus::Pending);
        assert_eq!(
            PolledStatus::parse("ON_HOLD"),
            PolledStatus::Unknown("ON_HOLD".to_string())
        );
    }

    #[test]
    fn test_credentials_debug_redacts_salt() {
        let creds = GatewayCredentials::new("KEY", "super-secret");
        assert!(!format!("{:?}", creds).contains("super-secret"));
    }

    #[test]
    fn test_pending_payload_serializes_camel_case() {
        let payload = PendingPayload {
            transaction_id: "T1".to_string(),
            view_bill_response: serde_json::Value::Null,
            validity: Some(28),
            operator_id: 3,
            circle_id: None,
            amount: 199.0,
            payment_type: PaymentType::Upi,
            created_at: Utc::now(),
            original_request_params: serde_json::Value::Null,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["transactionId"], "T1");
        assert_eq!(json["paymentType"], "upi");
    }
}
