//! Error taxonomy for the payment orchestration core
//!
//! Every failure the core can produce maps onto one of these kinds. A callback
//! that lacked the fields needed for verification is *not* an error; see
//! [`crate::payments::types::VerificationOutcome::Skipped`].

use thiserror::Error;

/// Result type for payment operations
pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PaymentError {
    /// Bad amount or missing required field, caught before signing
    #[error("Validation error on '{field}': {message}")]
    Validation { field: String, message: String },

    /// Callback signature did not match; treated as tampering
    #[error("Callback signature mismatch for transaction {transaction_id}")]
    VerificationFailed { transaction_id: String },

    /// Timeouts and connectivity problems; retried, never changes state
    #[error("Network error: {message}")]
    TransientNetwork { message: String },

    /// Remote system affirmatively rejected the transaction
    #[error("Gateway rejected transaction: {message}")]
    GatewayRejected { message: String },

    /// Missing session credential or an unexpected local failure
    #[error("Local error: {message}")]
    Local { message: String },

    /// Persistent store failure
    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl PaymentError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn verification_failed(transaction_id: impl Into<String>) -> Self {
        Self::VerificationFailed {
            transaction_id: transaction_id.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            message: message.into(),
        }
    }

    pub fn gateway_rejected(message: impl Into<String>) -> Self {
        Self::GatewayRejected {
            message: message.into(),
        }
    }

    pub fn local(message: impl Into<String>) -> Self {
        Self::Local {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Only connectivity failures are retried automatically
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }

    /// The message a user may see. Vendor messages pass through verbatim,
    /// everything else is replaced with a vetted local string.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation { message, .. } => message.clone(),
            Self::VerificationFailed { .. } => {
                "We could not confirm this payment with the gateway. If money was debited it will be reconciled automatically.".to_string()
            }
            Self::TransientNetwork { .. } => {
                "We are having trouble reaching the server. We will keep checking the status.".to_string()
            }
            Self::GatewayRejected { message } => message.clone(),
            Self::Local { .. } | Self::Store { .. } | Self::Configuration { .. } => {
                "Something went wrong. Please try again.".to_string()
            }
        }
    }
}

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PaymentError::transient("request timed out")
        } else if err.is_connect() || err.is_request() {
            PaymentError::transient(format!("Request error: {}", err))
        } else if err.is_decode() {
            PaymentError::local(format!("Invalid response body: {}", err))
        } else {
            PaymentError::transient(format!("HTTP error: {}", err))
        }
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(err: serde_json::Error) -> Self {
        PaymentError::local(format!("JSON error: {}", err))
    }
}

impl From<crate::store::StoreError> for PaymentError {
    fn from(err: crate::store::StoreError) -> Self {
        PaymentError::store(err.to_string())
    }
}
