//! Transaction lifecycle states and the pure transition function

use crate::error::PaymentError;
use crate::payments::types::{
    BackendPaymentResult, PolledStatus, RedirectChannel, VerificationOutcome, VerificationResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;

const DEFAULT_FAILURE_REASON: &str = "Payment failed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransactionState {
    /// Request signed, not yet handed to a channel
    Submitted,
    /// Waiting for the user to come back from the gateway
    AwaitingRedirect,
    /// Outcome unknown, resolved only by status polling
    Pending,
    Success,
    /// The remote system rejected the transaction
    Failed { reason: String },
    /// Local failure; polling may be offered again
    Error { reason: String },
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Submitted => write!(f, "submitted"),
            TransactionState::AwaitingRedirect => write!(f, "awaiting_redirect"),
            TransactionState::Pending => write!(f, "pending"),
            TransactionState::Success => write!(f, "success"),
            TransactionState::Failed { .. } => write!(f, "failed"),
            TransactionState::Error { .. } => write!(f, "error"),
        }
    }
}

/// Everything that can happen to a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    /// Request handed to a redirect, popup or embedded browser
    HandedOff(RedirectChannel),
    /// Same-tab callback after it went through the verifier
    CallbackReceived {
        verification: VerificationResult,
        message: Option<String>,
    },
    /// Wallet/UPI payment answered directly by the backend
    BackendResult(BackendPaymentResult),
    /// Popup closed, embedded browser heuristic fired, or the user claims to
    /// have paid. None of these prove anything.
    ChannelInconclusive,
    Polled {
        status: PolledStatus,
        message: Option<String>,
    },
    LocalFailure(String),
    /// Re-offer polling after a local error
    ResumePolling,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Success | TransactionState::Failed { .. })
    }

    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            TransactionState::Submitted
                | TransactionState::AwaitingRedirect
                | TransactionState::Pending
        )
    }

    pub fn can_poll(&self) -> bool {
        matches!(self, TransactionState::Pending)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            TransactionState::Failed { reason } | TransactionState::Error { reason } => {
                Some(reason.as_str())
            }
            _ => None,
        }
    }

    /// Next state for `event`. Terminal states and events that don't apply in
    /// the current state return the current state unchanged.
    pub fn next(&self, event: &TransactionEvent) -> TransactionState {
        use TransactionState::*;

        if self.is_terminal() {
            return self.clone();
        }

        match (self, event) {
            (Submitted, TransactionEvent::HandedOff(_)) => AwaitingRedirect,

            (Submitted | AwaitingRedirect, TransactionEvent::CallbackReceived { verification, message }) => {
                from_callback(verification, message.as_deref())
            }

            (Submitted | AwaitingRedirect, TransactionEvent::BackendResult(result)) => {
                from_backend_status(&result.status, result.message.as_deref())
            }

            (AwaitingRedirect, TransactionEvent::ChannelInconclusive) => Pending,

            (Pending, TransactionEvent::Polled { status, message }) => match status {
                PolledStatus::Success => Success,
                PolledStatus::Failed => Failed {
                    reason: message
                        .clone()
                        .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string()),
                },
                PolledStatus::Pending | PolledStatus::Unknown(_) => Pending,
            },

            (_, TransactionEvent::LocalFailure(reason)) => Error {
                reason: reason.clone(),
            },

            (Error { .. }, TransactionEvent::ResumePolling) => Pending,

            _ => self.clone(),
        }
    }
}

fn from_callback(verification: &VerificationResult, message: Option<&str>) -> TransactionState {
    match verification.outcome {
        VerificationOutcome::Mismatch => TransactionState::Failed {
            reason: PaymentError::verification_failed(verification.transaction_id.as_str())
                .user_message(),
        },
        // Unverified data is never trusted, whatever status it claims
        VerificationOutcome::Skipped => TransactionState::Pending,
        VerificationOutcome::Verified => from_backend_status(&verification.status, message),
    }
}

fn from_backend_status(status: &str, message: Option<&str>) -> TransactionState {
    match status.trim().to_ascii_lowercase().as_str() {
        "success" => TransactionState::Success,
        "pending" | "processing" | "in progress" => TransactionState::Pending,
        _ => TransactionState::Failed {
            reason: message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(DEFAULT_FAILURE_REASON)
                .to_string(),
        },
    }
}
