//! Per-transaction lifecycle tracking
//!
//! Events for one transaction id are applied in arrival order. There is no
//! ordering across channels (a callback can race a poll result); the terminal
//! rule in [`TransactionState::next`] is what keeps that race safe.

use crate::error::{PaymentError, PaymentResult};
use crate::payments::types::{GatewayCallback, RedirectChannel, VerificationOutcome, VerificationResult};
use crate::payments::CallbackVerifier;
use crate::store::{PendingPayloadStore, ResolvedOutcome};
use crate::transaction::state::{TransactionEvent, TransactionState};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What applying an event did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    Moved {
        from: TransactionState,
        to: TransactionState,
    },
    /// Event accepted but the state did not change
    Stayed { state: TransactionState },
    /// Transaction already resolved; event dropped
    Ignored { state: TransactionState },
}

impl Transition {
    pub fn state(&self) -> &TransactionState {
        match self {
            Transition::Moved { to, .. } => to,
            Transition::Stayed { state } | Transition::Ignored { state } => state,
        }
    }
}

/// Where the id of a callback that arrived without one came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdSource {
    Callback,
    PendingPayload,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallbackHandling {
    pub transaction_id: String,
    pub id_source: IdSource,
    pub verification: VerificationResult,
    pub transition: Transition,
}

/// Resolved transactions kept in memory before the oldest are evicted
pub const DEFAULT_RESOLVED_CAPACITY: usize = 1024;

pub struct TransactionStateMachine {
    states: RwLock<HashMap<String, TransactionState>>,
    /// Terminal ids in resolution order, oldest first
    resolved: Mutex<VecDeque<String>>,
    resolved_capacity: usize,
    store: PendingPayloadStore,
}

impl TransactionStateMachine {
    pub fn new(store: PendingPayloadStore) -> Self {
        Self::with_capacity(store, DEFAULT_RESOLVED_CAPACITY)
    }

    pub fn with_capacity(store: PendingPayloadStore, resolved_capacity: usize) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            resolved: Mutex::new(VecDeque::new()),
            resolved_capacity: resolved_capacity.max(1),
            store,
        }
    }

    /// Whether this id was issued here: tracked in memory, held in the pending
    /// slot, or named by the last persisted outcome
    pub async fn is_known(&self, transaction_id: &str) -> bool {
        if self.states.read().await.contains_key(transaction_id) {
            return true;
        }
        match self.store.load_for(transaction_id).await {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(e) => warn!(transaction_id = %transaction_id, "Could not read pending payload: {}", e),
        }
        self.recovered_state(transaction_id).await.is_some()
    }

    /// Number of transactions held in memory
    pub async fn tracked(&self) -> usize {
        self.states.read().await.len()
    }

    /// Registers a freshly signed transaction in `Submitted`
    pub async fn begin(&self, transaction_id: &str) -> PaymentResult<TransactionState> {
        let mut states = self.states.write().await;
        if states.contains_key(transaction_id) {
            return Err(PaymentError::validation(
                "transaction_id",
                format!("Transaction {} was already submitted", transaction_id),
            ));
        }
        states.insert(transaction_id.to_string(), TransactionState::Submitted);
        info!(transaction_id = %transaction_id, "Transaction submitted");
        Ok(TransactionState::Submitted)
    }

    pub async fn state(&self, transaction_id: &str) -> Option<TransactionState> {
        if let Some(state) = self.states.read().await.get(transaction_id) {
            return Some(state.clone());
        }
        self.recovered_state(transaction_id).await
    }

    pub async fn hand_off(
        &self,
        transaction_id: &str,
        channel: RedirectChannel,
    ) -> PaymentResult<Transition> {
        self.apply(transaction_id, TransactionEvent::HandedOff(channel))
            .await
    }

    /// Applies one event. Transactions this process has never seen start
    /// from the last persisted outcome, or `AwaitingRedirect` when there is none.
    pub async fn apply(
        &self,
        transaction_id: &str,
        event: TransactionEvent,
    ) -> PaymentResult<Transition> {
        let recovered = if self.states.read().await.contains_key(transaction_id) {
            None
        } else {
            self.recovered_state(transaction_id).await
        };

        let transition = {
            let mut states = self.states.write().await;
            let current = states
                .entry(transaction_id.to_string())
                .or_insert_with(|| recovered.unwrap_or(TransactionState::AwaitingRedirect));

            if current.is_terminal() {
                debug!(
                    transaction_id = %transaction_id,
                    state = %current,
                    event = ?event,
                    "Ignoring event for resolved transaction"
                );
                return Ok(Transition::Ignored {
                    state: current.clone(),
                });
            }

            let next = current.next(&event);
            if next == *current {
                Transition::Stayed {
                    state: current.clone(),
                }
            } else {
                let from = std::mem::replace(current, next.clone());
                if next.is_terminal() {
                    self.evict_resolved(&mut states, transaction_id);
                }
                Transition::Moved { from, to: next }
            }
        };

        if let Transition::Moved { from, to } = &transition {
            info!(
                transaction_id = %transaction_id,
                from = %from,
                to = %to,
                "Transaction state changed"
            );
            if to.is_terminal() || matches!(to, TransactionState::Error { .. }) {
                self.persist_outcome(transaction_id, to).await;
            }
        }

        Ok(transition)
    }

    /// Verifies a same-tab callback and applies it.
    ///
    /// A callback without a transaction id is attributed to the stored pending
    /// payload, or to a fresh fallback id, and parked in `Pending` until a
    /// status poll confirms it.
    pub async fn handle_callback(
        &self,
        callback: &GatewayCallback,
        verifier: &CallbackVerifier,
    ) -> PaymentResult<CallbackHandling> {
        let verification = verifier.verify(callback);

        if let Some(transaction_id) = callback.transaction_id() {
            if verification.outcome == VerificationOutcome::Mismatch {
                warn!(
                    transaction_id = %transaction_id,
                    "Rejecting callback with invalid signature"
                );
            }
            let transition = self
                .apply(
                    transaction_id,
                    TransactionEvent::CallbackReceived {
                        verification: verification.clone(),
                        message: callback.error_message().map(str::to_string),
                    },
                )
                .await?;
            return Ok(CallbackHandling {
                transaction_id: transaction_id.to_string(),
                id_source: IdSource::Callback,
                verification,
                transition,
            });
        }

        let (transaction_id, id_source) = match self.store.load().await {
            Ok(Some(payload)) => (payload.transaction_id, IdSource::PendingPayload),
            Ok(None) => (fallback_transaction_id(), IdSource::Fallback),
            Err(e) => {
                warn!("Pending payload unavailable while recovering callback id: {}", e);
                (fallback_transaction_id(), IdSource::Fallback)
            }
        };

        warn!(
            transaction_id = %transaction_id,
            source = ?id_source,
            "Callback carried no transaction id, parking as pending"
        );

        let transition = self
            .apply(&transaction_id, TransactionEvent::ChannelInconclusive)
            .await?;

        Ok(CallbackHandling {
            transaction_id,
            id_source,
            verification,
            transition,
        })
    }

    /// Records a newly resolved id and drops the oldest resolved entries past
    /// capacity. Still-open transactions are never evicted.
    fn evict_resolved(&self, states: &mut HashMap<String, TransactionState>, transaction_id: &str) {
        let mut resolved = match self.resolved.lock() {
            Ok(resolved) => resolved,
            Err(poisoned) => poisoned.into_inner(),
        };
        resolved.push_back(transaction_id.to_string());
        while resolved.len() > self.resolved_capacity {
            if let Some(oldest) = resolved.pop_front() {
                if states.get(&oldest).map(TransactionState::is_terminal).unwrap_or(false) {
                    states.remove(&oldest);
                    debug!(transaction_id = %oldest, "Evicted resolved transaction");
                }
            }
        }
    }

    async fn recovered_state(&self, transaction_id: &str) -> Option<TransactionState> {
        match self.store.last_outcome().await {
            Ok(Some(outcome)) if outcome.transaction_id == transaction_id => Some(outcome.state),
            Ok(_) => None,
            Err(e) => {
                warn!("Could not read last outcome: {}", e);
                None
            }
        }
    }

    async fn persist_outcome(&self, transaction_id: &str, state: &TransactionState) {
        let outcome = ResolvedOutcome {
            transaction_id: transaction_id.to_string(),
            state: state.clone(),
            resolved_at: Utc::now(),
        };
        if let Err(e) = self.store.record_outcome(&outcome).await {
            warn!(transaction_id = %transaction_id, "Failed to persist outcome: {}", e);
        }
        if state.is_terminal() {
            match self.store.load_for(transaction_id).await {
                Ok(Some(_)) => {
                    if let Err(e) = self.store.clear().await {
                        warn!("Failed to clear pending payload: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to read pending payload: {}", e),
            }
        }
    }
}

fn fallback_transaction_id() -> String {
    format!("FB{}", Uuid::new_v4().simple())
}
