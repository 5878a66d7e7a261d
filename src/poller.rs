//! Status polling for transactions whose outcome is unknown
//!
//! Each pending transaction gets a countdown task. When the countdown fires
//! (or the user asks for a manual check) the poller loads the recovery payload,
//! asks the backend for the status and feeds the result into the state machine.
//! Only one check per transaction id runs at a time; overlapping requests are
//! dropped, not queued.

use crate::error::{PaymentError, PaymentResult};
use crate::payments::traits::{StatusBackend, StatusCheckRequest};
use crate::payments::types::{PendingPayload, PolledStatus, TransactionStatusResult};
use crate::store::PendingPayloadStore;
use crate::transaction::{TransactionEvent, TransactionState, TransactionStateMachine, Transition};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Countdown between automatic checks
    pub default_interval: Duration,
    /// Countdown after the backend said the recharge is still processing
    pub widened_interval: Duration,
    /// Consecutive failures before the notice becomes persistent
    pub failure_escalation_threshold: u32,
    /// Upper bound on a single status check, retries included
    pub request_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(30),
            widened_interval: Duration::from_secs(60),
            failure_escalation_threshold: 3,
            // Three 20s attempts with 1s and 2s backoff in between
            request_timeout: Duration::from_secs(63),
        }
    }
}

/// Message shown to the user after a failed check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "level", content = "message", rename_all = "snake_case")]
pub enum PollNotice {
    /// Dismissible, shown after an isolated failure
    Transient(String),
    /// Shown once failures keep repeating
    Persistent(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollOutcome {
    /// The backend answered; `next_delay` is `None` once the poll resolved it
    Completed {
        result: TransactionStatusResult,
        state: TransactionState,
        next_delay: Option<Duration>,
    },
    /// The check failed; the transaction state was left alone
    Failed {
        notice: PollNotice,
        consecutive_failures: u32,
        next_delay: Duration,
    },
    /// A local failure moved the transaction to `Error`
    Errored { state: TransactionState },
    /// Another check for this id is already running
    Dropped,
    /// The transaction is not in a pollable state
    NotPollable { state: Option<TransactionState> },
}

/// Observable poller activity
#[derive(Debug, Clone, PartialEq)]
pub enum PollerEvent {
    CountdownStarted {
        transaction_id: String,
        delay: Duration,
    },
    Polled {
        transaction_id: String,
        outcome: PollOutcome,
    },
    Stopped {
        transaction_id: String,
    },
}

struct CountdownTask {
    handle: JoinHandle<()>,
    reset: Arc<Notify>,
    generation: u64,
}

/// Releases the in-flight slot of a transaction id when dropped
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    transaction_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.transaction_id);
        }
    }
}

pub struct StatusPoller {
    backend: Arc<dyn StatusBackend>,
    store: PendingPayloadStore,
    machine: Arc<TransactionStateMachine>,
    config: PollerConfig,
    in_flight: Mutex<HashSet<String>>,
    failures: Mutex<HashMap<String, u32>>,
    tasks: Mutex<HashMap<String, CountdownTask>>,
    generations: AtomicU64,
    shutdown: watch::Sender<bool>,
    events: broadcast::Sender<PollerEvent>,
}

impl StatusPoller {
    pub fn new(
        backend: Arc<dyn StatusBackend>,
        store: PendingPayloadStore,
        machine: Arc<TransactionStateMachine>,
        config: PollerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);
        Self {
            backend,
            store,
            machine,
            config,
            in_flight: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            shutdown,
            events,
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PollerEvent> {
        self.events.subscribe()
    }

    /// True once [`StatusPoller::stop`] ran; no countdown starts after that
    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One status-check round trip, without touching the state machine
    pub async fn poll(
        &self,
        transaction_id: &str,
        payload: &PendingPayload,
    ) -> PaymentResult<TransactionStatusResult> {
        let request = StatusCheckRequest::from_payload(transaction_id, payload);
        match tokio::time::timeout(self.config.request_timeout, self.backend.check_status(&request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(PaymentError::transient(format!(
                "status check timed out after {}s",
                self.config.request_timeout.as_secs()
            ))),
        }
    }

    /// Local payload first, backend re-fetch when the slot is empty or belongs
    /// to another transaction
    async fn recovery_payload(&self, transaction_id: &str) -> PaymentResult<Option<PendingPayload>> {
        match self.store.load_for(transaction_id).await {
            Ok(Some(payload)) => return Ok(Some(payload)),
            Ok(None) => {}
            Err(e) => warn!(transaction_id = %transaction_id, "Pending payload store unavailable: {}", e),
        }

        debug!(transaction_id = %transaction_id, "Re-fetching pending payload from backend");
        self.backend.fetch_pending_payload(transaction_id).await
    }

    fn try_acquire(&self, transaction_id: &str) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(transaction_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            transaction_id: transaction_id.to_string(),
        })
    }

    fn record_failure(&self, transaction_id: &str) -> u32 {
        let mut failures = match self.failures.lock() {
            Ok(failures) => failures,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = failures.entry(transaction_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn reset_failures(&self, transaction_id: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(transaction_id);
        }
    }

    /// Runs one check and applies its result
    pub async fn check_now(&self, transaction_id: &str) -> PollOutcome {
        let outcome = self.run_check(transaction_id).await;
        let _ = self.events.send(PollerEvent::Polled {
            transaction_id: transaction_id.to_string(),
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn run_check(&self, transaction_id: &str) -> PollOutcome {
        let state = self.machine.state(transaction_id).await;
        if !state.as_ref().map(TransactionState::can_poll).unwrap_or(false) {
            return PollOutcome::NotPollable { state };
        }

        let Some(_guard) = self.try_acquire(transaction_id) else {
            debug!(transaction_id = %transaction_id, "Status check already in flight, dropping");
            return PollOutcome::Dropped;
        };

        let result = match self.recovery_payload(transaction_id).await {
            Ok(Some(payload)) => self.poll(transaction_id, &payload).await,
            Ok(None) => Err(PaymentError::local("no recovery data for transaction")),
            Err(e) => Err(e),
        };

        match result {
            Ok(result) => {
                self.reset_failures(transaction_id);
                let transition = match self
                    .machine
                    .apply(
                        transaction_id,
                        TransactionEvent::Polled {
                            status: result.transaction_status.clone(),
                            message: result.message.clone(),
                        },
                    )
                    .await
                {
                    Ok(transition) => transition,
                    Err(e) => return self.local_failure(transaction_id, e).await,
                };

                let state = transition.state().clone();
                let next_delay = if state.can_poll() {
                    Some(match result.transaction_status {
                        PolledStatus::Pending => self.config.widened_interval,
                        _ => self.config.default_interval,
                    })
                } else {
                    None
                };

                if let Transition::Moved { .. } = transition {
                    info!(transaction_id = %transaction_id, state = %state, "Poll resolved transaction");
                }

                PollOutcome::Completed {
                    result,
                    state,
                    next_delay,
                }
            }
            Err(e @ PaymentError::Local { .. }) | Err(e @ PaymentError::Store { .. }) => {
                self.local_failure(transaction_id, e).await
            }
            Err(e) => {
                let consecutive_failures = self.record_failure(transaction_id);
                warn!(
                    transaction_id = %transaction_id,
                    consecutive_failures,
                    "Status check failed: {}",
                    e
                );
                let message = e.user_message();
                let notice = if consecutive_failures >= self.config.failure_escalation_threshold {
                    PollNotice::Persistent(message)
                } else {
                    PollNotice::Transient(message)
                };
                PollOutcome::Failed {
                    notice,
                    consecutive_failures,
                    next_delay: self.config.default_interval,
                }
            }
        }
    }

    async fn local_failure(&self, transaction_id: &str, error: PaymentError) -> PollOutcome {
        warn!(transaction_id = %transaction_id, "Local failure while polling: {}", error);
        self.reset_failures(transaction_id);
        let state = match self
            .machine
            .apply(transaction_id, TransactionEvent::LocalFailure(error.user_message()))
            .await
        {
            Ok(transition) => transition.state().clone(),
            Err(_) => TransactionState::Error {
                reason: error.user_message(),
            },
        };
        PollOutcome::Errored { state }
    }

    /// Starts the automatic countdown for a transaction. A no-op when one is
    /// already running or the poller was stopped.
    pub fn start(self: &Arc<Self>, transaction_id: &str) {
        if self.is_stopped() {
            debug!(transaction_id = %transaction_id, "Poller stopped, not starting countdown");
            return;
        }

        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.retain(|_, task| !task.handle.is_finished());
        if tasks.contains_key(transaction_id) {
            return;
        }

        let reset = Arc::new(Notify::new());
        let poller = Arc::clone(self);
        let id = transaction_id.to_string();
        let task_reset = Arc::clone(&reset);
        let mut shutdown = self.shutdown.subscribe();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        let handle = tokio::spawn(async move {
            let mut delay = poller.config.default_interval;
            loop {
                let _ = poller.events.send(PollerEvent::CountdownStarted {
                    transaction_id: id.clone(),
                    delay,
                });

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = task_reset.notified() => {
                        // Manual check already ran; restart the countdown
                        match poller.machine.state(&id).await {
                            Some(state) if state.can_poll() => {
                                delay = poller.config.default_interval;
                                continue;
                            }
                            _ => break,
                        }
                    }
                    _ = shutdown.changed() => break,
                }

                match poller.check_now(&id).await {
                    PollOutcome::Completed { next_delay: Some(next), .. } => delay = next,
                    PollOutcome::Failed { next_delay, .. } => delay = next_delay,
                    PollOutcome::Dropped => delay = poller.config.default_interval,
                    PollOutcome::Completed { next_delay: None, .. }
                    | PollOutcome::Errored { .. }
                    | PollOutcome::NotPollable { .. } => break,
                }
            }

            debug!(transaction_id = %id, "Countdown stopped");
            poller.release(&id, generation);
            let _ = poller.events.send(PollerEvent::Stopped { transaction_id: id });
        });

        tasks.insert(
            transaction_id.to_string(),
            CountdownTask {
                handle,
                reset,
                generation,
            },
        );
    }

    /// Drops the bookkeeping of a finished countdown unless a newer one
    /// replaced it
    fn release(&self, transaction_id: &str, generation: u64) {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        if tasks
            .get(transaction_id)
            .map(|task| task.generation == generation)
            .unwrap_or(false)
        {
            tasks.remove(transaction_id);
        }
        drop(tasks);
        self.reset_failures(transaction_id);
    }

    /// Countdowns currently tracked
    pub fn active(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| tasks.values().filter(|task| !task.handle.is_finished()).count())
            .unwrap_or(0)
    }

    /// Manual retry from the user. Runs a check right away and restarts the
    /// countdown of a running loop.
    pub async fn trigger_now(&self, transaction_id: &str) -> PollOutcome {
        let outcome = self.check_now(transaction_id).await;
        if !matches!(outcome, PollOutcome::Dropped) {
            if let Ok(tasks) = self.tasks.lock() {
                if let Some(task) = tasks.get(transaction_id) {
                    task.reset.notify_one();
                }
            }
        }
        outcome
    }

    pub fn is_running(&self, transaction_id: &str) -> bool {
        self.tasks
            .lock()
            .map(|tasks| {
                tasks
                    .get(transaction_id)
                    .map(|task| !task.handle.is_finished())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Cancels every countdown
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, task) in tasks.drain() {
                task.handle.abort();
            }
        }
        info!("Status poller stopped");
    }
}
