//! Payment orchestration service
//!
//! One [`PaymentService`] is built at startup with its collaborators injected
//! and shared behind an `Arc`. It wires signing, callback verification, the
//! transaction state machine, status polling and the embedded browser gate.

use crate::deeplink::{BridgeAction, DeepLinkInterceptor, NavigationDecision, NavigationHeuristic};
use crate::error::{PaymentError, PaymentResult};
use crate::payments::traits::{StatusBackend, UrlLauncher, WindowProbe};
use crate::payments::types::{
    BackendPaymentResult, GatewayCallback, PaymentRequest, PaymentType, PendingPayload,
    RedirectChannel, SignedPaymentRequest,
};
use crate::payments::{CallbackVerifier, RequestSigner};
use crate::poller::{PollOutcome, PollerConfig, StatusPoller};
use crate::popup::{PopupCancel, PopupMonitor, PopupOutcome, DEFAULT_CHECK_INTERVAL};
use crate::store::PendingPayloadStore;
use crate::transaction::{
    IdSource, TransactionEvent, TransactionState, TransactionStateMachine, Transition,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Path of the callback surface relative to `callback_base_url`
pub const CALLBACK_PATH: &str = "/payment/callback";

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Where the signed form is posted
    pub gateway_url: String,
    /// Public base URL of this service; success, failure and cancel URLs point here
    pub callback_base_url: String,
    pub poller: PollerConfig,
    pub popup_check_interval: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            gateway_url: "https://test.payu.in/_payment".to_string(),
            callback_base_url: "http://localhost:8000".to_string(),
            poller: PollerConfig::default(),
            popup_check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

/// Everything needed to start a payment: the gateway request plus the
/// recharge context kept for status recovery
#[derive(Debug, Clone, Deserialize)]
pub struct InitiatePayment {
    #[serde(flatten)]
    pub request: PaymentRequest,
    pub operator_id: i64,
    #[serde(default)]
    pub circle_id: Option<String>,
    #[serde(default)]
    pub validity: Option<i64>,
    #[serde(default)]
    pub view_bill_response: serde_json::Value,
    #[serde(default)]
    pub original_request_params: serde_json::Value,
    #[serde(default = "default_payment_type")]
    pub payment_type: PaymentType,
    #[serde(default = "default_channel")]
    pub channel: RedirectChannel,
}

fn default_payment_type() -> PaymentType {
    PaymentType::Gateway
}

fn default_channel() -> RedirectChannel {
    RedirectChannel::SameTab
}

#[derive(Debug, Clone, Serialize)]
pub struct InitiatedPayment {
    pub transaction_id: String,
    pub gateway_url: String,
    pub signed: SignedPaymentRequest,
    pub state: TransactionState,
}

impl InitiatedPayment {
    /// HTML page that posts the signed form to the gateway
    pub fn auto_submit_form(&self) -> String {
        self.signed.render_auto_submit_form(&self.gateway_url)
    }
}

/// Normalized result handed back to the storefront after a callback
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallbackResponse {
    pub txn_id: String,
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
    pub amount: String,
    #[serde(rename = "productInfo")]
    pub product_info: String,
    #[serde(rename = "paymentStatus")]
    pub payment_status: String,
    #[serde(rename = "paymentMethod")]
    pub payment_method: String,
    #[serde(rename = "isPaymentVerified")]
    pub is_payment_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// What the embedded browser surface should do after a location change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurfaceExit {
    pub heuristic: NavigationHeuristic,
    pub transaction_id: Option<String>,
    pub state: Option<TransactionState>,
}

/// A running popup watcher
struct PopupWatch {
    cancel: PopupCancel,
    handle: JoinHandle<()>,
}

pub struct PaymentService {
    signer: RequestSigner,
    verifier: CallbackVerifier,
    store: PendingPayloadStore,
    machine: Arc<TransactionStateMachine>,
    poller: Arc<StatusPoller>,
    interceptor: DeepLinkInterceptor,
    popup: Arc<PopupMonitor>,
    popups: Mutex<HashMap<String, PopupWatch>>,
    settings: ServiceSettings,
}

impl PaymentService {
    pub fn new(
        signer: RequestSigner,
        verifier: CallbackVerifier,
        store: PendingPayloadStore,
        backend: Arc<dyn StatusBackend>,
        launcher: Arc<dyn UrlLauncher>,
        settings: ServiceSettings,
    ) -> Self {
        let machine = Arc::new(TransactionStateMachine::new(store.clone()));
        let poller = Arc::new(StatusPoller::new(
            backend,
            store.clone(),
            Arc::clone(&machine),
            settings.poller.clone(),
        ));

        Self {
            signer,
            verifier,
            store,
            machine,
            poller,
            interceptor: DeepLinkInterceptor::new(launcher),
            popup: Arc::new(PopupMonitor::new(settings.popup_check_interval)),
            popups: Mutex::new(HashMap::new()),
            settings,
        }
    }

    pub fn machine(&self) -> &Arc<TransactionStateMachine> {
        &self.machine
    }

    pub fn poller(&self) -> &Arc<StatusPoller> {
        &self.poller
    }

    pub fn callback_url(&self) -> String {
        format!(
            "{}{}",
            self.settings.callback_base_url.trim_end_matches('/'),
            CALLBACK_PATH
        )
    }

    /// Signs the request, stores the recovery payload and hands the
    /// transaction to its channel
    pub async fn initiate(&self, payment: InitiatePayment) -> PaymentResult<InitiatedPayment> {
        let mut request = payment.request;
        let callback_url = self.callback_url();
        request.success_url = callback_url.clone();
        request.failure_url = callback_url.clone();
        request.cancel_url = callback_url;

        let amount = request.amount;
        let signed = self.signer.sign(request)?;
        let transaction_id = signed.transaction_id.clone();

        self.machine.begin(&transaction_id).await?;

        let payload = PendingPayload {
            transaction_id: transaction_id.clone(),
            view_bill_response: payment.view_bill_response,
            validity: payment.validity,
            operator_id: payment.operator_id,
            circle_id: payment.circle_id,
            amount,
            payment_type: payment.payment_type,
            created_at: Utc::now(),
            original_request_params: payment.original_request_params,
        };
        if let Err(e) = self.store.save(&payload).await {
            // Recovery falls back to the backend re-fetch
            warn!(transaction_id = %transaction_id, "Could not store pending payload: {}", e);
        }

        let state = if payment.payment_type == PaymentType::Gateway {
            self.machine
                .hand_off(&transaction_id, payment.channel)
                .await?
                .state()
                .clone()
        } else {
            TransactionState::Submitted
        };

        info!(
            transaction_id = %transaction_id,
            payment_type = %payment.payment_type,
            amount = %signed.amount,
            "Payment initiated"
        );

        Ok(InitiatedPayment {
            transaction_id,
            gateway_url: self.settings.gateway_url.clone(),
            signed,
            state,
        })
    }

    /// Same-tab return from the gateway
    pub async fn handle_callback(&self, callback: GatewayCallback) -> PaymentResult<CallbackResponse> {
        let handling = self.machine.handle_callback(&callback, &self.verifier).await?;
        let state = handling.transition.state().clone();
        self.follow_up(&handling.transaction_id, &state);

        let verified = handling.id_source == IdSource::Callback && handling.verification.is_valid;
        let amount = callback
            .amount()
            .map(str::to_string)
            .or_else(|| Some(handling.verification.amount.clone()).filter(|a| !a.is_empty()))
            .unwrap_or_default();

        Ok(CallbackResponse {
            txn_id: handling.transaction_id.clone(),
            transaction_id: handling.transaction_id,
            amount,
            product_info: callback.product_info().unwrap_or_default().to_string(),
            payment_status: state.to_string(),
            payment_method: callback.payment_method().unwrap_or_default().to_string(),
            is_payment_verified: verified,
            message: state.reason().map(str::to_string),
        })
    }

    /// Wallet or UPI payment answered by the backend without a gateway hop
    pub async fn apply_backend_result(&self, result: BackendPaymentResult) -> PaymentResult<Transition> {
        let transaction_id = result.transaction_id.clone();
        let transition = self
            .machine
            .apply(&transaction_id, TransactionEvent::BackendResult(result))
            .await?;
        self.follow_up(&transaction_id, transition.state());
        Ok(transition)
    }

    /// Wallet or UPI submission that never got an answer
    pub async fn submission_failed(
        &self,
        transaction_id: &str,
        error: &PaymentError,
    ) -> PaymentResult<Transition> {
        warn!(transaction_id = %transaction_id, "Payment submission failed: {}", error);
        self.machine
            .apply(transaction_id, TransactionEvent::LocalFailure(error.user_message()))
            .await
    }

    /// Popup closed, embedded browser finished, or the user says they paid.
    /// Parks the transaction in `Pending` and starts polling. Ids this
    /// service never issued are rejected.
    pub async fn channel_inconclusive(&self, transaction_id: &str) -> PaymentResult<Transition> {
        self.ensure_known(transaction_id).await?;
        let transition = self
            .machine
            .apply(transaction_id, TransactionEvent::ChannelInconclusive)
            .await?;
        self.follow_up(transaction_id, transition.state());
        Ok(transition)
    }

    /// "I completed the payment" from the user. Never proof of success.
    pub async fn manual_confirmation(&self, transaction_id: &str) -> PaymentResult<Transition> {
        info!(transaction_id = %transaction_id, "User reported payment as completed");
        self.channel_inconclusive(transaction_id).await
    }

    /// Watches a gateway popup and parks the transaction once it closes.
    /// A second watch for the same id replaces the first.
    pub fn watch_popup(&self, transaction_id: &str, probe: Arc<dyn WindowProbe>) -> PopupCancel {
        let (cancel, receiver) = PopupMonitor::cancel_pair();
        if self.poller.is_stopped() {
            debug!(transaction_id = %transaction_id, "Service stopped, popup not watched");
            cancel.cancel();
            return cancel;
        }

        let monitor = Arc::clone(&self.popup);
        let machine = Arc::clone(&self.machine);
        let poller = Arc::clone(&self.poller);
        let id = transaction_id.to_string();

        let handle = tokio::spawn(async move {
            if monitor.watch(probe.as_ref(), receiver).await != PopupOutcome::Closed {
                return;
            }
            if poller.is_stopped() {
                return;
            }
            if !machine.is_known(&id).await {
                warn!(transaction_id = %id, "Popup closed for unknown transaction");
                return;
            }
            match machine.apply(&id, TransactionEvent::ChannelInconclusive).await {
                Ok(transition) if transition.state().can_poll() => poller.start(&id),
                Ok(_) => {}
                Err(e) => warn!(transaction_id = %id, "Could not record popup closure: {}", e),
            }
        });

        let mut popups = self.lock_popups();
        popups.retain(|_, watch| !watch.handle.is_finished());
        if let Some(previous) = popups.insert(
            transaction_id.to_string(),
            PopupWatch {
                cancel: cancel.clone(),
                handle,
            },
        ) {
            previous.cancel.cancel();
        }

        cancel
    }

    /// Pre-navigation gate of the embedded browser
    pub fn navigate(&self, url: &str) -> NavigationDecision {
        self.interceptor.should_allow_navigation(url)
    }

    pub fn bridge_message(&self, raw: &str) -> BridgeAction {
        self.interceptor.handle_bridge_message(raw)
    }

    /// Post-navigation check. When the location looks like the end of the
    /// gateway flow the surface closes and the transaction goes to polling.
    pub async fn location_changed(
        &self,
        transaction_id: Option<&str>,
        url: &str,
    ) -> PaymentResult<Option<SurfaceExit>> {
        let Some(heuristic) = self.interceptor.observe_location(url) else {
            return Ok(None);
        };

        let transaction_id = match transaction_id {
            Some(id) => Some(id.to_string()),
            None => self.store.load().await?.map(|payload| payload.transaction_id),
        };

        let state = match &transaction_id {
            Some(id) => Some(self.channel_inconclusive(id).await?.state().clone()),
            None => {
                debug!("Embedded browser finished with no transaction to resume");
                None
            }
        };

        Ok(Some(SurfaceExit {
            heuristic,
            transaction_id,
            state,
        }))
    }

    pub async fn status(&self, transaction_id: &str) -> Option<TransactionState> {
        self.machine.state(transaction_id).await
    }

    /// Manual "check again". Re-offers polling after a local error.
    pub async fn retry(&self, transaction_id: &str) -> PaymentResult<PollOutcome> {
        if let Some(TransactionState::Error { .. }) = self.machine.state(transaction_id).await {
            self.machine
                .apply(transaction_id, TransactionEvent::ResumePolling)
                .await?;
        }

        let outcome = self.poller.trigger_now(transaction_id).await;
        if let Some(state) = self.machine.state(transaction_id).await {
            self.follow_up(transaction_id, &state);
        }
        Ok(outcome)
    }

    /// Resumes polling for a payment left in flight by a previous run
    pub async fn start(&self) -> PaymentResult<Option<String>> {
        let Some(payload) = self.store.load().await? else {
            return Ok(None);
        };
        let transaction_id = payload.transaction_id;

        if let Some(state) = self.machine.state(&transaction_id).await {
            if state.is_terminal() {
                debug!(transaction_id = %transaction_id, "Stored payment already resolved");
                return Ok(None);
            }
        }

        info!(transaction_id = %transaction_id, "Resuming in-flight payment");
        let transition = self.channel_inconclusive(&transaction_id).await?;
        Ok(transition
            .state()
            .can_poll()
            .then_some(transaction_id))
    }

    /// Stops every countdown and popup watcher
    pub fn stop(&self) {
        self.poller.stop();
        for (_, watch) in self.lock_popups().drain() {
            watch.cancel.cancel();
            watch.handle.abort();
        }
    }

    fn lock_popups(&self) -> std::sync::MutexGuard<'_, HashMap<String, PopupWatch>> {
        match self.popups.lock() {
            Ok(popups) => popups,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn ensure_known(&self, transaction_id: &str) -> PaymentResult<()> {
        if self.machine.is_known(transaction_id).await {
            return Ok(());
        }
        warn!(transaction_id = %transaction_id, "Rejecting event for unknown transaction");
        Err(PaymentError::validation(
            "transaction_id",
            format!("Unknown transaction {}", transaction_id),
        ))
    }

    fn follow_up(&self, transaction_id: &str, state: &TransactionState) {
        if state.can_poll() && !self.poller.is_running(transaction_id) {
            self.poller.start(transaction_id);
        }
    }
}

impl Drop for PaymentService {
    fn drop(&mut self) {
        self.stop();
    }
}
