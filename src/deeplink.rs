//! Deep-link interception for the embedded browser surface
//!
//! Gateways running inside an embedded browser try to open UPI and wallet
//! apps through custom schemes and Android `intent://` wrappers. Loading those
//! as web pages fails, so every navigation goes through
//! [`DeepLinkInterceptor::should_allow_navigation`] first and payment-app links
//! are handed to the OS instead.

use crate::payments::traits::UrlLauncher;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

/// Schemes the embedded browser loads itself
pub const WEB_SCHEMES: [&str; 5] = ["http", "https", "data", "about", "file"];

/// Payment-app schemes launched natively
pub const VENDOR_SCHEMES: [&str; 10] = [
    "upi",
    "phonepe",
    "paytmmp",
    "paytm",
    "tez",
    "gpay",
    "bhim",
    "credpay",
    "mobikwik",
    "amazonpay",
];

/// Alternates tried with the intent's query string when the direct launch fails
const FALLBACK_PREFIXES: [&str; 5] = [
    "phonepe://pay?",
    "paytmmp://pay?",
    "tez://upi/pay?",
    "gpay://upi/pay?",
    "upi://pay?",
];

/// Location substrings that mean the gateway flow is over
const EXIT_MARKERS: [(&str, NavigationHeuristic); 4] = [
    ("success", NavigationHeuristic::Success),
    ("completed", NavigationHeuristic::Completed),
    ("failed", NavigationHeuristic::Failed),
    ("cancel", NavigationHeuristic::Cancelled),
];

static INTENT_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?i)^intent://(?P<path>[^#]*)#Intent;(?P<extras>.*)$"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeepLinkEvent {
    pub raw_url: String,
    pub scheme: String,
    pub is_intent_wrapper: bool,
    pub unwrapped_url: Option<String>,
}

/// Parsed `intent://…#Intent;…;end` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentUri {
    /// Everything between `intent://` and `#Intent;`
    pub path: String,
    pub scheme: Option<String>,
    pub package: Option<String>,
}

impl IntentUri {
    pub fn parse(url: &str) -> Option<Self> {
        let captures = INTENT_RE.as_ref().ok()?.captures(url.trim())?;
        let path = captures.name("path")?.as_str().to_string();

        let mut scheme = None;
        let mut package = None;
        for extra in captures.name("extras")?.as_str().split(';') {
            if extra == "end" {
                break;
            }
            match extra.split_once('=') {
                Some(("scheme", value)) if !value.is_empty() => {
                    scheme = Some(value.to_ascii_lowercase())
                }
                Some(("package", value)) if !value.is_empty() => package = Some(value.to_string()),
                _ => {}
            }
        }

        Some(Self {
            path,
            scheme,
            package,
        })
    }

    /// Direct `scheme://path` URI. A leading path segment that repeats the
    /// scheme (`intent://upi/pay` with `scheme=upi`) is folded away.
    pub fn direct_url(&self) -> Option<String> {
        let scheme = self.scheme.as_deref()?;
        let path = self
            .path
            .strip_prefix(scheme)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(&self.path);
        Some(format!("{}://{}", scheme, path))
    }

    pub fn query(&self) -> Option<&str> {
        self.path
            .split_once('?')
            .map(|(_, query)| query)
            .filter(|q| !q.is_empty())
    }

    /// Vendor alternates built from the same query string
    pub fn fallback_urls(&self) -> Vec<String> {
        match self.query() {
            Some(query) => FALLBACK_PREFIXES
                .iter()
                .map(|prefix| format!("{}{}", prefix, query))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Lowercased scheme of a URL, empty when there is none
pub fn scheme_of(url: &str) -> String {
    url.trim()
        .split_once(':')
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .filter(|scheme| {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        })
        .unwrap_or_default()
}

pub fn is_vendor_scheme(scheme: &str) -> bool {
    VENDOR_SCHEMES.contains(&scheme)
}

pub fn classify(url: &str) -> DeepLinkEvent {
    let scheme = scheme_of(url);
    let intent = if scheme == "intent" {
        IntentUri::parse(url)
    } else {
        None
    };

    DeepLinkEvent {
        raw_url: url.to_string(),
        is_intent_wrapper: scheme == "intent",
        unwrapped_url: intent.as_ref().and_then(IntentUri::direct_url),
        scheme,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavigationDecision {
    pub allow: bool,
    pub dispatched_externally: bool,
    /// The URL the launcher accepted, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launched_url: Option<String>,
}

impl NavigationDecision {
    fn allow() -> Self {
        Self {
            allow: true,
            dispatched_externally: false,
            launched_url: None,
        }
    }

    fn block(launched_url: Option<String>) -> Self {
        Self {
            allow: false,
            dispatched_externally: launched_url.is_some(),
            launched_url,
        }
    }
}

/// Messages posted by content running inside the embedded browser
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeMessage {
    #[serde(rename = "upi-link")]
    UpiLink { url: String },
    #[serde(rename = "goto-home")]
    GotoHome,
}

impl BridgeMessage {
    /// Accepts the JSON form or the plain `goto-home` string
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed == "goto-home" {
            return Some(BridgeMessage::GotoHome);
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(serde_json::Value::String(s)) if s == "goto-home" => Some(BridgeMessage::GotoHome),
            Ok(value) => serde_json::from_value(value).ok(),
            Err(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BridgeAction {
    /// A payment link was handed to the OS
    LaunchedExternal { url: String, dispatched: bool },
    /// Close the embedded browser and return to the host's home screen
    GoHome,
    Ignored,
}

/// Coarse post-navigation signal. Never proof of payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationHeuristic {
    Success,
    Completed,
    Failed,
    Cancelled,
}

/// Launcher for hosts that open apps on the client side. Accepts every URL;
/// the client opens [`NavigationDecision::launched_url`] itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientLauncher;

impl UrlLauncher for ClientLauncher {
    fn open_url(&self, url: &str) -> Result<(), String> {
        debug!(scheme = %scheme_of(url), "Deferring app launch to client");
        Ok(())
    }
}

pub struct DeepLinkInterceptor {
    launcher: Arc<dyn UrlLauncher>,
}

impl DeepLinkInterceptor {
    pub fn new(launcher: Arc<dyn UrlLauncher>) -> Self {
        Self { launcher }
    }

    /// Pre-navigation gate
    pub fn should_allow_navigation(&self, url: &str) -> NavigationDecision {
        let event = classify(url);

        if event.is_intent_wrapper {
            return NavigationDecision::block(self.dispatch_intent(url));
        }

        if is_vendor_scheme(&event.scheme) {
            return NavigationDecision::block(self.launch(url));
        }

        if WEB_SCHEMES.contains(&event.scheme.as_str()) {
            return NavigationDecision::allow();
        }

        debug!(scheme = %event.scheme, "Blocking navigation to unsupported scheme");
        NavigationDecision::block(None)
    }

    /// Handles a message posted from inside the embedded browser
    pub fn handle_bridge_message(&self, raw: &str) -> BridgeAction {
        match BridgeMessage::parse(raw) {
            Some(BridgeMessage::GotoHome) => {
                info!("Embedded browser requested return to home");
                BridgeAction::GoHome
            }
            Some(BridgeMessage::UpiLink { url }) => {
                let scheme = scheme_of(&url);
                let launched = if scheme == "intent" {
                    self.dispatch_intent(&url)
                } else if is_vendor_scheme(&scheme) {
                    self.launch(&url)
                } else {
                    warn!(scheme = %scheme, "Ignoring bridge link with non-payment scheme");
                    return BridgeAction::Ignored;
                };
                BridgeAction::LaunchedExternal {
                    dispatched: launched.is_some(),
                    url: launched.unwrap_or(url),
                }
            }
            None => {
                debug!("Ignoring unrecognized bridge message");
                BridgeAction::Ignored
            }
        }
    }

    /// Post-navigation check of the location the surface ended up on
    pub fn observe_location(&self, url: &str) -> Option<NavigationHeuristic> {
        let lowered = url.to_ascii_lowercase();
        EXIT_MARKERS
            .iter()
            .find(|(marker, _)| lowered.contains(marker))
            .map(|(_, heuristic)| *heuristic)
    }

    /// Direct launch first, then the vendor alternates. Returns the URL that
    /// was accepted.
    fn dispatch_intent(&self, url: &str) -> Option<String> {
        let Some(intent) = IntentUri::parse(url) else {
            warn!("Malformed intent URI blocked");
            return None;
        };

        let launched = intent
            .direct_url()
            .into_iter()
            .chain(intent.fallback_urls())
            .filter(|candidate| is_vendor_scheme(&scheme_of(candidate)))
            .find_map(|candidate| self.launch(&candidate));

        if launched.is_none() {
            warn!(
                package = intent.package.as_deref().unwrap_or("unknown"),
                "No payment app handled the intent"
            );
        }
        launched
    }

    fn launch(&self, url: &str) -> Option<String> {
        match self.launcher.open_url(url) {
            Ok(()) => {
                info!(scheme = %scheme_of(url), "Launched payment app");
                Some(url.to_string())
            }
            Err(reason) => {
                // A missing app is expected; the surface stays where it was
                warn!(scheme = %scheme_of(url), "Payment app launch failed: {}", reason);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Launcher that only handles the listed schemes and records attempts
    struct RecordingLauncher {
        installed: Vec<&'static str>,
        attempts: Mutex<Vec<String>>,
    }

    impl RecordingLauncher {
        fn with(installed: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                installed,
                attempts: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    impl UrlLauncher for RecordingLauncher {
        fn open_url(&self, url: &str) -> Result<(), String> {
            self.attempts.lock().unwrap().push(url.to_string());
            if self.installed.contains(&scheme_of(url).as_str()) {
                Ok(())
            } else {
                Err("no activity found".to_string())
            }
        }
    }

    const INTENT: &str = "intent://upi/pay?pa=x&pn=y#Intent;scheme=upi;package=com.example;end";

    #[test]
    fn test_classify_intent_wrapper() {
        let event = classify(INTENT);
        assert!(event.is_intent_wrapper);
        assert_eq!(event.scheme, "intent");
        assert_eq!(event.unwrapped_url.as_deref(), Some("upi://pay?pa=x&pn=y"));
    }

    #[test]
    fn test_intent_is_blocked_and_launched() {
        let launcher = RecordingLauncher::with(vec!["upi"]);
        let interceptor = DeepLinkInterceptor::new(launcher.clone());
        let decision = interceptor.should_allow_navigation(INTENT);
        assert!(!decision.allow);
        assert!(decision.dispatched_externally);
        assert_eq!(launcher.attempts(), vec!["upi://pay?pa=x&pn=y".to_string()]);
    }

    #[test]
    fn test_intent_falls_back_to_vendor_schemes() {
        let launcher = RecordingLauncher::with(vec!["tez"]);
        let interceptor = DeepLinkInterceptor::new(launcher.clone());
        let decision = interceptor.should_allow_navigation(INTENT);
        assert!(!decision.allow);
        assert!(decision.dispatched_externally);
        assert_eq!(decision.launched_url.as_deref(), Some("tez://upi/pay?pa=x&pn=y"));
        assert_eq!(
            launcher.attempts(),
            vec![
                "upi://pay?pa=x&pn=y".to_string(),
                "phonepe://pay?pa=x&pn=y".to_string(),
                "paytmmp://pay?pa=x&pn=y".to_string(),
                "tez://upi/pay?pa=x&pn=y".to_string(),
            ]
        );
    }

    #[test]
    fn test_intent_without_any_app_is_still_blocked() {
        let interceptor = DeepLinkInterceptor::new(RecordingLauncher::with(vec![]));
        let decision = interceptor.should_allow_navigation(INTENT);
        assert_eq!(
            decision,
            NavigationDecision {
                allow: false,
                dispatched_externally: false,
                launched_url: None,
            }
        );
    }

    #[test]
    fn test_intent_keeps_host_for_other_schemes() {
        let intent =
            IntentUri::parse("intent://upi/pay?pa=x#Intent;scheme=tez;package=com.google;end")
                .unwrap();
        assert_eq!(intent.direct_url().as_deref(), Some("tez://upi/pay?pa=x"));
        assert_eq!(intent.package.as_deref(), Some("com.google"));
    }

    #[test]
    fn test_vendor_scheme_is_launched() {
        let launcher = RecordingLauncher::with(vec!["phonepe"]);
        let interceptor = DeepLinkInterceptor::new(launcher);
        let decision = interceptor.should_allow_navigation("phonepe://pay?pa=shop@ybl&am=10.00");
        assert!(!decision.allow);
        assert!(decision.dispatched_externally);
    }

    #[test]
    fn test_web_schemes_are_allowed() {
        let launcher = RecordingLauncher::with(vec![]);
        let interceptor = DeepLinkInterceptor::new(launcher.clone());
        for url in [
            "https://secure.payu.in/_payment",
            "http://localhost/",
            "about:blank",
            "data:text/html,hi",
            "file:///tmp/a.html",
        ] {
            assert!(interceptor.should_allow_navigation(url).allow, "{}", url);
        }
        assert!(launcher.attempts().is_empty());
    }

    #[test]
    fn test_unknown_scheme_is_blocked_without_launch() {
        let launcher = RecordingLauncher::with(vec![]);
        let interceptor = DeepLinkInterceptor::new(launcher.clone());
        let decision = interceptor.should_allow_navigation("javascript:alert(1)");
        assert!(!decision.allow);
        assert!(launcher.attempts().is_empty());
    }

    #[test]
    fn test_client_launcher_hands_back_unwrapped_url() {
        let interceptor = DeepLinkInterceptor::new(Arc::new(ClientLauncher));
        let decision = interceptor.should_allow_navigation(INTENT);
        assert!(!decision.allow);
        assert_eq!(decision.launched_url.as_deref(), Some("upi://pay?pa=x&pn=y"));
    }

    #[test]
    fn test_bridge_link_with_non_payment_scheme_is_ignored() {
        let launcher = RecordingLauncher::with(vec!["javascript", "https", "file"]);
        let interceptor = DeepLinkInterceptor::new(launcher.clone());
        for url in [
            "javascript:alert(document.cookie)",
            "https://evil.example.com/",
            "file:///etc/passwd",
        ] {
            let message = serde_json::json!({ "type": "upi-link", "url": url }).to_string();
            assert_eq!(
                interceptor.handle_bridge_message(&message),
                BridgeAction::Ignored,
                "{}",
                url
            );
        }
        assert!(launcher.attempts().is_empty());

        let client = DeepLinkInterceptor::new(Arc::new(ClientLauncher));
        let message = r#"{"type":"upi-link","url":"javascript:alert(document.cookie)"}"#;
        assert_eq!(client.handle_bridge_message(message), BridgeAction::Ignored);
    }

    #[test]
    fn test_intent_with_non_payment_scheme_launches_nothing() {
        let launcher = RecordingLauncher::with(vec!["javascript"]);
        let interceptor = DeepLinkInterceptor::new(launcher.clone());
        let decision = interceptor
            .should_allow_navigation("intent://alert(1)#Intent;scheme=javascript;end");
        assert!(!decision.allow);
        assert!(!decision.dispatched_externally);
        assert!(launcher.attempts().is_empty());
    }

    #[test]
    fn test_bridge_messages() {
        let launcher = RecordingLauncher::with(vec!["upi"]);
        let interceptor = DeepLinkInterceptor::new(launcher);
        assert_eq!(interceptor.handle_bridge_message("goto-home"), BridgeAction::GoHome);
        assert_eq!(
            interceptor.handle_bridge_message(r#"{"type":"goto-home"}"#),
            BridgeAction::GoHome
        );
        assert_eq!(
            interceptor.handle_bridge_message(r#"{"type":"upi-link","url":"upi://pay?pa=x"}"#),
            BridgeAction::LaunchedExternal {
                url: "upi://pay?pa=x".to_string(),
                dispatched: true
            }
        );
        assert_eq!(
            interceptor.handle_bridge_message(r#"{"type":"resize"}"#),
            BridgeAction::Ignored
        );
        assert_eq!(interceptor.handle_bridge_message("hello"), BridgeAction::Ignored);
    }

    #[test]
    fn test_observe_location_markers() {
        let interceptor = DeepLinkInterceptor::new(RecordingLauncher::with(vec![]));
        assert_eq!(
            interceptor.observe_location("https://shop.example.com/payment/success?txnid=T1"),
            Some(NavigationHeuristic::Success)
        );
        assert_eq!(
            interceptor.observe_location("https://shop.example.com/order/Cancelled"),
            Some(NavigationHeuristic::Cancelled)
        );
        assert_eq!(
            interceptor.observe_location("https://secure.payu.in/_payment"),
            None
        );
    }
}
