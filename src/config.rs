use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::payments::providers::BackendConfig;
use crate::payments::types::GatewayCredentials;
use crate::poller::PollerConfig;
use crate::service::ServiceSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub backend: BackendSettings,
    pub poller: PollerSettings,
    pub store: StoreSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            environment: "development".to_string(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct GatewayConfig {
    pub merchant_key: String,
    pub salt: String,
    pub gateway_url: String,
    pub callback_base_url: String,
    pub service_provider: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            merchant_key: String::new(),
            salt: String::new(),
            gateway_url: "https://test.payu.in/_payment".to_string(),
            callback_base_url: "http://localhost:8000".to_string(),
            service_provider: "payu_paisa".to_string(),
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("merchant_key", &self.merchant_key)
            .field("salt", &"<redacted>")
            .field("gateway_url", &self.gateway_url)
            .field("callback_base_url", &self.callback_base_url)
            .field("service_provider", &self.service_provider)
            .finish()
    }
}

impl GatewayConfig {
    pub fn credentials(&self) -> GatewayCredentials {
        GatewayCredentials::new(self.merchant_key.clone(), self.salt.clone())
    }
}

#[derive(Clone, Deserialize)]
pub struct BackendSettings {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            auth_token: None,
            timeout_secs: 20,
            max_retries: 2,
        }
    }
}

impl std::fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSettings")
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl BackendSettings {
    /// Worst case of one backend call: every attempt times out and every
    /// backoff sleep (1s, 2s, 4s, ...) runs in between
    pub fn worst_case_request_time(&self) -> Duration {
        let attempts = u64::from(self.max_retries) + 1;
        let backoff = 2_u64
            .checked_pow(self.max_retries)
            .map(|total| total - 1)
            .unwrap_or(u64::MAX);
        Duration::from_secs(
            self.timeout_secs
                .saturating_mul(attempts)
                .saturating_add(backoff),
        )
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            base_url: self.base_url.clone(),
            auth_token: self.auth_token.clone(),
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollerSettings {
    pub default_interval_secs: u64,
    pub widened_interval_secs: u64,
    pub failure_escalation_threshold: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            default_interval_secs: 30,
            widened_interval_secs: 60,
            failure_escalation_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSettings {
    /// In-memory store when unset
    pub redis_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let server_defaults = ServerConfig::default();
        let server = ServerConfig {
            host: env::var("HOST").unwrap_or(server_defaults.host),
            port: parse_var("PORT", server_defaults.port)?,
            environment: env::var("ENVIRONMENT").unwrap_or(server_defaults.environment),
        };

        let gateway_defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            merchant_key: env::var("GATEWAY_MERCHANT_KEY")
                .context("GATEWAY_MERCHANT_KEY not set")?,
            salt: env::var("GATEWAY_SALT").context("GATEWAY_SALT not set")?,
            gateway_url: env::var("GATEWAY_URL").unwrap_or(gateway_defaults.gateway_url),
            callback_base_url: env::var("CALLBACK_BASE_URL")
                .unwrap_or(gateway_defaults.callback_base_url),
            service_provider: env::var("GATEWAY_SERVICE_PROVIDER")
                .unwrap_or(gateway_defaults.service_provider),
        };

        let backend_defaults = BackendSettings::default();
        let backend = BackendSettings {
            base_url: env::var("BACKEND_BASE_URL").context("BACKEND_BASE_URL not set")?,
            auth_token: env::var("BACKEND_AUTH_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
            timeout_secs: parse_var("BACKEND_TIMEOUT_SECS", backend_defaults.timeout_secs)?,
            max_retries: parse_var("BACKEND_MAX_RETRIES", backend_defaults.max_retries)?,
        };

        let poller_defaults = PollerSettings::default();
        let poller = PollerSettings {
            default_interval_secs: parse_var(
                "POLL_INTERVAL_SECS",
                poller_defaults.default_interval_secs,
            )?,
            widened_interval_secs: parse_var(
                "POLL_WIDENED_INTERVAL_SECS",
                poller_defaults.widened_interval_secs,
            )?,
            failure_escalation_threshold: parse_var(
                "POLL_FAILURE_THRESHOLD",
                poller_defaults.failure_escalation_threshold,
            )?,
        };

        let store = StoreSettings {
            redis_url: env::var("REDIS_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
        };

        let config = Config {
            server,
            gateway,
            backend,
            poller,
            store,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port < 1024 {
            return Err(anyhow!(
                "Port must be at least 1024, got {}",
                self.server.port
            ));
        }

        let valid_environments = ["development", "staging", "production"];
        if !valid_environments.contains(&self.server.environment.as_str()) {
            return Err(anyhow!(
                "Environment must be one of: {:?}, got {}",
                valid_environments,
                self.server.environment
            ));
        }

        if self.gateway.merchant_key.trim().is_empty() {
            return Err(anyhow!("GATEWAY_MERCHANT_KEY cannot be empty"));
        }

        if self.gateway.salt.trim().is_empty() {
            return Err(anyhow!("GATEWAY_SALT cannot be empty"));
        }

        for (name, value) in [
            ("GATEWAY_URL", &self.gateway.gateway_url),
            ("CALLBACK_BASE_URL", &self.gateway.callback_base_url),
            ("BACKEND_BASE_URL", &self.backend.base_url),
        ] {
            url::Url::parse(value).with_context(|| format!("{} is not a valid URL", name))?;
        }

        // Production callbacks must come back over TLS
        if self.server.environment == "production"
            && !self.gateway.callback_base_url.starts_with("https://")
        {
            return Err(anyhow!("CALLBACK_BASE_URL must use https in production"));
        }

        if !(15..=25).contains(&self.backend.timeout_secs) {
            return Err(anyhow!(
                "BACKEND_TIMEOUT_SECS must be between 15 and 25, got {}",
                self.backend.timeout_secs
            ));
        }

        if self.backend.max_retries > 5 {
            return Err(anyhow!(
                "BACKEND_MAX_RETRIES must be at most 5, got {}",
                self.backend.max_retries
            ));
        }

        if self.poller.default_interval_secs == 0 {
            return Err(anyhow!("POLL_INTERVAL_SECS must be greater than 0"));
        }

        if self.poller.widened_interval_secs < self.poller.default_interval_secs {
            return Err(anyhow!(
                "POLL_WIDENED_INTERVAL_SECS must not be shorter than POLL_INTERVAL_SECS"
            ));
        }

        if self.poller.failure_escalation_threshold == 0 {
            return Err(anyhow!("POLL_FAILURE_THRESHOLD must be greater than 0"));
        }

        Ok(())
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            default_interval: Duration::from_secs(self.poller.default_interval_secs),
            widened_interval: Duration::from_secs(self.poller.widened_interval_secs),
            failure_escalation_threshold: self.poller.failure_escalation_threshold,
            request_timeout: self.backend.worst_case_request_time(),
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            gateway_url: self.gateway.gateway_url.clone(),
            callback_base_url: self.gateway.callback_base_url.clone(),
            poller: self.poller_config(),
            ..ServiceSettings::default()
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("{} must be a valid number, got {}", name, raw)),
        Err(_) => Ok(default),
    }
}
