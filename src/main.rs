use anyhow::{Context, Result};
use recharge_payments::api::{self, AppState};
use recharge_payments::config::Config;
use recharge_payments::deeplink::ClientLauncher;
use recharge_payments::payments::providers::RechargeBackend;
use recharge_payments::payments::{CallbackVerifier, RequestSigner};
use recharge_payments::service::PaymentService;
use recharge_payments::store::{KeyValueStore, MemoryStore, PendingPayloadStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Starting recharge payments service");
    tracing::info!("Environment: {}", config.server.environment);
    tracing::info!("Gateway: {}", config.gateway.gateway_url);

    let (kv, store_backend) = build_store(&config).await;
    let store = PendingPayloadStore::new(kv);

    let backend = RechargeBackend::new(config.backend.backend_config())
        .context("Failed to build recharge backend client")?;

    let credentials = config.gateway.credentials();
    let service = Arc::new(PaymentService::new(
        RequestSigner::new(credentials.clone(), config.gateway.service_provider.clone()),
        CallbackVerifier::new(credentials),
        store,
        Arc::new(backend),
        Arc::new(ClientLauncher),
        config.service_settings(),
    ));

    match service.start().await {
        Ok(Some(transaction_id)) => {
            tracing::info!(transaction_id = %transaction_id, "Resumed polling for in-flight payment")
        }
        Ok(None) => {}
        Err(e) => tracing::warn!("Could not resume in-flight payment: {}", e),
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("HOST and PORT do not form a valid socket address")?;

    let state = AppState {
        config: Arc::new(config),
        service: Arc::clone(&service),
        store_backend,
    };

    let app = api::router(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.stop();
    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,recharge_payments=debug,tower_http=info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(feature = "cache")]
async fn build_store(config: &Config) -> (Arc<dyn KeyValueStore>, &'static str) {
    use recharge_payments::store::{init_store_pool, RedisStore, StoreConfig};

    let Some(redis_url) = config.store.redis_url.clone() else {
        tracing::info!("No REDIS_URL set, keeping pending payloads in memory");
        return (Arc::new(MemoryStore::new()), "memory");
    };

    let store_config = StoreConfig {
        redis_url,
        ..StoreConfig::default()
    };
    match init_store_pool(store_config).await {
        Ok(pool) => (Arc::new(RedisStore::new(pool)), "redis"),
        Err(e) => {
            tracing::warn!("Redis unavailable, falling back to in-memory store: {}", e);
            (Arc::new(MemoryStore::new()), "memory")
        }
    }
}

#[cfg(not(feature = "cache"))]
async fn build_store(_config: &Config) -> (Arc<dyn KeyValueStore>, &'static str) {
    (Arc::new(MemoryStore::new()), "memory")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}
