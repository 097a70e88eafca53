//! Startup and shutdown wiring (§4.K). Grounded on the teacher's
//! `lib.rs::run` — install process-wide prerequisites, init logging,
//! build the long-lived services, then block until shutdown — narrowed
//! from a Tauri application lifecycle to a headless daemon's.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::error::GatewayError;
use crate::executor::homeassistant::{HomeAssistantConfig as HaClientConfig, HomeAssistantService};
use crate::executor::Executor;
use crate::gateway::{GatewayState, Orchestrator, Outcome, build_router};
use crate::gateway::auth::load_or_create_token;
use crate::messenger::console::ConsoleMessenger;
use crate::messenger::MessengerAdapter;
use crate::policy::PermissionEngine;
use crate::ratelimit::RateLimiter;
use crate::store::Store;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Gateway {
    pub orchestrator: Arc<Orchestrator>,
    pub messenger: Arc<dyn MessengerAdapter>,
    pub executor: Arc<Executor>,
    pub bind_addr: SocketAddr,
    pub bearer_token: Arc<String>,
}

/// Wire up every long-lived service described in §4.K, in dependency
/// order: store → policy engine → executor registry → messenger →
/// orchestrator. Nothing here binds a socket or starts accepting
/// connections — that is `run`'s job, so tests can build a `Gateway`
/// without touching the network.
pub async fn build(config: &RuntimeConfig, policy: crate::policy::Permissions) -> Result<Gateway, GatewayError> {
    let store = Arc::new(Store::open(&config.store_path)?);
    let engine = Arc::new(PermissionEngine::compile(&policy)?);

    let mut executor = Executor::new();
    if let Some(ha) = &config.home_assistant {
        let handler = HomeAssistantService::new(HaClientConfig { base_url: ha.base_url.clone(), access_token: ha.access_token.clone() })?;
        executor.register("home_assistant", &["ha_call_service", "ha_get_state", "ha_get_states", "ha_fire_event"], Arc::new(handler));
    }
    let executor = Arc::new(executor);

    let messenger: Arc<dyn MessengerAdapter> = build_messenger(config)?;
    messenger.start().await?;

    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit.max_requests_per_window,
        Duration::from_secs(config.rate_limit.window_secs),
        config.rate_limit.max_pending_approvals,
    ));

    let orchestrator = Orchestrator::new(
        store.clone(),
        engine,
        executor.clone(),
        messenger.clone(),
        rate_limiter,
        Duration::from_secs(config.approval_timeout_secs),
    );

    spawn_cleanup_task(store, orchestrator.clone());

    let bind_addr: SocketAddr = config
        .bind_addr
        .parse()
        .map_err(|e| GatewayError::Config(format!("invalid bind_addr {:?}: {e}", config.bind_addr)))?;

    let bearer_token = match &config.agent_token {
        Some(token) => token.clone(),
        None => load_or_create_token()?,
    };

    Ok(Gateway { orchestrator, messenger, executor, bind_addr, bearer_token: Arc::new(bearer_token) })
}

#[cfg(not(feature = "messenger-telegram"))]
fn build_messenger(config: &RuntimeConfig) -> Result<Arc<dyn MessengerAdapter>, GatewayError> {
    match config.messenger.kind.as_str() {
        "console" => Ok(Arc::new(ConsoleMessenger::new())),
        other => Err(GatewayError::Config(format!(
            "messenger.kind = {other:?} requires building with --features messenger-telegram"
        ))),
    }
}

#[cfg(feature = "messenger-telegram")]
fn build_messenger(config: &RuntimeConfig) -> Result<Arc<dyn MessengerAdapter>, GatewayError> {
    use crate::messenger::telegram::{TelegramConfig, TelegramMessenger};

    match config.messenger.kind.as_str() {
        "console" => Ok(Arc::new(ConsoleMessenger::new())),
        "telegram" => Ok(Arc::new(TelegramMessenger::new(TelegramConfig {
            token: config.messenger.telegram_token.clone(),
            allowed_chat_ids: config.messenger.allowed_chat_ids.clone(),
        }))),
        other => Err(GatewayError::Config(format!("unknown messenger.kind: {other}"))),
    }
}

fn spawn_cleanup_task(store: Arc<Store>, orchestrator: Arc<Orchestrator>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            match store.cleanup_stale(chrono::Utc::now()) {
                Ok(stale) => {
                    for record in stale {
                        // The in-memory pending entry (if the agent is
                        // still connected and waiting) resolves via the
                        // orchestrator's own timeout watcher; this sweep
                        // only needs to cover rows whose in-process timer
                        // never existed, e.g. after a restart.
                        orchestrator.resolve(&record.request_id, Outcome::TimedOut).await;
                    }
                }
                Err(e) => tracing::error!(error = %e, "stale pending-approval cleanup failed"),
            }
        }
    });
}

/// Bind and serve until `ctrl_c`, then sweep every outstanding approval
/// with [`Outcome::Shutdown`] before returning.
pub async fn run(gateway: Gateway) -> Result<(), GatewayError> {
    let state = GatewayState {
        orchestrator: gateway.orchestrator.clone(),
        bearer_token: gateway.bearer_token.clone(),
        connection_slot: Arc::new(AtomicBool::new(false)),
    };
    let app = build_router(state).await;
    let listener = crate::gateway::server::bind(gateway.bind_addr).await?;

    tracing::info!(addr = %gateway.bind_addr, "sentrygate listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    serve.await.map_err(GatewayError::Io)?;

    gateway.orchestrator.shutdown_pending().await;
    gateway.messenger.stop().await;
    gateway.executor.close_all().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
