//! Benjamin server: wires model chains, memory, the shell bridge and channels into one
//! [`MessageHandler`], then serves it over Telegram and the local HTTP API.

use crate::capabilities::{Capabilities, LlmCritic, LlmGenerator, LlmPlanRouter};
use crate::catalog::CapabilityCatalog;
use crate::commands::CommandParser;
use crate::config::BenjaminConfig;
use crate::gateway::Gateway;
use crate::handler::MessageHandler;
use crate::locale::Locale;
use crate::memory::{MemoryStore, SqliteMemoryStore};
use crate::orchestrator::Orchestrator;
use crate::plan::GovernorDefaults;
use crate::routes;
use crate::session::SessionManager;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use bn_channels::{ChannelAdapter, TelegramAdapter};
use bn_llm::ModelChain;
use bn_tools::{SandboxedShell, ShellPolicy};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const HTTP_TIMEOUT: Duration = Duration::from_secs(300);
const HTTP_MAX_IN_FLIGHT: usize = 64;
const INBOUND_QUEUE: usize = 1024;

pub struct AppState {
    pub handler: Arc<MessageHandler>,
    pub locale: Locale,
    pub started_at: Instant,
    pub channels: Vec<String>,
}

impl AppState {
    pub fn sessions(&self) -> &Arc<SessionManager> {
        self.handler.sessions()
    }
}

pub struct ModelChains {
    pub router: ModelChain,
    pub worker: ModelChain,
    pub grounded: ModelChain,
    pub critic: ModelChain,
}

pub fn build_model_chains(cfg: &BenjaminConfig) -> Result<ModelChains> {
    let chain = |capability: &str, models: &[String]| -> Result<ModelChain> {
        let chain = ModelChain::from_models(capability, models, |p| cfg.keys.for_provider(p));
        if chain.is_empty() {
            return Err(anyhow::anyhow!(
                "no usable {capability} model: none of {models:?} has an api key"
            ));
        }
        Ok(chain)
    };
    Ok(ModelChains {
        router: chain("router", &cfg.models.router)?,
        worker: chain("worker", &cfg.models.worker)?,
        grounded: chain("grounded", &cfg.models.grounded)?,
        critic: chain("critic", &cfg.models.critic)?,
    })
}

pub fn build_handler(cfg: &BenjaminConfig) -> Result<Arc<MessageHandler>> {
    let chains = build_model_chains(cfg)?;
    tracing::info!(
        router = ?chains.router.models(),
        worker = ?chains.worker.models(),
        grounded = ?chains.grounded.models(),
        critic = ?chains.critic.models(),
        "model chains initialized"
    );

    let memory: Arc<dyn MemoryStore> = Arc::new(SqliteMemoryStore::open(&cfg.memory_db_path())?);

    let shell = SandboxedShell::new(ShellPolicy {
        sandbox_root: cfg.sandbox_root(),
        timeout: Duration::from_secs(cfg.agent.command_timeout_seconds),
        extra_programs: cfg.agent.extra_allowed_programs.clone(),
    });
    tracing::info!(sandbox_root = %shell.policy().sandbox_root.display(), "shell bridge ready");

    let capabilities = Capabilities {
        router: Arc::new(LlmPlanRouter::new(chains.router)),
        generator: Arc::new(LlmGenerator::new(chains.worker, chains.grounded)),
        critic: Arc::new(LlmCritic::new(chains.critic)),
        runner: Arc::new(shell),
    };
    let locale = cfg.general.locale;
    let orchestrator = Orchestrator::new(
        capabilities,
        Arc::new(CapabilityCatalog::with_overrides(&cfg.agent.intent_levels)),
        locale,
        GovernorDefaults::from(&cfg.agent),
    );

    Ok(Arc::new(MessageHandler::new(
        Arc::new(orchestrator),
        Arc::new(SessionManager::new(cfg.general.conversation_window)),
        memory,
        CommandParser::new(locale)?,
    )))
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = BenjaminConfig::load(config_path).await?;
    let chains = build_model_chains(&cfg)?;
    let store = SqliteMemoryStore::open(&cfg.memory_db_path())?;
    store.list_recent("doctor", 1).await?;
    tracing::info!(
        locale = ?cfg.general.locale,
        router = ?chains.router.models(),
        worker = ?chains.worker.models(),
        grounded = ?chains.grounded.models(),
        critic = ?chains.critic.models(),
        memory_db = %cfg.memory_db_path().display(),
        sandbox_root = %cfg.sandbox_root().display(),
        telegram_enabled = cfg.channels.telegram.enabled,
        http_enabled = cfg.http.enabled,
        "config ok"
    );
    Ok(())
}

/// Handles one message without starting any channel and returns the reply.
pub async fn chat_once(config_path: Option<PathBuf>, user_id: &str, message: &str) -> Result<String> {
    let cfg = BenjaminConfig::load(config_path).await?;
    let handler = build_handler(&cfg)?;
    Ok(handler.handle(message, user_id).await)
}

pub fn app_router(state: Arc<AppState>) -> axum::Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_response(|response: &Response, latency: Duration, _span: &tracing::Span| {
            tracing::info!(
                status = response.status().as_u16(),
                latency_ms = latency.as_millis() as u64,
                "http request completed"
            );
        })
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(HTTP_MAX_IN_FLIGHT))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            HTTP_TIMEOUT,
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = BenjaminConfig::load(config_path).await?;
    if !cfg.http.enabled && !cfg.channels.telegram.enabled {
        return Err(anyhow::anyhow!(
            "nothing to serve: enable http or channels.telegram"
        ));
    }
    tracing::info!(
        locale = ?cfg.general.locale,
        conversation_window = cfg.general.conversation_window,
        http_enabled = cfg.http.enabled,
        http_port = cfg.http.port,
        telegram_enabled = cfg.channels.telegram.enabled,
        allowed_users = cfg.security.allowed_users.len(),
        allow_all_senders = cfg.security.allow_all_senders,
        "server configuration loaded"
    );

    let handler = build_handler(&cfg)?;
    let shutdown = CancellationToken::new();

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(INBOUND_QUEUE);
    let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    if cfg.channels.telegram.enabled {
        let telegram = Arc::new(TelegramAdapter::new(&cfg.channels.telegram.bot_token)?);
        telegram.start(inbound_tx.clone()).await?;
        channels.insert(telegram.channel_id().to_string(), telegram);
    }
    drop(inbound_tx);

    let mut channel_names: Vec<String> = channels.keys().cloned().collect();
    channel_names.sort();
    let gateway = Arc::new(Gateway::new(
        cfg.security.clone(),
        handler.clone(),
        channels,
        inbound_rx,
    ));
    let gateway_handle = gateway.start(shutdown.child_token());
    tracing::info!(channels = ?channel_names, "gateway started");

    if cfg.http.enabled {
        let addr = SocketAddr::from(([127, 0, 0, 1], cfg.http.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("bind {addr}: {e}"))?;
        let state = Arc::new(AppState {
            handler,
            locale: cfg.general.locale,
            started_at: Instant::now(),
            channels: channel_names,
        });

        tracing::info!(%addr, "benjamin serving");
        axum::serve(listener, app_router(state))
            .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
            .await?;
        tracing::info!("http server shutdown completed");
    } else {
        shutdown_signal(shutdown.clone()).await;
    }

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }
    Ok(())
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }
    shutdown.cancel();
}
