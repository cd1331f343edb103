use crate::cache::{MemoryCache, NoopCache, ResponseCache};
use crate::config::GatewayConfig;
use crate::error::{AppError, AppResult};
use crate::identity::IdentityRotator;
use crate::limiter::{NoopLimiter, RateLimiter, TokenBucket};
use crate::model_map::ModelMapper;
use crate::proxy::ProxyManager;
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub config: Arc<GatewayConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub rotator: Arc<IdentityRotator>,
    pub mapper: Arc<ModelMapper>,
    pub cache: Arc<dyn ResponseCache>,
    pub limiter: Arc<dyn RateLimiter>,
    pub proxies: Arc<ProxyManager>,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = std::env::var("LINEGATE_LISTEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path = std::env::var("LINEGATE_METRICS_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "/metrics".to_string());
        Self {
            listen,
            metrics_path,
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_config(RuntimeConfig::from_env(), GatewayConfig::from_env()).await
}

/// Builds the full state from a config. Disabled collaborators get non-nil
/// stand-ins (a cache that always misses, a limiter that never waits) so
/// the core never branches on their presence.
pub async fn load_state_with_config(
    runtime: RuntimeConfig,
    config: GatewayConfig,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("linegate/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let metrics = init_metrics()?;

    let rotator = Arc::new(IdentityRotator::new(
        config.caller_ids.clone(),
        config.fallback_caller_id.clone(),
    ));
    let mapper = Arc::new(ModelMapper::from_entries(&config.model_map));
    let proxies = Arc::new(ProxyManager::new(config.proxy_urls.clone()));

    let cache: Arc<dyn ResponseCache> = if config.cache_enabled {
        Arc::new(MemoryCache::new(
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_max_entries,
        ))
    } else {
        Arc::new(NoopCache)
    };

    let limiter: Arc<dyn RateLimiter> = if config.rate_limit_per_second > 0 {
        Arc::new(TokenBucket::new(
            config.rate_limit_per_second,
            config.rate_limit_burst.max(config.rate_limit_per_second),
            Duration::from_millis(config.rate_limit_max_wait_ms),
        ))
    } else {
        Arc::new(NoopLimiter)
    };

    Ok(AppState {
        runtime: Arc::new(runtime),
        config: Arc::new(config),
        http,
        metrics,
        rotator,
        mapper,
        cache,
        limiter,
        proxies,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
