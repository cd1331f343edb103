use crate::config::GatewayConfig;
use crate::identity::{Identity, IdentityRotator};
use crate::model_map::ModelMapper;
use crate::openai::ChatRequest;
use crate::proxy::ProxyManager;
use crate::upstream::{self, UpstreamCallError};
use metrics::counter;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The result of one successful attempt, handed to the streaming engine or
/// the sync assembler.
#[derive(Debug)]
pub struct RetryOutcome {
    pub response: reqwest::Response,
    pub identity: Identity,
    pub attempt: usize,
}

/// Drives up to `max_attempts` backend calls, each under a fresh identity,
/// sleeping a linearly scaled backoff between failures. Cancellation aborts
/// immediately, including mid-sleep.
pub async fn dispatch(
    client: &reqwest::Client,
    proxies: &ProxyManager,
    rotator: &IdentityRotator,
    mapper: &ModelMapper,
    config: &GatewayConfig,
    request: &ChatRequest,
    cancel: &CancellationToken,
) -> Result<RetryOutcome, UpstreamCallError> {
    let attempts = config.max_attempts.max(1);
    let backend_model = mapper.to_backend_name(&request.model);
    let mut last_err: Option<UpstreamCallError> = None;

    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(UpstreamCallError::cancelled());
        }
        let identity = rotator.next();
        let body = upstream::build_backend_body(request, &identity, &backend_model);
        counter!("linegate_upstream_attempts_total").increment(1);
        match upstream::call_backend(client, proxies, config, &body).await {
            Ok(response) => {
                return Ok(RetryOutcome {
                    response,
                    identity,
                    attempt,
                });
            }
            Err(err) => {
                tracing::warn!(
                    attempt,
                    caller_id = %identity.caller_id,
                    status = ?err.status,
                    error = %err.message,
                    "backend call failed"
                );
                last_err = Some(err);
                if attempt + 1 < attempts {
                    counter!("linegate_upstream_retries_total").increment(1);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(UpstreamCallError::cancelled()),
                        _ = tokio::time::sleep(backoff_delay(config, attempt)) => {}
                    }
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        UpstreamCallError::new(
            crate::upstream::UpstreamErrorKind::Network,
            None,
            "no attempts executed".to_string(),
        )
    }))
}

fn backoff_delay(config: &GatewayConfig, attempt: usize) -> Duration {
    let scaled = config.backoff_base_ms.saturating_mul(attempt as u64 + 1);
    Duration::from_millis(scaled.min(config.backoff_max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_ms: u64, max_ms: u64) -> GatewayConfig {
        GatewayConfig {
            backoff_base_ms: base_ms,
            backoff_max_ms: max_ms,
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn backoff_scales_linearly_with_attempt_index() {
        let config = config(500, 5_000);
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(2_000));
    }

    #[test]
    fn backoff_is_capped_at_the_maximum() {
        let config = config(2_000, 5_000);
        assert_eq!(backoff_delay(&config, 9), Duration::from_millis(5_000));
    }
}
