use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug)]
pub struct WaitTimeout;

/// Admission control, consulted once at request entry before any core
/// logic runs.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn wait(&self) -> Result<(), WaitTimeout>;
}

/// Token bucket over a semaphore: a background task refills permits once a
/// second up to the burst size; callers wait up to `max_wait` for one.
pub struct TokenBucket {
    permits: Arc<Semaphore>,
    max_wait: Duration,
}

impl TokenBucket {
    pub fn new(rate_per_second: u32, burst: u32, max_wait: Duration) -> Self {
        let burst = burst.max(1) as usize;
        let permits = Arc::new(Semaphore::new(burst));
        let refill = permits.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the bucket starts full.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let headroom = burst.saturating_sub(refill.available_permits());
                refill.add_permits(headroom.min(rate_per_second.max(1) as usize));
            }
        });
        Self { permits, max_wait }
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn wait(&self) -> Result<(), WaitTimeout> {
        match tokio::time::timeout(self.max_wait, self.permits.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            Ok(Err(_)) | Err(_) => Err(WaitTimeout),
        }
    }
}

/// Disabled-state stand-in: admission always succeeds immediately.
pub struct NoopLimiter;

#[async_trait]
impl RateLimiter for NoopLimiter {
    async fn wait(&self) -> Result<(), WaitTimeout> {
        Ok(())
    }
}
