//! Outbound RPC protection: token-bucket rate limiting plus a circuit
//! breaker around the peer-service client.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use model::ProductDetail;
use tracing::warn;

use crate::ServiceError;

/// Client of the product service consumed by order reads. The transport
/// (gRPC/HTTP) behind it is an external collaborator; only this contract
/// is part of the core.
#[async_trait]
pub trait ProductClient: Send + Sync {
    async fn get_product_detail(&self, product_id: u64) -> Result<ProductDetail, ServiceError>;
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Consecutive-failure circuit breaker.
///
/// Trips open after `threshold` consecutive failures, half-opens after
/// `open_timeout` to let one probe call through, and closes again on the
/// first success.
pub struct CircuitBreaker {
    threshold: u32,
    open_timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            open_timeout,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    /// Returns whether a call may proceed right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= self.open_timeout {
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // One probe is already in flight.
            BreakerState::HalfOpen => false,
        }
    }

    pub fn record_success(&self) {
        *self.state.lock().unwrap() = BreakerState::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        *state = match *state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    BreakerState::Open {
                        since: Instant::now(),
                    }
                } else {
                    BreakerState::Closed { failures }
                }
            }
            BreakerState::HalfOpen | BreakerState::Open { .. } => BreakerState::Open {
                since: Instant::now(),
            },
        };
    }
}

/// ProductClient wrapper enforcing the outbound call protections.
pub struct ResilientProductClient {
    inner: Arc<dyn ProductClient>,
    limiter: DefaultDirectRateLimiter,
    breaker: CircuitBreaker,
}

impl ResilientProductClient {
    pub fn new(
        inner: Arc<dyn ProductClient>,
        rps: u32,
        breaker_threshold: u32,
        breaker_timeout: Duration,
    ) -> Self {
        let rps = NonZeroU32::new(rps.max(1)).unwrap();
        Self {
            inner,
            limiter: RateLimiter::direct(Quota::per_second(rps)),
            breaker: CircuitBreaker::new(breaker_threshold, breaker_timeout),
        }
    }
}

#[async_trait]
impl ProductClient for ResilientProductClient {
    async fn get_product_detail(&self, product_id: u64) -> Result<ProductDetail, ServiceError> {
        if !self.breaker.try_acquire() {
            warn!(product_id, "product client circuit open, call rejected");
            return Err(ServiceError::CircuitOpen);
        }
        self.limiter.until_ready().await;
        match self.inner.get_product_detail(product_id).await {
            Ok(detail) => {
                self.breaker.record_success();
                Ok(detail)
            }
            // A clean NotFound is an answer, not a peer outage.
            Err(e @ ServiceError::NotFound) => {
                self.breaker.record_success();
                Err(e)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FlakyClient {
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    impl FlakyClient {
        fn failing() -> Self {
            Self {
                failing: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
            }
        }

        fn transport_error() -> ServiceError {
            // Any non-business error counts against the breaker.
            ServiceError::UnknownHandler("transport failure".into())
        }
    }

    #[async_trait]
    impl ProductClient for FlakyClient {
        async fn get_product_detail(
            &self,
            _product_id: u64,
        ) -> Result<ProductDetail, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(Self::transport_error())
            } else {
                Ok(ProductDetail::default())
            }
        }
    }

    #[tokio::test]
    async fn test_breaker_trips_after_consecutive_failures() {
        let inner = Arc::new(FlakyClient::failing());
        let client = ResilientProductClient::new(
            Arc::clone(&inner) as _,
            1000,
            3,
            Duration::from_millis(100),
        );

        for _ in 0..3 {
            assert!(client.get_product_detail(1).await.is_err());
        }
        // Breaker is open: the inner client is no longer reached.
        let err = client.get_product_detail(1).await.unwrap_err();
        assert!(matches!(err, ServiceError::CircuitOpen));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_breaker_half_opens_and_closes_on_success() {
        let inner = Arc::new(FlakyClient::failing());
        let client = ResilientProductClient::new(
            Arc::clone(&inner) as _,
            1000,
            2,
            Duration::from_millis(50),
        );

        for _ in 0..2 {
            let _ = client.get_product_detail(1).await;
        }
        assert!(matches!(
            client.get_product_detail(1).await.unwrap_err(),
            ServiceError::CircuitOpen
        ));

        inner.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        // Half-open probe succeeds and the breaker closes again.
        assert!(client.get_product_detail(1).await.is_ok());
        assert!(client.get_product_detail(1).await.is_ok());
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert!(breaker.try_acquire());
        // Second caller is rejected while the probe is in flight.
        assert!(!breaker.try_acquire());
        breaker.record_success();
        assert!(breaker.try_acquire());
    }
}
