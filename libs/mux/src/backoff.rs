//! Bounded exponential backoff around binding the listen socket.

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::BindError;
use crate::listener::RawListener;

/// Exponential backoff configuration.
///
/// The wait before retry `n` (zero based) is `duration * factor^n`, perturbed
/// by up to `± jitter` of that interval and optionally capped by `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Interval before the first retry.
    pub duration: Duration,

    /// Multiplier applied per attempt.
    pub factor: f64,

    /// Jitter fraction (0.0 to 1.0).
    pub jitter: f64,

    /// Total number of attempts, including the first.
    pub steps: u32,

    /// Upper bound for a single interval.
    pub max: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(500),
            factor: 1.0,
            jitter: 0.1,
            steps: 5,
            max: None,
        }
    }
}

impl Backoff {
    /// Interval before retry `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.factor.max(1.0);
        let secs = self.duration.as_secs_f64() * factor.powi(attempt as i32);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Interval before retry `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }

        let spread = rand::rng().random_range(-jitter..=jitter);
        Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + spread)).unwrap_or(base)
    }

    /// The intervals waited between attempts; one fewer than `steps`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.steps.saturating_sub(1)).map(|attempt| self.delay(attempt))
    }
}

/// Bind `addr`, retrying according to `backoff`.
///
/// Each failure is logged. Gives up with [`BindError::Exhausted`] once
/// `backoff.steps` attempts failed, or with [`BindError::Cancelled`] as soon as
/// `shutdown` turns true.
pub async fn bind_with_backoff(
    addr: &str,
    backoff: &Backoff,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<RawListener, BindError> {
    let steps = backoff.steps.max(1);
    let mut attempt = 0;

    loop {
        if *shutdown.borrow() {
            return Err(BindError::Cancelled {
                addr: addr.to_string(),
                attempts: attempt,
            });
        }

        attempt += 1;
        let err = match RawListener::bind(addr).await {
            Ok(listener) => {
                info!(addr = %addr, attempt, "Bound tcp listener");
                return Ok(listener);
            }
            Err(e) => e,
        };

        error!(addr = %addr, attempt, error = %err, "in backoff - failed to bind tcp listener");

        if attempt >= steps {
            return Err(BindError::Exhausted {
                addr: addr.to_string(),
                attempts: attempt,
                source: err,
            });
        }

        let delay = backoff.delay(attempt - 1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait_for(|stop| *stop) => {
                return Err(BindError::Cancelled {
                    addr: addr.to_string(),
                    attempts: attempt,
                });
            }
        }
    }
}

/// Normalise a bare `:port` address into one tokio can resolve.
pub fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::Listener;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn policy(steps: u32) -> Backoff {
        Backoff {
            duration: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.1,
            steps,
            max: None,
        }
    }

    #[test]
    fn test_backoff_default() {
        let backoff = Backoff::default();
        assert_eq!(backoff.steps, 5);
        assert_eq!(backoff.duration, Duration::from_millis(500));
        assert_eq!(backoff.factor, 1.0);
        assert_eq!(backoff.jitter, 0.1);
    }

    #[test]
    fn test_delay_within_jitter_bounds() {
        let backoff = policy(8);
        for attempt in 0..8 {
            let base = Duration::from_millis(10).as_secs_f64() * 2f64.powi(attempt as i32);
            for _ in 0..50 {
                let delay = backoff.delay(attempt).as_secs_f64();
                assert!(delay >= base * 0.9 - 1e-9, "attempt {attempt}: {delay} < {base}");
                assert!(delay <= base * 1.1 + 1e-9, "attempt {attempt}: {delay} > {base}");
            }
        }
    }

    #[test]
    fn test_base_delay_non_decreasing() {
        let backoff = policy(10);
        let delays: Vec<_> = (0..10).map(|n| backoff.base_delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_base_delay_capped() {
        let backoff = Backoff {
            max: Some(Duration::from_millis(50)),
            ..policy(10)
        };
        assert_eq!(backoff.base_delay(9), Duration::from_millis(50));
    }

    #[test]
    fn test_delays_count() {
        assert_eq!(policy(5).delays().count(), 4);
        assert_eq!(policy(1).delays().count(), 0);
        assert_eq!(policy(0).delays().count(), 0);
    }

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_addr("127.0.0.1:80"), "127.0.0.1:80");
        assert_eq!(normalize_addr("[::1]:80"), "[::1]:80");
    }

    #[tokio::test]
    async fn test_bind_succeeds_first_attempt() {
        let (_tx, mut rx) = watch::channel(false);
        let listener = bind_with_backoff("127.0.0.1:0", &policy(3), &mut rx)
            .await
            .unwrap();
        assert!(listener.local_addr().is_ok());
    }

    #[tokio::test]
    async fn test_bind_exhausts_exact_step_count() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let (_tx, mut rx) = watch::channel(false);

        let err = bind_with_backoff(&addr, &policy(3), &mut rx)
            .await
            .unwrap_err();

        match err {
            BindError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bind_cancelled_promptly() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let (tx, mut rx) = watch::channel(false);

        let slow = Backoff {
            duration: Duration::from_secs(30),
            factor: 1.0,
            jitter: 0.0,
            steps: 100,
            max: None,
        };

        let started = Instant::now();
        let handle = tokio::spawn(async move { bind_with_backoff(&addr, &slow, &mut rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, BindError::Cancelled { attempts: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
