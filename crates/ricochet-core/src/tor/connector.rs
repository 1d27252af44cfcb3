//! Outbound connection retries.
//!
//! Dial attempts back off exponentially from 30 seconds up to an hour,
//! jittered by ±25% so reconnecting peers do not synchronize. The owning
//! agent resets the backoff once a connection has stayed up for a minute.

use crate::error::{Error, Result};
use crate::tor::Resolver;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Initial retry delay.
pub const BACKOFF_BASE: Duration = Duration::from_secs(30);

/// Maximum retry delay.
pub const BACKOFF_CAP: Duration = Duration::from_secs(3600);

/// Bounded exponential backoff with jitter.
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
    base: Duration,
    cap: Duration,
}

impl Backoff {
    /// Backoff with the standard 30s..60min bounds.
    pub fn new() -> Self {
        Self::with_limits(BACKOFF_BASE, BACKOFF_CAP)
    }

    /// Backoff with custom bounds.
    pub fn with_limits(base: Duration, cap: Duration) -> Self {
        Self { next: base, base, cap }
    }

    /// The delay before the next attempt. Doubles the internal delay up to
    /// the cap and jitters the returned value by ±25%.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.cap);
        delay.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
    }

    /// Return to the base delay after a sustained connection.
    pub fn reset(&mut self) {
        self.next = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Dials one peer until it succeeds or is cancelled. The backoff state is
/// shared with the owning agent so it survives handshake failures and
/// short-lived connections.
pub struct OnionConnector {
    resolver: Arc<Resolver>,
    backoff: Arc<Mutex<Backoff>>,
}

impl OnionConnector {
    /// Build a connector over shared backoff state.
    pub fn new(resolver: Arc<Resolver>, backoff: Arc<Mutex<Backoff>>) -> Self {
        Self { resolver, backoff }
    }

    /// Dial `target`, retrying with backoff until a socket connects or the
    /// token is cancelled. The first attempt is immediate.
    pub async fn connect(&self, target: &str, cancel: &CancellationToken) -> Result<TcpStream> {
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                attempt = self.resolver.dial(target) => attempt,
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(target, error = %e, "outbound dial failed");
                    self.backoff(cancel).await?;
                }
            }
        }
    }

    /// Sleep for the next backoff interval, or return early on cancel.
    /// Called by the dialer after a failed handshake as well.
    pub async fn backoff(&self, cancel: &CancellationToken) -> Result<()> {
        let delay = match self.backoff.lock() {
            Ok(mut b) => b.next_delay(),
            Err(poisoned) => poisoned.into_inner().next_delay(),
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_are_capped() {
        let mut backoff = Backoff::with_limits(Duration::from_secs(30), Duration::from_secs(3600));
        let mut raw_next = Duration::from_secs(30);
        for _ in 0..10 {
            let delay = backoff.next_delay();
            // Jitter keeps the delay within ±25% of the undoubled value.
            assert!(delay >= raw_next.mul_f64(0.75), "delay {:?} below jitter floor", delay);
            assert!(delay <= raw_next.mul_f64(1.25), "delay {:?} above jitter ceiling", delay);
            raw_next = (raw_next * 2).min(Duration::from_secs(3600));
        }
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::with_limits(Duration::from_secs(30), Duration::from_secs(3600));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_secs(30).mul_f64(1.25));
    }

    #[tokio::test]
    async fn cancel_interrupts_backoff() {
        let backoff = Arc::new(Mutex::new(Backoff::with_limits(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        )));
        let connector = OnionConnector::new(Arc::new(Resolver::default()), backoff);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(connector.backoff(&cancel).await, Err(Error::Cancelled)));
    }
}
