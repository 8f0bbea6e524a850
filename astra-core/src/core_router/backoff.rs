//! Reconnect backoff
//!
//! Delays start at `initial` and double on every failed attempt, each one
//! capped at `ceiling`. Once the cumulative wait would exceed `ceiling`
//! the peer is declared unreachable; the caller tries again on its next
//! scheduling tick.

use super::transport_manager::TransportManager;
use super::TransportError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy { initial: Duration::from_millis(250), ceiling: Duration::from_secs(30) }
    }
}

pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    waited: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, current: policy.initial, waited: Duration::ZERO }
    }

    /// Delay before the next attempt, or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.current;
        if self.waited + delay > self.policy.ceiling {
            return None;
        }
        self.waited += delay;
        let next = self.current.checked_mul(2).unwrap_or(self.policy.ceiling);
        self.current = std::cmp::min(next, self.policy.ceiling);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial;
        self.waited = Duration::ZERO;
    }

    /// Total time slept so far
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

/// Dial `addr`, retrying with backoff until it answers or the budget runs out
pub async fn connect_with_backoff(
    addr: SocketAddr,
    policy: BackoffPolicy,
) -> Result<TcpStream, TransportError> {
    let mut backoff = Backoff::new(policy);
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match TransportManager::dial(addr).await {
            Ok(stream) => {
                debug!(address = %addr, attempts, "connected");
                return Ok(stream);
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    debug!(address = %addr, error = %e, delay_ms = delay.as_millis() as u64, "connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(address = %addr, attempts, waited_ms = backoff.waited().as_millis() as u64, "peer unreachable");
                    return Err(TransportError::Unreachable { address: addr.to_string(), attempts });
                }
            },
        }
    }
}
