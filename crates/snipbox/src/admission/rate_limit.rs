//! Per-client sliding-window request throttle

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::admission::AdmissionError;
use crate::types::RateLimitConfig;

/// Derive the identity a request is throttled under
///
/// Uses the first entry of a forwarded-address header when present, else the
/// transport peer address. Only trustworthy behind a reverse proxy that sets
/// the header itself.
pub fn client_identity(forwarded_for: Option<&str>, peer: &str) -> String {
    forwarded_for
        .and_then(|header| header.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .unwrap_or(peer)
        .to_owned()
}

/// Admits at most `max_requests` per client within any sliding window
///
/// Each client's admitted timestamps are kept in their own map shard entry, so
/// unrelated clients never contend on a shared lock.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: config.window(),
            windows: DashMap::new(),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a request from `client` if it is within its allowance
    pub fn admit(&self, client: &str) -> bool {
        self.admit_at(client, Instant::now())
    }

    /// [`admit`](Self::admit) against an explicit clock reading
    pub fn admit_at(&self, client: &str, now: Instant) -> bool {
        let mut stamps = self
            .windows
            .entry(client.to_owned())
            .or_insert_with(|| VecDeque::with_capacity(self.max_requests));

        while stamps
            .front()
            .is_some_and(|&oldest| now.saturating_duration_since(oldest) >= self.window)
        {
            stamps.pop_front();
        }

        if stamps.len() < self.max_requests {
            stamps.push_back(now);
            true
        } else {
            debug!(client, in_window = stamps.len(), "rate limit reached");
            false
        }
    }

    /// [`admit`](Self::admit), as an error carrying the client-facing message
    pub fn check(&self, client: &str) -> Result<(), AdmissionError> {
        if self.admit(client) {
            Ok(())
        } else {
            Err(AdmissionError::RateLimited {
                limit: self.max_requests,
                window: self.window,
            })
        }
    }

    /// Forget clients with no request inside the window; returns how many
    pub fn purge_idle(&self) -> usize {
        self.purge_idle_at(Instant::now())
    }

    pub fn purge_idle_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, stamps| {
            stamps
                .back()
                .is_some_and(|&newest| now.saturating_duration_since(newest) < self.window)
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of client identities currently tracked
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}
