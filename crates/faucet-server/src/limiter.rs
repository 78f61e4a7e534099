//! Per-client admission control.
//!
//! Each admitted claim places a time-bounded reservation keyed by the
//! client's address. A reservation that is never committed (the claim
//! failed downstream) is released on drop, so failed attempts do not
//! consume the client's quota. Committed reservations expire naturally
//! after the configured window.

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, info};

/// Address headers consulted before the transport peer address, in
/// precedence order.
const CLIENT_ADDRESS_HEADERS: [&str; 2] = ["x-real-ip", "cf-connecting-ip"];

/// Rate limiter over a concurrent map of client key to entry expiry.
#[derive(Debug)]
pub struct Limiter {
    entries: DashMap<String, DateTime<Utc>>,
    window: Duration,
}

impl Limiter {
    /// A zero window disables limiting entirely. A window beyond the
    /// representable range saturates: entries never expire on their own.
    pub fn new(window: StdDuration) -> Self {
        Self {
            entries: DashMap::new(),
            window: Duration::from_std(window).unwrap_or(Duration::MAX),
        }
    }

    fn expiry_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Admit a client or reject it with the remaining wait.
    ///
    /// The check for a live entry and the insertion of a new one happen
    /// inside a single map-entry critical section, so two simultaneous
    /// requests from the same client cannot both be admitted.
    pub fn try_admit(self: &Arc<Self>, key: &str) -> Result<Reservation, StdDuration> {
        if self.window <= Duration::zero() {
            return Ok(Reservation {
                limiter: Arc::clone(self),
                key: None,
                committed: false,
            });
        }

        let now = Utc::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let expiry = *occupied.get();
                if expiry > now {
                    let retry_after = (expiry - now).to_std().unwrap_or_default();
                    debug!(client = key, ?retry_after, "claim rejected, client over quota");
                    return Err(retry_after);
                }
                occupied.insert(self.expiry_after(now));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.expiry_after(now));
            }
        }

        Ok(Reservation {
            limiter: Arc::clone(self),
            key: Some(key.to_string()),
            committed: false,
        })
    }

    /// Remove a client's entry before its natural expiry.
    pub fn release(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop entries whose window has already elapsed. Run periodically so
    /// one-shot clients do not accumulate forever.
    pub fn purge_expired(&self) {
        let before = self.entries.len();
        let now = Utc::now();
        self.entries.retain(|_, expiry| *expiry > now);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            info!(purged, remaining = self.entries.len(), "purged expired rate-limit entries");
        }
    }

    /// Number of live or not-yet-purged entries.
    pub fn active_entries(&self) -> usize {
        self.entries.len()
    }
}

/// A provisional hold on a client's quota.
///
/// Commit it once the claim has succeeded; dropping it uncommitted
/// removes the entry so the client may retry immediately.
#[derive(Debug)]
pub struct Reservation {
    limiter: Arc<Limiter>,
    key: Option<String>,
    committed: bool,
}

impl Reservation {
    /// Keep the entry; it will expire naturally after the window.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(key) = self.key.take() {
            self.limiter.release(&key);
        }
    }
}

/// Derive the client key for rate limiting from request metadata.
///
/// Tries the trusted proxy header, then the CDN header, then the
/// transport peer address. Returns `None` when no source yields an
/// address; callers must fail closed rather than fall back to a shared
/// key.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    for header in CLIENT_ADDRESS_HEADERS {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    peer.map(|addr| addr.ip().to_string())
}
