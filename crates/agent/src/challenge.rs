//! In-memory cache of ACME HTTP-01 challenge tokens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::info;

use crate::telemetry;

pub const CHALLENGE_TTL: Duration = Duration::from_secs(10 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
struct ChallengeEntry {
    response: String,
    domain: String,
    expires_at: Instant,
}

/// `token -> (keyAuthorization, domain)` with a 10-minute TTL. Reads take the
/// shared lock; writes and the sweeper take the exclusive one.
#[derive(Default)]
pub struct ChallengeStore {
    entries: RwLock<HashMap<String, ChallengeEntry>>,
}

impl ChallengeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set(&self, token: &str, response: &str, domain: &str) {
        self.set_with_ttl(token, response, domain, CHALLENGE_TTL).await;
    }

    pub async fn set_with_ttl(&self, token: &str, response: &str, domain: &str, ttl: Duration) {
        let mut entries = self.entries.write().await;
        entries.insert(
            token.to_string(),
            ChallengeEntry {
                response: response.to_string(),
                domain: domain.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        telemetry::record_challenge_entries(entries.len());
    }

    /// Returns the key authorization iff the token exists and is not past its
    /// expiry. A stale entry reads as a miss without being mutated; the
    /// sweeper removes it later.
    pub async fn get(&self, token: &str) -> Option<String> {
        let entries = self.entries.read().await;
        let entry = entries.get(token)?;
        if Instant::now() > entry.expires_at {
            return None;
        }
        Some(entry.response.clone())
    }

    pub async fn domain(&self, token: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries.get(token).map(|e| e.domain.clone())
    }

    pub async fn delete(&self, token: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(token);
        telemetry::record_challenge_entries(entries.len());
    }

    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at >= now);
        telemetry::record_challenge_entries(entries.len());
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Periodic sweep of expired entries, every 10 minutes until shutdown.
pub async fn sweep_loop(store: Arc<ChallengeStore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let removed = store.sweep_expired().await;
                if removed > 0 {
                    info!(removed, "swept expired challenges");
                }
            }
        }
    }
}
