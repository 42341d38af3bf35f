//! Contact/alias resolver.
//!
//! Display names come from the persistent `contacts` table when fresh
//! (younger than the configured TTL). Misses and stale entries trigger one
//! upstream lookup; concurrent callers for the same handle coalesce onto a
//! single in-flight fetch and share its result. On upstream failure the
//! stale value is returned if present, else the raw handle.

use crate::error::BridgeError;
use crate::storage::MessageStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

/// Upstream directory of display names (the WhatsApp API in production,
/// fakes in tests).
#[async_trait]
pub trait ContactSource: Send + Sync {
    /// Fetch the display name for a handle. `Ok(None)` means the upstream
    /// knows the handle but has no name for it.
    async fn fetch(&self, handle: &str) -> Result<Option<String>, BridgeError>;
}

type Flight = Arc<OnceCell<Option<String>>>;

pub struct ContactResolver {
    store: Arc<Mutex<MessageStore>>,
    source: Arc<dyn ContactSource>,
    ttl: chrono::Duration,
    inflight: Mutex<HashMap<String, Flight>>,
}

impl ContactResolver {
    pub fn new(
        store: Arc<Mutex<MessageStore>>,
        source: Arc<dyn ContactSource>,
        ttl: chrono::Duration,
    ) -> Self {
        ContactResolver {
            store,
            source,
            ttl,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a handle to a display name. Never fails: degraded paths
    /// fall back to the stale cached value, then to the handle itself.
    pub async fn resolve(&self, handle: &str) -> String {
        let now = Utc::now();
        let cached = {
            let store = self.store.lock().await;
            match store.contact_get(handle) {
                Ok(row) => row,
                Err(e) => {
                    warn!(handle, error = %e, "contact cache read failed");
                    None
                }
            }
        };
        if let Some(row) = &cached {
            if now - row.fetched_at < self.ttl {
                return row.display_name.clone();
            }
        }

        let fetched = self.fetch_single_flight(handle).await;
        fetched
            .or_else(|| cached.map(|row| row.display_name))
            .unwrap_or_else(|| handle.to_owned())
    }

    /// Re-fetch every cache entry older than the TTL. Best-effort; used by
    /// the periodic refresh task.
    pub async fn refresh_stale(&self, now: DateTime<Utc>) -> u64 {
        let stale = {
            let store = self.store.lock().await;
            match store.contacts_older_than(now - self.ttl) {
                Ok(handles) => handles,
                Err(e) => {
                    warn!(error = %e, "contact staleness query failed");
                    return 0;
                }
            }
        };
        let mut refreshed = 0;
        for handle in stale {
            if self.fetch_single_flight(&handle).await.is_some() {
                refreshed += 1;
            }
        }
        refreshed
    }

    /// One upstream call per handle at a time; duplicate callers attach to
    /// the existing flight and share its outcome.
    async fn fetch_single_flight(&self, handle: &str) -> Option<String> {
        let cell = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(handle.to_owned())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_init(|| async {
                match self.source.fetch(handle).await {
                    Ok(Some(name)) => {
                        let mut store = self.store.lock().await;
                        if let Err(e) = store.contact_put(handle, &name, Utc::now()) {
                            warn!(handle, error = %e, "contact cache write failed");
                        }
                        Some(name)
                    }
                    Ok(None) => {
                        debug!(handle, "upstream has no display name");
                        None
                    }
                    Err(e) => {
                        warn!(handle, error = %e, "contact lookup failed");
                        None
                    }
                }
            })
            .await
            .clone();

        // Retire this flight so a later resolve can refetch. Only remove
        // the cell we actually joined; a newer flight may already be there.
        let mut inflight = self.inflight.lock().await;
        if let Some(current) = inflight.get(handle) {
            if Arc::ptr_eq(current, &cell) {
                inflight.remove(handle);
            }
        }
        result
    }
}
