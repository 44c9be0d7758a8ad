use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::models::TrackedChannel;

/// Keys of the shared query cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Token,
    User,
    TrackedChannels,
    /// Sorted, comma-joined ids of the tracked set.
    ChannelStatus(String),
    ChannelSearch(String),
}

impl QueryKey {
    pub fn channel_status(tracked: &[TrackedChannel]) -> Self {
        let mut ids: Vec<&str> = tracked.iter().map(|c| c.id.as_str()).collect();
        ids.sort_unstable();
        Self::ChannelStatus(ids.join(","))
    }

    pub fn channel_search(term: &str) -> Self {
        Self::ChannelSearch(term.to_string())
    }

    pub fn is_channel_status(&self) -> bool {
        matches!(self, Self::ChannelStatus(_))
    }

    pub fn is_channel_search(&self) -> bool {
        matches!(self, Self::ChannelSearch(_))
    }
}

struct CacheEntry {
    value: Value,
    updated_at: Instant,
}

/// Marks one fetch in flight for a key. Cancelled when superseded.
#[derive(Debug, Clone)]
pub struct FetchGuard {
    key: QueryKey,
    generation: u64,
    token: CancellationToken,
}

impl FetchGuard {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Observable key-value store shared by every component.
///
/// Values are held as JSON so that any serde type can be stored under any
/// key. Setting a key writes the entry first and then notifies subscribers
/// of that key, so the setter's own next read always observes its write.
pub struct QueryCache {
    entries: DashMap<QueryKey, CacheEntry>,
    watchers: DashMap<QueryKey, watch::Sender<Value>>,
    in_flight: DashMap<QueryKey, (u64, CancellationToken)>,
    next_generation: AtomicU64,
    enable_metrics: bool,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::with_metrics(false)
    }

    pub fn with_metrics(enable_metrics: bool) -> Self {
        Self {
            entries: DashMap::new(),
            watchers: DashMap::new(),
            in_flight: DashMap::new(),
            next_generation: AtomicU64::new(1),
            enable_metrics,
        }
    }

    /// Decoded data for `key`. Missing, null and undecodable values are `None`.
    pub fn get_data<T>(&self, key: &QueryKey) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let start = Instant::now();
        let value = self.entries.get(key).map(|entry| entry.value.clone());
        let decoded = value
            .filter(|v| !v.is_null())
            .and_then(|v| match serde_json::from_value(v) {
                Ok(data) => Some(data),
                Err(e) => {
                    tracing::warn!(?key, error = %e, "cache entry did not decode");
                    None
                }
            });
        if self.enable_metrics {
            tracing::debug!(elapsed = ?start.elapsed(), ?key, hit = decoded.is_some(), "cache.get");
        }
        decoded
    }

    /// The raw JSON stored for `key`, `Value::Null` when absent.
    pub fn get_raw(&self, key: &QueryKey) -> Value {
        self.entries
            .get(key)
            .map(|entry| entry.value.clone())
            .unwrap_or(Value::Null)
    }

    pub fn set_data<T>(&self, key: QueryKey, data: &T)
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_value(data) {
            Ok(value) => self.set_raw(key, value),
            Err(e) => tracing::error!(?key, error = %e, "cache.set failed to serialize"),
        }
    }

    pub fn clear_data(&self, key: QueryKey) {
        self.set_raw(key, Value::Null);
    }

    pub fn set_raw(&self, key: QueryKey, value: Value) {
        let start = Instant::now();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                value: value.clone(),
                updated_at: Instant::now(),
            },
        );
        if let Some(watcher) = self.watchers.get(&key) {
            watcher.send_replace(value);
        }
        if self.enable_metrics {
            tracing::debug!(elapsed = ?start.elapsed(), ?key, "cache.set");
        }
    }

    /// Receive every subsequent value written under `key`.
    pub fn subscribe(&self, key: QueryKey) -> watch::Receiver<Value> {
        let current = self.get_raw(&key);
        self.watchers
            .entry(key)
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }

    /// True when there is no data for `key` or it is at least `stale_time` old.
    pub fn is_stale(&self, key: &QueryKey, stale_time: Duration) -> bool {
        match self.entries.get(key) {
            Some(entry) if !entry.value.is_null() => entry.updated_at.elapsed() >= stale_time,
            _ => true,
        }
    }

    /// Register a fetch for `key`, cancelling any fetch already in flight for it.
    pub fn begin_fetch(&self, key: QueryKey) -> FetchGuard {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some((_, previous)) = self
            .in_flight
            .insert(key.clone(), (generation, token.clone()))
        {
            previous.cancel();
        }
        FetchGuard {
            key,
            generation,
            token,
        }
    }

    /// Unregister `guard` unless a newer fetch already replaced it.
    pub fn finish_fetch(&self, guard: &FetchGuard) {
        self.in_flight
            .remove_if(&guard.key, |_, (generation, _)| *generation == guard.generation);
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn cancel_queries(&self, key: &QueryKey) {
        if let Some((_, (_, token))) = self.in_flight.remove(key) {
            token.cancel();
            if self.enable_metrics {
                tracing::debug!(?key, "cache.cancel");
            }
        }
    }

    pub fn cancel_queries_where<F>(&self, predicate: F)
    where
        F: Fn(&QueryKey) -> bool,
    {
        let keys: Vec<QueryKey> = self
            .in_flight
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.cancel_queries(&key);
        }
    }

    /// Drop entries that are older than `max_age`, keeping subscribed keys.
    pub fn cleanup_older_than(&self, max_age: Duration) {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            self.watchers.contains_key(key) || entry.updated_at.elapsed() < max_age
        });
        if self.enable_metrics {
            let after = self.entries.len();
            tracing::debug!(removed = before.saturating_sub(after), remaining = after, "cache.cleanup");
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}
