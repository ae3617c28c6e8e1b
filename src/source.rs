//! Event sources: the fetch/publish boundary between state and relays.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::EventCache;
use crate::error::{ClientError, Result};
use crate::event::Event;
use crate::filter::Filter;
use crate::relay::{self, RelayOptions};

/// Relays used when none are configured.
pub const DEFAULT_RELAYS: [&str; 3] = [
    "wss://relay.arcade.city",
    "wss://arc1.arcadelabs.co",
    "wss://relay.damus.io",
];

/// Best-effort access to the event stream.
///
/// `fetch` never fails: unreachable relays contribute nothing, and the result
/// holds at most one event per id, in no particular order.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Events matching any of `filters`. With `local_only`, no network I/O.
    async fn fetch(&self, filters: &[Filter], local_only: bool) -> Vec<Event>;

    /// Like `fetch`, but fails with [`ClientError::Transport`] when no relay
    /// answered. An empty `Ok` means the relays hold nothing matching.
    ///
    /// Read-modify-write updates of replaceable lists read through this so an
    /// outage is never mistaken for an empty list.
    async fn fetch_confirmed(&self, filters: &[Filter]) -> Result<Vec<Event>>;

    /// Publish a signed event.
    async fn publish(&self, event: &Event) -> Result<()>;

    /// Replace the relay set.
    async fn set_relays(&self, urls: Vec<String>);

    /// Release the source. Later fetches are empty and publishes fail.
    async fn close(&self);
}

/// Keep the first copy of each id.
pub fn dedup_by_id(events: impl IntoIterator<Item = Event>) -> Vec<Event> {
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter(|ev| seen.insert(ev.id.clone()))
        .collect()
}

/// Fan-out/fan-in over a set of relays with an optional local cache.
pub struct RelayPool {
    relays: RwLock<Vec<String>>,
    opts: RelayOptions,
    cache: Option<EventCache>,
    /// Public key of the identity this pool publishes for, for log context only.
    owner: Option<String>,
    closed: AtomicBool,
}

impl RelayPool {
    pub fn new(relays: Vec<String>, opts: RelayOptions) -> Self {
        Self {
            relays: RwLock::new(relays),
            opts,
            cache: None,
            owner: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Attach a local cache consulted on every fetch.
    pub fn with_cache(mut self, cache: EventCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Throwaway pool publishing on behalf of `pubkey`. Holds no key material.
    pub fn scoped(relays: &[&str], pubkey: &str, opts: RelayOptions) -> Self {
        let mut pool = Self::new(relays.iter().map(|r| r.to_string()).collect(), opts);
        pool.owner = Some(pubkey.to_string());
        pool
    }

    pub async fn relays(&self) -> Vec<String> {
        self.relays.read().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn cached(&self, filters: &[Filter]) -> Vec<Event> {
        let Some(cache) = self.cache.clone() else {
            return vec![];
        };
        let filters = filters.to_vec();
        let lookup = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for filter in &filters {
                match cache.query(filter) {
                    Ok(events) => out.extend(events),
                    Err(e) => warn!("cache query failed: {e}"),
                }
            }
            out
        });
        match lookup.await {
            Ok(events) => events,
            Err(e) => {
                warn!("cache query aborted: {e}");
                vec![]
            }
        }
    }

    async fn remember(&self, events: &[Event]) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let events = events.to_vec();
        let write = tokio::task::spawn_blocking(move || {
            for ev in &events {
                if let Err(e) = cache.ingest(ev) {
                    warn!(id = %ev.id, "cache write failed: {e}");
                }
            }
        });
        if let Err(e) = write.await {
            warn!("cache write aborted: {e}");
        }
    }

    /// Query every relay; returns the fresh events and how many relays answered.
    async fn gather(&self, filters: &[Filter]) -> (Vec<Event>, usize) {
        let relays = self.relays().await;
        let results = join_all(
            relays
                .iter()
                .map(|url| relay::fetch(url, filters, &self.opts)),
        )
        .await;
        let mut fresh = Vec::new();
        let mut answered = 0;
        for (url, result) in relays.iter().zip(results) {
            match result {
                Ok(events) => {
                    debug!(relay = %url, count = events.len(), "fetched");
                    answered += 1;
                    fresh.extend(events);
                }
                Err(e) => warn!(relay = %url, "fetch failed: {e}"),
            }
        }
        let fresh = dedup_by_id(fresh);
        self.remember(&fresh).await;
        (fresh, answered)
    }
}

#[async_trait]
impl EventSource for RelayPool {
    async fn fetch(&self, filters: &[Filter], local_only: bool) -> Vec<Event> {
        if self.is_closed() {
            return vec![];
        }
        let mut found = self.cached(filters).await;
        if local_only {
            return dedup_by_id(found);
        }
        let (fresh, _) = self.gather(filters).await;
        found.extend(fresh);
        dedup_by_id(found)
    }

    async fn fetch_confirmed(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        if self.is_closed() {
            return Err(ClientError::Transport("event source closed".into()));
        }
        let mut found = self.cached(filters).await;
        let (fresh, answered) = self.gather(filters).await;
        if answered == 0 {
            return Err(ClientError::Transport("no relay answered".into()));
        }
        found.extend(fresh);
        Ok(dedup_by_id(found))
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Publish("event source closed".into()));
        }
        let relays = self.relays().await;
        let results = join_all(
            relays
                .iter()
                .map(|url| relay::publish(url, event, &self.opts)),
        )
        .await;
        let mut accepted = 0;
        let mut last_err = None;
        for (url, result) in relays.iter().zip(results) {
            match result {
                Ok(()) => accepted += 1,
                Err(e) => {
                    warn!(relay = %url, id = %event.id, "publish failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        if accepted == 0 {
            return Err(ClientError::Publish(match last_err {
                Some(e) => e.to_string(),
                None => "no relays configured".into(),
            }));
        }
        info!(
            id = %event.id,
            kind = event.kind,
            accepted,
            owner = self.owner.as_deref().unwrap_or("-"),
            "published"
        );
        self.remember(std::slice::from_ref(event)).await;
        Ok(())
    }

    async fn set_relays(&self, urls: Vec<String>) {
        *self.relays.write().await = urls;
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        debug!(owner = self.owner.as_deref().unwrap_or("-"), "pool closed");
    }
}

/// In-process event source over a fixed event set.
///
/// Publishing appends to the set, so later fetches observe it.
#[derive(Default)]
pub struct MemorySource {
    events: Mutex<Vec<Event>>,
    relays: Mutex<Vec<String>>,
    published: AtomicUsize,
    closed: AtomicBool,
    fail_publish: AtomicBool,
    fail_fetch: AtomicBool,
}

impl MemorySource {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Self::default()
        }
    }

    /// Make every later publish fail, as if no relay were reachable.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make every later fetch come back empty, as if no relay answered.
    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn insert(&self, event: Event) {
        self.lock_events().push(event);
    }

    /// Number of successful publishes.
    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    /// Every event currently held, including duplicates.
    pub fn events(&self) -> Vec<Event> {
        self.lock_events().clone()
    }

    pub fn relays(&self) -> Vec<String> {
        self.relays.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_events(&self) -> std::sync::MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn fetch(&self, filters: &[Filter], _local_only: bool) -> Vec<Event> {
        self.fetch_confirmed(filters).await.unwrap_or_default()
    }

    async fn fetch_confirmed(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        if self.is_closed() || self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("no relay answered".into()));
        }
        let events = self.lock_events().clone();
        let mut out = Vec::new();
        for filter in filters {
            let mut matched: Vec<Event> = events.iter().filter(|ev| filter.matches(ev)).cloned().collect();
            if let Some(limit) = filter.limit {
                matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                matched.truncate(limit);
            }
            out.extend(matched);
        }
        Ok(dedup_by_id(out))
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        if self.is_closed() || self.fail_publish.load(Ordering::SeqCst) {
            return Err(ClientError::Publish("no relay accepted the event".into()));
        }
        self.lock_events().push(event.clone());
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_relays(&self, urls: Vec<String>) {
        if let Ok(mut relays) = self.relays.lock() {
            *relays = urls;
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{kind, UnsignedEvent};
    use crate::identity::Identity;
    use crate::relay::tests::spawn_relay;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    fn signed(content: &str) -> Event {
        Identity::generate()
            .sign(UnsignedEvent::new(kind::CHANNEL_MESSAGE, content))
            .unwrap()
    }

    #[tokio::test]
    async fn pool_dedups_events_seen_on_several_relays() {
        let shared = signed("on both");
        let only_b = signed("only b");
        let a = spawn_relay(vec![serde_json::to_value(&shared).unwrap()], 1).await;
        let b = spawn_relay(
            vec![
                serde_json::to_value(&shared).unwrap(),
                serde_json::to_value(&only_b).unwrap(),
            ],
            1,
        )
        .await;
        let pool = RelayPool::new(vec![a, b], RelayOptions::default());
        let events = pool.fetch(&[Filter::new().kinds([42])], false).await;
        assert_eq!(events.len(), 2);
        let ids: HashSet<_> = events.iter().map(|e| e.id.clone()).collect();
        assert!(ids.contains(&shared.id) && ids.contains(&only_b.id));
    }

    #[tokio::test]
    async fn unreachable_relays_yield_empty_not_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let pool = RelayPool::new(vec![format!("ws://{addr}")], RelayOptions::default());
        assert!(pool.fetch(&[Filter::new().kinds([1])], false).await.is_empty());
        assert!(matches!(
            pool.fetch_confirmed(&[Filter::new().kinds([1])]).await,
            Err(ClientError::Transport(_))
        ));
        assert!(matches!(
            pool.publish(&signed("x")).await,
            Err(ClientError::Publish(_))
        ));
    }

    #[tokio::test]
    async fn fetched_events_are_served_locally_afterwards() {
        let dir = TempDir::new().unwrap();
        let ev = signed("cache me");
        let url = spawn_relay(vec![serde_json::to_value(&ev).unwrap()], 1).await;
        let pool = RelayPool::new(vec![url], RelayOptions::default())
            .with_cache(EventCache::open(dir.path().to_path_buf()).unwrap());
        let filter = [Filter::new().kinds([kind::CHANNEL_MESSAGE])];
        assert_eq!(pool.fetch(&filter, false).await, vec![ev.clone()]);
        assert_eq!(pool.fetch(&filter, true).await, vec![ev]);
    }

    #[tokio::test]
    async fn closed_pool_is_inert() {
        let pool = RelayPool::scoped(&["ws://127.0.0.1:9"], "pk", RelayOptions::default());
        pool.close().await;
        assert!(pool.is_closed());
        assert!(pool.fetch(&[Filter::new().kinds([1])], false).await.is_empty());
        assert!(pool.publish(&signed("x")).await.is_err());
    }

    #[tokio::test]
    async fn memory_source_dedups_and_filters() {
        let ev = signed("dup");
        let other = Identity::generate()
            .sign(UnsignedEvent::new(kind::METADATA, "{}"))
            .unwrap();
        let src = MemorySource::new(vec![ev.clone(), ev.clone(), other]);
        let got = src.fetch(&[Filter::new().kinds([42])], false).await;
        assert_eq!(got, vec![ev]);
        src.publish(&signed("new")).await.unwrap();
        assert_eq!(src.published(), 1);
    }

    #[tokio::test]
    async fn confirmed_fetch_tells_outage_from_empty() {
        let url = spawn_relay(vec![], 1).await;
        let pool = RelayPool::new(vec![url], RelayOptions::default());
        assert!(pool
            .fetch_confirmed(&[Filter::new().kinds([kind::JOINED_CHANNELS])])
            .await
            .unwrap()
            .is_empty());

        let src = MemorySource::new(vec![signed("held")]);
        src.fail_fetches(true);
        let filter = [Filter::new().kinds([kind::CHANNEL_MESSAGE])];
        assert!(src.fetch(&filter, false).await.is_empty());
        assert!(src.fetch_confirmed(&filter).await.is_err());
        src.fail_fetches(false);
        assert_eq!(src.fetch_confirmed(&filter).await.unwrap().len(), 1);
    }
}
