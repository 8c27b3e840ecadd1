//! Outbound delivery queue ("push").
//!
//! Locally-known records pend here until the remote acknowledges them.
//! The queue is insertion-ordered, keyed by canonical URL, persisted in
//! full after every mutation so a restart resumes cleanly, and flushed in
//! bounded batches behind a debounce. Delivery failures back off
//! exponentially and reset on the first success.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::client::RemoteClient;
use crate::ident::UrlResolver;
use crate::payload::SigilPayload;
use crate::registry::RegistryStore;
use crate::store::{self, Storage, OUTBOUND_QUEUE_KEY};

/// Outbound queue tuning. Defaults mirror the production cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Records per delivery call.
    pub batch_max: usize,
    /// Debounce between an enqueue and the triggered flush.
    pub debounce_ms: u64,
    /// First retry delay after a failed delivery.
    pub retry_base_ms: u64,
    /// Retry delay ceiling.
    pub retry_max_ms: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            batch_max: 200,
            debounce_ms: 180,
            retry_base_ms: 1200,
            retry_max_ms: 12_000,
        }
    }
}

impl OutboundConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    pending: IndexMap<String, Value>,
    retry: Option<Duration>,
}

/// The persisted outbound queue.
#[derive(Debug)]
pub struct OutboundQueue {
    resolver: Arc<UrlResolver>,
    storage: Arc<dyn Storage>,
    cfg: OutboundConfig,
    inner: Mutex<QueueInner>,
    notify: Notify,
    flush_gate: tokio::sync::Mutex<()>,
}

impl OutboundQueue {
    pub fn new(resolver: Arc<UrlResolver>, storage: Arc<dyn Storage>, cfg: OutboundConfig) -> Self {
        let q = Self {
            resolver,
            storage,
            cfg,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            flush_gate: tokio::sync::Mutex::new(()),
        };
        q.load();
        q
    }

    pub fn config(&self) -> &OutboundConfig {
        &self.cfg
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    /// Current retry delay, set only while delivery is failing.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.inner.lock().retry
    }

    /// Wait until something is enqueued. Used by the engine's flush loop.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Enqueue a raw record that already carries (or is assigned) its URL.
    pub fn enqueue_record(&self, url: &str, record: Map<String, Value>) {
        let abs = self.resolver.canonicalize(url);
        let mut record = record;
        record.insert("url".into(), Value::from(abs.clone()));
        {
            let mut inner = self.inner.lock();
            inner.pending.insert(abs, Value::Object(record));
        }
        self.persist();
        self.notify.notify_one();
    }

    /// Enqueue a decoded payload under its canonical URL.
    pub fn enqueue_payload(&self, url: &str, payload: &SigilPayload) {
        let record = match serde_json::to_value(payload) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        self.enqueue_record(url, record);
    }

    /// Re-enqueue every known record so the remote can be rebuilt in full.
    /// Used when a remote reset is detected.
    pub fn seed_from_registry(&self, registry: &RegistryStore) {
        let entries = registry.entries();
        {
            let mut inner = self.inner.lock();
            for (_, entry) in &entries {
                let record = match serde_json::to_value(&entry.payload) {
                    Ok(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                for url in &entry.source_urls {
                    let mut rec = record.clone();
                    rec.insert("url".into(), Value::from(url.clone()));
                    inner.pending.insert(url.clone(), Value::Object(rec));
                }
            }
        }
        self.persist();
        self.notify.notify_one();
    }

    /// Deliver up to one batch. On success the delivered entries leave the
    /// queue and the backoff resets; on failure everything stays queued and
    /// the backoff doubles.
    pub async fn flush(&self, client: &RemoteClient) -> anyhow::Result<usize> {
        let _gate = self.flush_gate.lock().await;

        let (keys, batch): (Vec<String>, Vec<Value>) = {
            let inner = self.inner.lock();
            inner
                .pending
                .iter()
                .take(self.cfg.batch_max)
                .map(|(k, v)| (k.clone(), v.clone()))
                .unzip()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        match client.post_inhale(&batch).await {
            Ok(()) => {
                let remaining = {
                    let mut inner = self.inner.lock();
                    for k in &keys {
                        inner.pending.shift_remove(k);
                    }
                    inner.retry = None;
                    inner.pending.len()
                };
                self.persist();
                debug!(delivered = keys.len(), remaining, "outbound flush ok");
                if remaining > 0 {
                    self.notify.notify_one();
                }
                Ok(keys.len())
            }
            Err(err) => {
                let retry = {
                    let mut inner = self.inner.lock();
                    let next = match inner.retry {
                        Some(d) => (d * 2).min(Duration::from_millis(self.cfg.retry_max_ms)),
                        None => Duration::from_millis(self.cfg.retry_base_ms),
                    };
                    inner.retry = Some(next);
                    next
                };
                warn!(retry_ms = retry.as_millis() as u64, "outbound flush failed: {err}");
                Err(err)
            }
        }
    }

    /// Persist the full pending set as an ordered list of pairs.
    fn persist(&self) {
        let pairs: Vec<Value> = {
            let inner = self.inner.lock();
            inner
                .pending
                .iter()
                .map(|(k, v)| Value::Array(vec![Value::from(k.clone()), v.clone()]))
                .collect()
        };
        store::write_quietly(&*self.storage, OUTBOUND_QUEUE_KEY, &Value::Array(pairs));
    }

    fn load(&self) {
        let raw = store::read_or_null(&*self.storage, OUTBOUND_QUEUE_KEY);
        let Value::Array(items) = raw else {
            return;
        };
        let mut inner = self.inner.lock();
        inner.pending.clear();
        for item in items {
            let Value::Array(pair) = item else { continue };
            if pair.len() != 2 {
                continue;
            }
            let (Some(Value::String(url)), Some(record)) = (pair.first(), pair.get(1)) else {
                continue;
            };
            if !record.is_object() {
                continue;
            }
            inner
                .pending
                .insert(self.resolver.canonicalize(url), record.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::test_resolver;
    use crate::payload::payload_from_value;
    use crate::store::MemStorage;
    use serde_json::json;

    fn queue_with(storage: Arc<dyn Storage>) -> OutboundQueue {
        OutboundQueue::new(
            Arc::new(test_resolver()),
            storage,
            OutboundConfig::default(),
        )
    }

    #[test]
    fn enqueue_persists_and_dedupes_by_canonical_url() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::default());
        let q = queue_with(storage.clone());
        let p = payload_from_value(json!({"pulse": 1})).unwrap();
        q.enqueue_payload("/s/a", &p);
        q.enqueue_payload("https://elsewhere.example/s/a", &p);
        assert_eq!(q.len(), 1);

        let snapshot = storage.get(OUTBOUND_QUEUE_KEY).unwrap().unwrap();
        assert_eq!(snapshot.as_array().unwrap().len(), 1);
    }

    #[test]
    fn reload_resumes_the_pending_set() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::default());
        {
            let q = queue_with(storage.clone());
            let p = payload_from_value(json!({"pulse": 2})).unwrap();
            q.enqueue_payload("/s/x", &p);
            q.enqueue_payload("/s/y", &p);
        }
        let q2 = queue_with(storage);
        assert_eq!(q2.len(), 2);
    }

    #[test]
    fn seed_from_registry_enqueues_every_source_url() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::default());
        let resolver = Arc::new(test_resolver());
        let reg = crate::registry::RegistryStore::new(resolver.clone());
        let p = payload_from_value(json!({"pulse": 3})).unwrap();
        reg.upsert("/s/one", p.clone());
        reg.upsert("/s/two", p);

        let q = OutboundQueue::new(resolver, storage, OutboundConfig::default());
        q.seed_from_registry(&reg);
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn failed_flush_keeps_entries_and_raises_backoff() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::default());
        let q = queue_with(storage.clone());
        let p = payload_from_value(json!({"pulse": 4})).unwrap();
        q.enqueue_payload("/s/a", &p);
        q.enqueue_payload("/s/b", &p);
        q.enqueue_payload("/s/c", &p);

        // A remote nothing listens on: delivery must fail fast.
        let client = crate::client::RemoteClient::new(
            crate::client::RemoteConfig {
                primary: url::Url::parse("http://127.0.0.1:9").unwrap(),
                backup: url::Url::parse("http://127.0.0.1:9").unwrap(),
                ..Default::default()
            },
            storage,
        );

        assert!(q.flush(&client).await.is_err());
        assert_eq!(q.len(), 3);
        let first = q.retry_delay().unwrap();
        assert_eq!(first, Duration::from_millis(1200));

        assert!(q.flush(&client).await.is_err());
        let second = q.retry_delay().unwrap();
        assert_eq!(second, Duration::from_millis(2400));
        assert_eq!(q.len(), 3);
    }
}
