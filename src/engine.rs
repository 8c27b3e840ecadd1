//! The engine: owned lifecycle wiring every component together.
//!
//! One [`SigilEngine`] per process instance. It is constructed explicitly
//! and injected into whatever hosts it (no ambient singleton), owns the
//! registry, outbound queue, remote client, health prober and transfer
//! ledger, and runs the background loops (debounced push, breath-locked
//! pull, idle health refresh, transport listener) on a cancellation token
//! so teardown leaves no orphaned work behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::cadence;
use crate::client::{self, RemoteClient, RemoteConfig, SealCheck};
use crate::forest::{self, SigilNode};
use crate::health::{HealthProber, HealthScores, ProbeConfig};
use crate::ident::{UrlResolver, VIEW_BASE_FALLBACK};
use crate::payload::SigilPayload;
use crate::queue::{OutboundConfig, OutboundQueue};
use crate::registry::{self, RegistryStore};
use crate::store::{self, Storage, REGISTRY_URLS_KEY, REGISTRY_URLS_MIRROR_KEY};
use crate::sync::{PullConfig, SyncOutcome, SyncReason, SyncState};
use crate::transfers::{Movement, TransferLedger, TransferMove, TransferRecord};
use crate::transport::{SyncEvent, Transport};
use crate::witness;

/// Where an observation came from. Local creations enqueue for delivery by
/// default; remote and hydration sources never do (that would echo records
/// straight back to where they came from).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddSource {
    Local,
    Remote,
    Hydrate,
    Import,
}

/// Options for [`SigilEngine::add_url`].
#[derive(Debug, Clone, Copy)]
pub struct AddUrlOptions {
    /// Walk and register the witness chain and backward lineage.
    pub include_ancestry: bool,
    /// Announce the change to sibling instances.
    pub broadcast: bool,
    /// Mirror the URL list to storage on change.
    pub persist: bool,
    pub source: AddSource,
    /// Queue for outbound delivery; defaults by source when `None`.
    pub enqueue: Option<bool>,
}

impl Default for AddUrlOptions {
    fn default() -> Self {
        Self {
            include_ancestry: true,
            broadcast: true,
            persist: true,
            source: AddSource::Local,
            enqueue: None,
        }
    }
}

/// What a JSON import did.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportSummary {
    pub added: usize,
    pub queued: usize,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Origin every canonical URL is rooted on.
    pub view_base: Url,
    pub remote: RemoteConfig,
    pub outbound: OutboundConfig,
    pub pull: PullConfig,
    pub probe: ProbeConfig,
    /// Periodic outbound flush interval.
    pub flush_interval_ms: u64,
    /// Idle health refresh interval.
    pub probe_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            view_base: Url::parse(VIEW_BASE_FALLBACK).expect("static url"),
            remote: RemoteConfig::default(),
            outbound: OutboundConfig::default(),
            pull: PullConfig::default(),
            probe: ProbeConfig::default(),
            flush_interval_ms: 3236,
            probe_interval_ms: 30_000,
        }
    }
}

struct EngineInner {
    cfg: EngineConfig,
    resolver: Arc<UrlResolver>,
    registry: RegistryStore,
    queue: OutboundQueue,
    client: RemoteClient,
    health: Arc<HealthScores>,
    prober: HealthProber,
    ledger: TransferLedger,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    sync_state: SyncState,
    hydrated: AtomicBool,
    online: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for EngineInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigilEngine")
            .field("entries", &self.registry.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// The offline-first registry and sync engine.
#[derive(Debug, Clone)]
pub struct SigilEngine {
    inner: Arc<EngineInner>,
}

impl SigilEngine {
    pub fn new(
        cfg: EngineConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let health = Arc::new(HealthScores::default());
        health.load(&*storage);

        let resolver = Arc::new(UrlResolver::new(
            cfg.view_base.clone(),
            cfg.remote.primary.clone(),
            cfg.remote.backup.clone(),
            health.clone(),
        ));

        let allowed_hosts: Vec<String> = [
            Some(cfg.view_base.clone()),
            Some(cfg.remote.primary.clone()),
            Some(cfg.remote.backup.clone()),
            Url::parse(VIEW_BASE_FALLBACK).ok(),
        ]
        .into_iter()
        .flatten()
        .filter_map(|u| u.host_str().map(str::to_string))
        .collect();

        let registry = RegistryStore::new(resolver.clone());
        let queue = OutboundQueue::new(resolver.clone(), storage.clone(), cfg.outbound.clone());
        let client = RemoteClient::new(cfg.remote.clone(), storage.clone());
        let prober = HealthProber::new(
            resolver.clone(),
            health.clone(),
            storage.clone(),
            cfg.probe.clone(),
            allowed_hosts,
        );
        let ledger = TransferLedger::new(storage.clone(), transport.clone());

        Self {
            inner: Arc::new(EngineInner {
                cfg,
                resolver,
                registry,
                queue,
                client,
                health,
                prober,
                ledger,
                transport,
                storage,
                sync_state: SyncState::default(),
                hydrated: AtomicBool::new(false),
                online: AtomicBool::new(true),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &RegistryStore {
        &self.inner.registry
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.inner.queue
    }

    pub fn client(&self) -> &RemoteClient {
        &self.inner.client
    }

    pub fn resolver(&self) -> &Arc<UrlResolver> {
        &self.inner.resolver
    }

    pub fn ledger(&self) -> &TransferLedger {
        &self.inner.ledger
    }

    pub fn health(&self) -> &Arc<HealthScores> {
        &self.inner.health
    }

    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Recover lineage from hash-valued extension fields: `parentHash` /
    /// `parentCanonical` map to the post route, and a parent implies an
    /// origin when none is known.
    fn merge_payload_lineage(&self, mut p: SigilPayload) -> SigilPayload {
        let resolver = &self.inner.resolver;

        if p.parent_url.is_none() {
            let hash = p
                .extra_str("parentHash")
                .or_else(|| p.extra_str("parentCanonical"))
                .map(str::to_string);
            if let Some(h) = hash {
                p.parent_url = Some(resolver.canonicalize(&format!("/s/{h}")));
            }
        }
        if p.origin_url.is_none() {
            let hash = p
                .extra_str("originHash")
                .or_else(|| p.extra_str("originCanonical"))
                .map(str::to_string);
            if let Some(h) = hash {
                p.origin_url = Some(resolver.canonicalize(&format!("/s/{h}")));
            }
        }
        if p.origin_url.is_none() {
            p.origin_url = p.parent_url.clone();
        }
        p
    }

    /// Ingest one URL observation. Returns whether the registry materially
    /// changed. This is the single entry point every source funnels
    /// through: local creation, remote pull, storage hydration and import.
    pub fn add_url(&self, url: &str, opts: AddUrlOptions) -> bool {
        let inner = &self.inner;
        let abs = inner.resolver.canonicalize(url);

        let Some(extracted) = inner.resolver.extract_payload(&abs) else {
            return false;
        };

        let enqueue = opts
            .enqueue
            .unwrap_or(matches!(opts.source, AddSource::Local));

        let ctx = witness::derive_context(&inner.resolver, &abs);
        let mut leaf = self.merge_payload_lineage(extracted);
        leaf.fill_lineage_from(ctx.parent_url.as_deref(), ctx.origin_url.as_deref());

        let mut changed = inner.registry.upsert(&abs, leaf);

        if opts.include_ancestry && !ctx.chain.is_empty() {
            for link in &ctx.chain {
                changed |= inner.registry.ensure_url(link);
            }
            changed |= witness::synthesize_edges(&inner.registry, &ctx.chain, &abs);
        }

        if opts.include_ancestry {
            for link in witness::resolve_lineage_backwards(&inner.resolver, &abs) {
                changed |= inner.registry.ensure_url(&link);
            }
        }

        if changed {
            if opts.persist {
                inner.registry.persist(&*inner.storage);
            }
            if opts.broadcast {
                inner.transport.publish(SyncEvent::Add { url: abs.clone() });
            }
            if enqueue {
                if let Some(latest) = inner.registry.payload_by_url(&abs) {
                    inner.queue.enqueue_payload(&abs, &latest);
                }
            }
        }

        changed
    }

    /// Hydrate from the persisted URL lists, once. Returns whether anything
    /// new was learned.
    pub fn ensure_hydrated(&self) -> bool {
        let inner = &self.inner;
        if inner.hydrated.swap(true, Ordering::SeqCst) {
            return false;
        }

        let mut changed = false;
        for key in [REGISTRY_URLS_KEY, REGISTRY_URLS_MIRROR_KEY] {
            let Value::Array(urls) = store::read_or_null(&*inner.storage, key) else {
                continue;
            };
            for u in urls {
                let Value::String(u) = u else { continue };
                changed |= self.add_url(
                    &u,
                    AddUrlOptions {
                        include_ancestry: true,
                        broadcast: false,
                        persist: false,
                        source: AddSource::Hydrate,
                        enqueue: Some(false),
                    },
                );
            }
        }

        if changed {
            inner.registry.persist(&*inner.storage);
        }
        changed
    }

    /// Import a user-supplied JSON document. The one operation that
    /// reports a terminal failure to its caller (malformed structure);
    /// individual bad entries inside a well-formed document are skipped.
    pub fn import_json(&self, value: &Value) -> anyhow::Result<ImportSummary> {
        let inner = &self.inner;
        let parsed = registry::parse_imported_json(&inner.resolver, value)?;

        let queued_before = inner.queue.len();
        let mut summary = ImportSummary::default();

        for url in &parsed.urls {
            if self.add_url(
                url,
                AddUrlOptions {
                    source: AddSource::Import,
                    enqueue: Some(true),
                    ..Default::default()
                },
            ) {
                summary.added += 1;
            }
        }
        for record in parsed.raw_records {
            let Some(url) = record.get("url").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            inner.queue.enqueue_record(&url, record);
        }

        summary.queued = inner.queue.len().saturating_sub(queued_before);
        Ok(summary)
    }

    /// Force one outbound delivery attempt.
    pub async fn flush_outbound(&self) -> anyhow::Result<usize> {
        if !self.is_online() {
            return Ok(0);
        }
        self.inner.queue.flush(&self.inner.client).await
    }

    /// One inbound sync cycle: seal check, conditional pull, reseed.
    pub async fn sync_once(&self, reason: SyncReason) -> SyncOutcome {
        let inner = &self.inner;
        let mut outcome = SyncOutcome::default();

        if !self.is_online() {
            return outcome;
        }
        if inner
            .sync_state
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            outcome.in_flight = true;
            return outcome;
        }

        self.sync_cycle(reason, &mut outcome).await;
        inner.sync_state.in_flight.store(false, Ordering::SeqCst);
        debug!(?reason, ?outcome, "sync cycle finished");
        outcome
    }

    async fn sync_cycle(&self, reason: SyncReason, outcome: &mut SyncOutcome) {
        let inner = &self.inner;
        let state = &inner.sync_state;

        let prev_seal = state.remote_seal.lock().clone();
        let Some(check) = inner.client.get_seal().await else {
            return;
        };

        let (next_seal, remote_pulse, remote_total, seal_unchanged) = match check {
            SealCheck::NotModified => (None, None, None, true),
            SealCheck::Seal(s) => {
                let unchanged = prev_seal.as_deref() == Some(s.seal.as_str());
                (Some(s.seal), s.pulse, s.total, unchanged)
            }
        };

        let newer_than_local = |remote: Option<u64>| {
            let local = inner.registry.latest_pulse();
            matches!(remote, Some(rp) if local.map(|lp| rp > lp).unwrap_or(true))
        };

        if seal_unchanged && !newer_than_local(remote_pulse) {
            outcome.skipped_pull = true;
            if let Some(s) = next_seal.clone() {
                *state.remote_seal.lock() = Some(s);
            }
        } else {
            let limit = inner.cfg.pull.page_limit;
            let mut page_seal: Option<String> = None;

            for page in 0..inner.cfg.pull.max_pages {
                let offset = page as u64 * limit;
                let Some(p) = inner.client.fetch_urls_page(offset, limit).await else {
                    break;
                };
                outcome.pulled = true;
                if !p.state_seal.is_empty() {
                    page_seal = Some(p.state_seal.clone());
                }
                if p.urls.is_empty() {
                    break;
                }
                let count = p.urls.len() as u64;

                for u in &p.urls {
                    let abs = inner.resolver.canonicalize(u);
                    if inner.registry.contains_url(&abs) {
                        continue;
                    }
                    // Remote-originated merges never re-broadcast or
                    // re-enqueue; that would close a push/pull feedback
                    // loop.
                    if self.add_url(
                        &abs,
                        AddUrlOptions {
                            include_ancestry: true,
                            broadcast: false,
                            persist: false,
                            source: AddSource::Remote,
                            enqueue: Some(false),
                        },
                    ) {
                        outcome.imported += 1;
                    }
                }

                if count < limit {
                    break;
                }
                if let Some(t) = p.total {
                    if offset + count >= t {
                        break;
                    }
                }
            }

            if outcome.pulled {
                let seal = page_seal.or_else(|| next_seal.clone()).or(prev_seal);
                *state.remote_seal.lock() = seal;
            } else if let Some(s) = next_seal.clone() {
                *state.remote_seal.lock() = Some(s);
            }

            if outcome.imported > 0 {
                inner.registry.persist(&*inner.storage);
            }
        }

        // Full reseed: an explicit open, a remote that still knows newer or
        // more records than us, or a seal we have not fully seeded against
        // (covers remote resets).
        let seal_now = state.remote_seal.lock().clone();
        let has_more_remote =
            matches!(remote_total, Some(t) if t > inner.registry.len() as u64);
        let seal_rolled = match (&seal_now, state.last_seed_seal.lock().as_deref()) {
            (Some(s), last) => last != Some(s.as_str()),
            (None, _) => false,
        };
        let should_seed = matches!(reason, SyncReason::Open)
            || newer_than_local(remote_pulse)
            || has_more_remote
            || seal_rolled;

        if should_seed {
            inner.queue.seed_from_registry(&inner.registry);
            *state.last_seed_seal.lock() = seal_now;
            outcome.reseeded = true;
            if let Err(err) = self.flush_outbound().await {
                warn!("reseed flush failed: {err}");
            }
        }
    }

    /// Build the display forest from the current registry.
    pub fn build_forest(&self) -> Vec<SigilNode> {
        forest::build_forest(&self.inner.registry)
    }

    /// Record a transfer movement in the ledger.
    pub fn record_transfer(&self, movement: Movement) -> Option<TransferRecord> {
        self.inner.ledger.record_movement(movement)
    }

    /// Resolve a display movement: ledger first, then payload inference.
    pub fn transfer_move_for(
        &self,
        hash: Option<&str>,
        payload: Option<&SigilPayload>,
    ) -> Option<TransferMove> {
        self.inner.ledger.resolve_move(hash, payload)
    }

    /// Announce a selection to sibling instances.
    pub fn select(&self, hash: &str) {
        self.inner.transport.publish(SyncEvent::Select {
            hash: hash.to_string(),
        });
    }

    /// Spawn the background loops. Idempotent per engine value: spawning
    /// twice doubles the loops, so hosts call this once after
    /// [`ensure_hydrated`](Self::ensure_hydrated).
    pub fn start(&self) {
        let e = self.clone();
        tokio::spawn(async move { e.outbound_loop().await });
        let e = self.clone();
        tokio::spawn(async move { e.pull_loop().await });
        let e = self.clone();
        tokio::spawn(async move { e.probe_loop().await });
        // Subscribe before spawning so no event published between start()
        // and the loop's first poll is missed.
        let rx = self.inner.transport.subscribe();
        let e = self.clone();
        tokio::spawn(async move { e.transport_loop(rx).await });
    }

    /// Cancel every background loop.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    async fn outbound_loop(&self) {
        let cancel = self.inner.cancel.clone();
        let flush_interval = Duration::from_millis(self.inner.cfg.flush_interval_ms);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.queue.notified() => {
                    tokio::time::sleep(self.inner.cfg.outbound.debounce()).await;
                }
                _ = tokio::time::sleep(flush_interval) => {}
            }
            if cancel.is_cancelled() {
                break;
            }

            if self.flush_outbound().await.is_err() {
                let delay = self
                    .inner
                    .queue
                    .retry_delay()
                    .unwrap_or_else(|| self.inner.cfg.outbound.debounce());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    async fn pull_loop(&self) {
        let cancel = self.inner.cancel.clone();
        loop {
            let wait = cadence::until_next_breath(client::now_ms());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            let _ = self.sync_once(SyncReason::Pulse).await;
        }
    }

    async fn probe_loop(&self) {
        let cancel = self.inner.cancel.clone();
        let interval = Duration::from_millis(self.inner.cfg.probe_interval_ms);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let urls: Vec<String> = self
                .inner
                .registry
                .entries()
                .into_iter()
                .map(|(_, e)| e.primary_url)
                .collect();
            self.inner.prober.refresh(urls).await;
        }
    }

    async fn transport_loop(
        &self,
        mut rx: tokio::sync::broadcast::Receiver<SyncEvent>,
    ) {
        let cancel = self.inner.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Ok(SyncEvent::Add { url }) => {
                        // Applying our own echo is harmless: an identical
                        // re-add is a no-op and never republishes.
                        self.add_url(
                            &url,
                            AddUrlOptions {
                                broadcast: false,
                                ..Default::default()
                            },
                        );
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "transport listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}
