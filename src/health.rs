//! Best-effort URL health probing.
//!
//! Probe results feed the identity resolver's view scoring (+200 healthy,
//! −200 unhealthy) so the elected primary URL is one that actually loads.
//! Probing is strictly best-effort: capped per refresh cycle, short
//! timeout, and never aimed at hosts the engine does not recognise.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;
use url::Url;

use crate::ident::UrlResolver;
use crate::store::{self, Storage, URL_HEALTH_KEY};

/// Probe tuning.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProbeConfig {
    pub timeout_ms: u64,
    /// Probes per refresh cycle; keeps idle work bounded.
    pub max_per_cycle: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2200,
            max_per_cycle: 18,
        }
    }
}

/// Shared health score map: `1` healthy, `-1` unhealthy, absent unknown.
#[derive(Debug, Default)]
pub struct HealthScores {
    map: RwLock<HashMap<String, i8>>,
}

impl HealthScores {
    pub fn get(&self, canonical_url: &str) -> Option<i8> {
        self.map.read().get(canonical_url).copied()
    }

    /// Record a score; returns whether it changed.
    pub fn set(&self, canonical_url: &str, score: i8) -> bool {
        let mut map = self.map.write();
        if map.get(canonical_url) == Some(&score) {
            return false;
        }
        map.insert(canonical_url.to_string(), score);
        true
    }

    pub fn load(&self, storage: &dyn Storage) {
        let Value::Object(obj) = store::read_or_null(storage, URL_HEALTH_KEY) else {
            return;
        };
        let mut map = self.map.write();
        map.clear();
        for (k, v) in obj {
            match v.as_i64() {
                Some(1) => map.insert(k, 1),
                Some(-1) => map.insert(k, -1),
                _ => None,
            };
        }
    }

    pub fn save(&self, storage: &dyn Storage) {
        let obj: serde_json::Map<String, Value> = self
            .map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect();
        store::write_quietly(storage, URL_HEALTH_KEY, &Value::Object(obj));
    }
}

/// Result of probing one URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok,
    Bad,
    Unknown,
}

/// Issues the actual probes and persists their outcomes.
#[derive(Debug)]
pub struct HealthProber {
    resolver: Arc<UrlResolver>,
    scores: Arc<HealthScores>,
    storage: Arc<dyn Storage>,
    http: reqwest::Client,
    cfg: ProbeConfig,
    allowed_hosts: Vec<String>,
}

impl HealthProber {
    pub fn new(
        resolver: Arc<UrlResolver>,
        scores: Arc<HealthScores>,
        storage: Arc<dyn Storage>,
        cfg: ProbeConfig,
        allowed_hosts: Vec<String>,
    ) -> Self {
        Self {
            resolver,
            scores,
            storage,
            http: reqwest::Client::new(),
            cfg,
            allowed_hosts,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.timeout_ms)
    }

    /// Probe a single URL. Internal routes are never probed directly: the
    /// browser-view form is probed instead, and the SPA-served `/stream`
    /// viewer short-circuits to `Ok` without any network.
    pub async fn probe(&self, url: &str) -> ProbeOutcome {
        let target = self.resolver.browser_view_url(url);
        let Ok(parsed) = Url::parse(&target) else {
            return ProbeOutcome::Unknown;
        };

        let host = parsed.host_str().unwrap_or_default().to_string();
        if !self.allowed_hosts.iter().any(|h| h == &host) {
            return ProbeOutcome::Unknown;
        }
        if parsed.path().eq_ignore_ascii_case("/stream") {
            return ProbeOutcome::Ok;
        }

        let head = self
            .http
            .head(parsed.clone())
            .timeout(self.timeout())
            .send()
            .await;
        let res = match head {
            Ok(res) => Ok(res),
            Err(_) => {
                self.http
                    .get(parsed)
                    .timeout(self.timeout())
                    .send()
                    .await
            }
        };

        match res {
            Ok(res) if res.status().is_success() => ProbeOutcome::Ok,
            Ok(_) => ProbeOutcome::Bad,
            Err(_) => ProbeOutcome::Unknown,
        }
    }

    /// Probe up to the per-cycle cap of the given URLs, recording scores.
    /// Returns how many probes ran.
    pub async fn refresh(&self, urls: impl IntoIterator<Item = String>) -> usize {
        let mut probed = 0;
        let mut dirty = false;

        for url in urls {
            if probed >= self.cfg.max_per_cycle {
                break;
            }
            if self.resolver.is_internal_route(&url) {
                continue;
            }
            let canonical = self.resolver.canonicalize(&url);
            probed += 1;
            match self.probe(&canonical).await {
                ProbeOutcome::Ok => dirty |= self.scores.set(&canonical, 1),
                ProbeOutcome::Bad => dirty |= self.scores.set(&canonical, -1),
                ProbeOutcome::Unknown => {}
            }
            trace!(%canonical, "probed");
        }

        if dirty {
            self.scores.save(&*self.storage);
        }
        probed
    }
}
