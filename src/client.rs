//! Remote HTTP client with primary/backup failover.
//!
//! The engine talks to one logical service reachable at two bases. The last
//! base that succeeded is tried first on the next call (sticky hint,
//! persisted). A response counts as final success on `2xx` or `304`; a
//! status of 0 (transport failure), 404, 408, 429 or 5xx means "try the
//! other base". When the backup itself fails it is suppressed for a
//! cooldown window so a known-dead base is not retried on every call.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::store::{self, Storage, BACKUP_DEAD_UNTIL_KEY, BASE_HINT_KEY};

/// Cheap remote version check.
pub const API_SEAL_PATH: &str = "/sigils/seal";
/// Paginated full listing.
pub const API_URLS_PATH: &str = "/sigils/urls";
/// Batch delivery endpoint.
pub const API_INHALE_PATH: &str = "/sigils/inhale";

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Remote service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub primary: Url,
    pub backup: Url,
    /// The origin this engine itself is served from, when embedded in a
    /// page. An https origin never tries an http base, and when the origin
    /// *is* one of the bases only that base is used.
    pub self_origin: Option<Url>,
    /// How long a failing backup stays suppressed.
    pub backup_cooldown_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            primary: Url::parse("https://m.phi.network").expect("static url"),
            backup: Url::parse("https://memory.kaiklok.com").expect("static url"),
            self_origin: None,
            backup_cooldown_ms: 2 * 60 * 1000,
            request_timeout_ms: 10_000,
        }
    }
}

impl RemoteConfig {
    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Remote seal: an opaque version token, optionally carrying the remote's
/// newest pulse and total record count.
#[derive(Debug, Clone, Deserialize)]
pub struct SealResponse {
    pub seal: String,
    #[serde(default, alias = "latestPulse", alias = "latest_pulse")]
    pub pulse: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// Outcome of a seal check.
#[derive(Debug, Clone)]
pub enum SealCheck {
    /// Conditional fetch said nothing changed.
    NotModified,
    Seal(SealResponse),
}

/// One page of the remote URL listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UrlsPage {
    #[serde(default)]
    pub state_seal: String,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Default)]
struct ClientState {
    prefer_backup: bool,
    backup_dead_until_ms: u64,
}

/// Dual-base remote client.
#[derive(Debug)]
pub struct RemoteClient {
    http: reqwest::Client,
    cfg: RemoteConfig,
    storage: Arc<dyn Storage>,
    state: Mutex<ClientState>,
}

impl RemoteClient {
    pub fn new(cfg: RemoteConfig, storage: Arc<dyn Storage>) -> Self {
        let client = Self {
            http: reqwest::Client::new(),
            cfg,
            storage,
            state: Mutex::new(ClientState::default()),
        };
        client.load_hints();
        client
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.cfg
    }

    fn load_hints(&self) {
        let mut st = self.state.lock();
        if let Value::Number(n) = store::read_or_null(&*self.storage, BACKUP_DEAD_UNTIL_KEY) {
            st.backup_dead_until_ms = n.as_u64().unwrap_or(0);
        }
        if let Value::String(hint) = store::read_or_null(&*self.storage, BASE_HINT_KEY) {
            let suppressed = now_ms() < st.backup_dead_until_ms;
            if hint == self.cfg.backup.as_str() && !suppressed {
                st.prefer_backup = true;
            }
        }
    }

    fn is_backup(&self, base: &Url) -> bool {
        base.origin() == self.cfg.backup.origin()
            && self.cfg.backup.origin() != self.cfg.primary.origin()
    }

    fn backup_suppressed(&self) -> bool {
        now_ms() < self.state.lock().backup_dead_until_ms
    }

    fn mark_backup_dead(&self) {
        let mut st = self.state.lock();
        st.backup_dead_until_ms = now_ms() + self.cfg.backup_cooldown_ms;
        store::write_quietly(
            &*self.storage,
            BACKUP_DEAD_UNTIL_KEY,
            &Value::from(st.backup_dead_until_ms),
        );
        // A failing backup must never stay the preferred base.
        if st.prefer_backup {
            st.prefer_backup = false;
            store::write_quietly(
                &*self.storage,
                BASE_HINT_KEY,
                &Value::from(self.cfg.primary.as_str()),
            );
        }
        debug!(
            "backup base suppressed for {}ms",
            self.cfg.backup_cooldown_ms
        );
    }

    fn clear_backup_suppression(&self) {
        let mut st = self.state.lock();
        if st.backup_dead_until_ms != 0 {
            st.backup_dead_until_ms = 0;
            store::write_quietly(&*self.storage, BACKUP_DEAD_UNTIL_KEY, &Value::from(0u64));
        }
    }

    fn note_success(&self, base: &Url) {
        if self.is_backup(base) {
            self.clear_backup_suppression();
        }
        let mut st = self.state.lock();
        let prefer_backup = self.is_backup(base);
        if st.prefer_backup != prefer_backup {
            st.prefer_backup = prefer_backup;
            store::write_quietly(&*self.storage, BASE_HINT_KEY, &Value::from(base.as_str()));
        }
    }

    /// The ordered list of bases to try for the next call.
    fn bases(&self) -> Vec<Url> {
        let suppressed = self.backup_suppressed();
        let prefer_backup = self.state.lock().prefer_backup;

        let mut list = if prefer_backup && !suppressed {
            vec![self.cfg.backup.clone(), self.cfg.primary.clone()]
        } else {
            vec![self.cfg.primary.clone(), self.cfg.backup.clone()]
        };

        if let Some(origin) = &self.cfg.self_origin {
            if origin.scheme() == "https" {
                list.retain(|b| b.scheme() == "https");
            }
            if list.iter().any(|b| b.origin() == origin.origin()) {
                list.retain(|b| b.origin() == origin.origin());
            }
        }

        if suppressed && self.cfg.backup.origin() != self.cfg.primary.origin() {
            let backup_origin = self.cfg.backup.origin();
            list.retain(|b| b.origin() != backup_origin);
        }

        if list.is_empty() {
            list.push(self.cfg.primary.clone());
        }
        list
    }

    fn should_failover(status: StatusCode) -> bool {
        status == StatusCode::NOT_FOUND
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
    }

    /// Try the request against each base in order. Returns the first final
    /// response, or the last response seen when every base failed over.
    pub async fn fetch_with_failover<F>(&self, make: F) -> Option<reqwest::Response>
    where
        F: Fn(&Url) -> reqwest::RequestBuilder,
    {
        let mut last = None;
        for base in self.bases() {
            let req = make(&base).timeout(self.cfg.request_timeout());
            match req.send().await {
                Ok(res) => {
                    let status = res.status();
                    if status.is_success() || status == StatusCode::NOT_MODIFIED {
                        self.note_success(&base);
                        return Some(res);
                    }
                    if self.is_backup(&base) && Self::should_failover(status) {
                        self.mark_backup_dead();
                    }
                    if !Self::should_failover(status) {
                        return Some(res);
                    }
                    last = Some(res);
                }
                Err(err) => {
                    warn!(base = %base, "request failed: {err}");
                    if self.is_backup(&base) {
                        self.mark_backup_dead();
                    }
                }
            }
        }
        last
    }

    /// Check the remote version token. `None` means unreachable.
    pub async fn get_seal(&self) -> Option<SealCheck> {
        let res = self
            .fetch_with_failover(|base| {
                let url = base.join(API_SEAL_PATH).unwrap_or_else(|_| base.clone());
                self.http.get(url)
            })
            .await?;

        if res.status() == StatusCode::NOT_MODIFIED {
            return Some(SealCheck::NotModified);
        }
        if !res.status().is_success() {
            return None;
        }
        res.json::<SealResponse>().await.ok().map(SealCheck::Seal)
    }

    /// Fetch one page of the remote listing.
    pub async fn fetch_urls_page(&self, offset: u64, limit: u64) -> Option<UrlsPage> {
        let res = self
            .fetch_with_failover(|base| {
                let mut url = base.join(API_URLS_PATH).unwrap_or_else(|_| base.clone());
                url.query_pairs_mut()
                    .append_pair("offset", &offset.to_string())
                    .append_pair("limit", &limit.to_string());
                self.http.get(url)
            })
            .await?;

        if !res.status().is_success() {
            return None;
        }
        res.json::<UrlsPage>().await.ok()
    }

    /// Deliver a batch of records as a multipart JSON file.
    pub async fn post_inhale(&self, batch: &[Value]) -> anyhow::Result<()> {
        let body = serde_json::to_string(batch)?;
        let file_name = format!("sigils_{}.json", now_ms());

        let res = self
            .fetch_with_failover(|base| {
                let mut url = base.join(API_INHALE_PATH).unwrap_or_else(|_| base.clone());
                url.query_pairs_mut()
                    .append_pair("include_state", "false")
                    .append_pair("include_urls", "false");
                let part = reqwest::multipart::Part::text(body.clone())
                    .file_name(file_name.clone())
                    .mime_str("application/json")
                    .expect("static mime type");
                let form = reqwest::multipart::Form::new().part("file", part);
                self.http.post(url).multipart(form)
            })
            .await;

        match res {
            Some(res) if res.status().is_success() => Ok(()),
            Some(res) => anyhow::bail!("inhale failed: {}", res.status()),
            None => anyhow::bail!("inhale failed: no base reachable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStorage;
    use axum::Router;
    use axum::routing::get;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(app: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}")).unwrap()
    }

    fn seal_json(seal: &str) -> axum::Json<Value> {
        axum::Json(serde_json::json!({ "seal": seal, "pulse": 10, "total": 1 }))
    }

    #[tokio::test]
    async fn primary_500_fails_over_to_backup_within_one_call() {
        let primary_hits = Arc::new(AtomicUsize::new(0));
        let ph = primary_hits.clone();
        let primary = serve(Router::new().route(
            API_SEAL_PATH,
            get(move || {
                let ph = ph.clone();
                async move {
                    ph.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        ))
        .await;
        let backup =
            serve(Router::new().route(API_SEAL_PATH, get(|| async { seal_json("s1") }))).await;

        let client = RemoteClient::new(
            RemoteConfig {
                primary,
                backup,
                ..Default::default()
            },
            Arc::new(MemStorage::default()),
        );

        let seal = client.get_seal().await.expect("backup answered");
        match seal {
            SealCheck::Seal(s) => assert_eq!(s.seal, "s1"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(primary_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_base_becomes_sticky() {
        let primary_hits = Arc::new(AtomicUsize::new(0));
        let ph = primary_hits.clone();
        let primary = serve(Router::new().route(
            API_SEAL_PATH,
            get(move || {
                let ph = ph.clone();
                async move {
                    ph.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        ))
        .await;
        let backup =
            serve(Router::new().route(API_SEAL_PATH, get(|| async { seal_json("s2") }))).await;

        let client = RemoteClient::new(
            RemoteConfig {
                primary,
                backup,
                ..Default::default()
            },
            Arc::new(MemStorage::default()),
        );

        client.get_seal().await.expect("first call");
        client.get_seal().await.expect("second call");
        // The second call goes straight to the sticky backup.
        assert_eq!(primary_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_failover_status_is_returned_as_final() {
        let backup_hits = Arc::new(AtomicUsize::new(0));
        let bh = backup_hits.clone();
        let primary = serve(Router::new().route(
            API_SEAL_PATH,
            get(|| async { axum::http::StatusCode::FORBIDDEN }),
        ))
        .await;
        let backup = serve(Router::new().route(
            API_SEAL_PATH,
            get(move || {
                let bh = bh.clone();
                async move {
                    bh.fetch_add(1, Ordering::SeqCst);
                    seal_json("s3")
                }
            }),
        ))
        .await;

        let client = RemoteClient::new(
            RemoteConfig {
                primary,
                backup,
                ..Default::default()
            },
            Arc::new(MemStorage::default()),
        );

        let res = client
            .fetch_with_failover(|base| {
                reqwest::Client::new().get(base.join(API_SEAL_PATH).unwrap())
            })
            .await
            .expect("got a response");
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(backup_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dead_backup_is_suppressed_for_the_cooldown() {
        let backup_hits = Arc::new(AtomicUsize::new(0));
        let bh = backup_hits.clone();
        let primary = serve(Router::new().route(
            API_SEAL_PATH,
            get(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }),
        ))
        .await;
        let backup = serve(Router::new().route(
            API_SEAL_PATH,
            get(move || {
                let bh = bh.clone();
                async move {
                    bh.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        ))
        .await;

        let client = RemoteClient::new(
            RemoteConfig {
                primary,
                backup,
                ..Default::default()
            },
            Arc::new(MemStorage::default()),
        );

        assert!(client.get_seal().await.is_none());
        assert_eq!(backup_hits.load(Ordering::SeqCst), 1);

        // While suppressed the backup is not retried at all.
        assert!(client.get_seal().await.is_none());
        assert_eq!(backup_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn https_origin_never_tries_http_bases() {
        let client = RemoteClient::new(
            RemoteConfig {
                primary: Url::parse("http://insecure.example").unwrap(),
                backup: Url::parse("https://memory.kaiklok.com").unwrap(),
                self_origin: Some(Url::parse("https://phi.network").unwrap()),
                ..Default::default()
            },
            Arc::new(MemStorage::default()),
        );
        let bases = client.bases();
        assert!(bases.iter().all(|b| b.scheme() == "https"), "{bases:?}");
    }

    #[tokio::test]
    async fn self_origin_pins_to_the_matching_base() {
        let client = RemoteClient::new(
            RemoteConfig {
                primary: Url::parse("https://m.phi.network").unwrap(),
                backup: Url::parse("https://memory.kaiklok.com").unwrap(),
                self_origin: Some(Url::parse("https://memory.kaiklok.com").unwrap()),
                ..Default::default()
            },
            Arc::new(MemStorage::default()),
        );
        let bases = client.bases();
        assert_eq!(bases.len(), 1);
        assert_eq!(
            bases[0].origin().ascii_serialization(),
            "https://memory.kaiklok.com"
        );
    }
}
