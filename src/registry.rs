//! The authoritative registry of observed records.
//!
//! One entry per [`ContentId`]; every URL variant that decoded to the same
//! identity joins the entry's source set, and the merge policy decides
//! whether an incoming observation replaces the stored payload. The registry
//! is append-only inside this subsystem: entries are created and merged,
//! never deleted.
//!
//! Merge policy: an observation replaces the stored payload only when it is
//! topologically more specific (parent/origin differs after fill-only
//! lineage merge), richer (populated-field count differs), or newer by
//! `(pulse, beat, step_index)`. Known lineage is never erased.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::trace;

use crate::ident::{ContentId, ContentKind, UrlResolver};
use crate::payload::SigilPayload;
use crate::store::{self, Storage, REGISTRY_URLS_KEY, REGISTRY_URLS_MIRROR_KEY};
use crate::witness;

/// One registry entry: the merged payload and every URL that encodes it.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub payload: SigilPayload,
    pub source_urls: BTreeSet<String>,
    pub primary_url: String,
    pub kind: ContentKind,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<ContentId, RegistryEntry>,
    by_url: HashMap<String, ContentId>,
}

/// The in-memory registry map with its monotonic merge policy.
#[derive(Debug)]
pub struct RegistryStore {
    resolver: Arc<UrlResolver>,
    inner: RwLock<Inner>,
}

impl RegistryStore {
    pub fn new(resolver: Arc<UrlResolver>) -> Self {
        Self {
            resolver,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn resolver(&self) -> &Arc<UrlResolver> {
        &self.resolver
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Upsert an observation. Returns whether the registry materially
    /// changed (new entry, new source URL, or payload replacement).
    pub fn upsert(&self, url: &str, incoming: SigilPayload) -> bool {
        let abs = self.resolver.canonicalize(url);
        let id = self.resolver.content_id_for(&abs, &incoming);

        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match inner.entries.get_mut(&id) {
            None => {
                let kind = self.resolver.content_kind(&abs);
                let primary = self.resolver.pick_primary_url(std::slice::from_ref(&abs), kind);
                let mut source_urls = BTreeSet::new();
                source_urls.insert(abs.clone());
                inner.entries.insert(
                    id.clone(),
                    RegistryEntry {
                        payload: incoming,
                        source_urls,
                        primary_url: primary,
                        kind,
                    },
                );
                inner.by_url.insert(abs, id.clone());
                trace!(%id, "registry insert");
                true
            }
            Some(entry) => {
                let mut changed = false;

                if entry.source_urls.insert(abs.clone()) {
                    let urls: Vec<String> = entry.source_urls.iter().cloned().collect();
                    entry.primary_url = self.resolver.pick_primary_url(&urls, entry.kind);
                    changed = true;
                }

                // Fill-only lineage merge: an incoming observation may add
                // parent/origin knowledge but can never take it away.
                let mut candidate = incoming;
                if candidate.parent_url.is_none() {
                    candidate.parent_url = entry.payload.parent_url.clone();
                }
                if candidate.origin_url.is_none() {
                    candidate.origin_url = entry.payload.origin_url.clone();
                }

                let topo_changed = candidate.parent_url != entry.payload.parent_url
                    || candidate.origin_url != entry.payload.origin_url;
                let richness_changed = candidate.field_count() != entry.payload.field_count();
                let kai_changed = candidate.kai_cmp(&entry.payload) != std::cmp::Ordering::Equal;

                if topo_changed || richness_changed || kai_changed {
                    trace!(%id, topo_changed, richness_changed, kai_changed, "registry merge");
                    entry.payload = candidate;
                    changed = true;
                }

                if changed {
                    inner.by_url.insert(abs, id);
                }
                changed
            }
        }
    }

    /// Decode the record a URL carries and upsert it, witness context
    /// filled in. Returns false when the URL carries no record.
    pub fn ensure_url(&self, url: &str) -> bool {
        let abs = self.resolver.canonicalize(url);
        let Some(extracted) = self.resolver.extract_payload(&abs) else {
            return false;
        };
        let ctx = witness::derive_context(&self.resolver, &abs);
        let mut merged = extracted;
        merged.fill_lineage_from(ctx.parent_url.as_deref(), ctx.origin_url.as_deref());
        self.upsert(&abs, merged)
    }

    pub fn get(&self, id: &ContentId) -> Option<RegistryEntry> {
        self.inner.read().entries.get(id).cloned()
    }

    pub fn content_id_by_url(&self, url: &str) -> Option<ContentId> {
        let abs = self.resolver.canonicalize(url);
        self.inner.read().by_url.get(&abs).cloned()
    }

    pub fn payload_by_url(&self, url: &str) -> Option<SigilPayload> {
        let abs = self.resolver.canonicalize(url);
        let inner = self.inner.read();
        let id = inner.by_url.get(&abs)?;
        inner.entries.get(id).map(|e| e.payload.clone())
    }

    pub fn contains_url(&self, url: &str) -> bool {
        let abs = self.resolver.canonicalize(url);
        self.inner.read().by_url.contains_key(&abs)
    }

    /// Snapshot of all entries, ordered by content id for determinism.
    pub fn entries(&self) -> Vec<(ContentId, RegistryEntry)> {
        let inner = self.inner.read();
        let mut out: Vec<_> = inner
            .entries
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Snapshot of the url → content-id index.
    pub(crate) fn url_index(&self) -> HashMap<String, ContentId> {
        self.inner.read().by_url.clone()
    }

    /// Every source URL across all entries, ordered.
    pub fn all_urls(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut urls: BTreeSet<String> = BTreeSet::new();
        for entry in inner.entries.values() {
            urls.extend(entry.source_urls.iter().cloned());
        }
        urls.into_iter().collect()
    }

    /// The newest pulse any stored record carries.
    pub fn latest_pulse(&self) -> Option<u64> {
        self.inner
            .read()
            .entries
            .values()
            .filter_map(|e| e.payload.pulse)
            .max()
    }

    /// Mirror the URL list into both persisted keys. Failures are swallowed;
    /// the in-memory registry stays authoritative for the session.
    pub fn persist(&self, storage: &dyn Storage) {
        let urls = Value::from(self.all_urls());
        store::write_quietly(storage, REGISTRY_URLS_KEY, &urls);
        store::write_quietly(storage, REGISTRY_URLS_MIRROR_KEY, &urls);
    }
}

/// Result of parsing an import document.
#[derive(Debug, Default, Clone)]
pub struct ParsedImport {
    pub urls: Vec<String>,
    /// Records that arrived with an explicit `url` field; forwarded to the
    /// outbound queue verbatim.
    pub raw_records: Vec<Map<String, Value>>,
}

/// Parse a user-supplied import document: a JSON array of URL strings,
/// records carrying a `url` field, or a `{"urls": [...]}` wrapper.
///
/// This is the one terminal, user-facing failure path: malformed structure
/// is reported to the importing caller instead of being swallowed.
pub fn parse_imported_json(resolver: &UrlResolver, value: &Value) -> anyhow::Result<ParsedImport> {
    let mut out = ParsedImport::default();

    let push_url = |out: &mut ParsedImport, raw: &str| {
        let abs = resolver.canonicalize(raw.trim());
        if !out.urls.contains(&abs) {
            out.urls.push(abs);
        }
    };

    match value {
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(s) if !s.trim().is_empty() => push_url(&mut out, s),
                    Value::Object(map) => {
                        if let Some(Value::String(u)) = map.get("url") {
                            if !u.trim().is_empty() {
                                let abs = resolver.canonicalize(u.trim());
                                push_url(&mut out, &abs);
                                let mut rec = map.clone();
                                rec.insert("url".into(), Value::from(abs));
                                out.raw_records.push(rec);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(out)
        }
        Value::Object(map) => {
            if let Some(Value::Array(urls)) = map.get("urls") {
                for u in urls {
                    if let Value::String(s) = u {
                        if !s.trim().is_empty() {
                            push_url(&mut out, s);
                        }
                    }
                }
            }
            if let Some(Value::String(u)) = map.get("url") {
                if !u.trim().is_empty() {
                    let abs = resolver.canonicalize(u.trim());
                    push_url(&mut out, &abs);
                    let mut rec = map.clone();
                    rec.insert("url".into(), Value::from(abs));
                    out.raw_records.push(rec);
                }
            }
            Ok(out)
        }
        _ => anyhow::bail!("import document must be a JSON array or object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::test_resolver;
    use crate::payload::{encode_sigil_payload, payload_from_value};
    use serde_json::json;

    fn store() -> RegistryStore {
        RegistryStore::new(Arc::new(test_resolver()))
    }

    fn payload(pulse: u64) -> SigilPayload {
        payload_from_value(json!({
            "pulse": pulse, "beat": 1, "stepIndex": 2, "chakraDay": "Root"
        }))
        .unwrap()
    }

    #[test]
    fn identical_second_upsert_is_a_noop() {
        let reg = store();
        let p = payload(100);
        assert!(reg.upsert("/s/aaa?p=x", p.clone()));
        assert!(!reg.upsert("/s/aaa?p=x", p));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn two_encodings_of_one_record_dedupe() {
        let reg = store();
        let p = payload(10);
        let enc = encode_sigil_payload(&p);
        assert!(reg.upsert(&format!("/s/hhh?p={enc}"), p.clone()));
        let changed = reg.upsert(&format!("https://mirror.example/s/hhh?p={enc}&view=1"), p);
        assert!(changed, "new source url is a material change");
        assert_eq!(reg.len(), 1);
        let entry = reg.get(&ContentId("post:hhh".into())).unwrap();
        assert_eq!(entry.source_urls.len(), 2);
    }

    #[test]
    fn merge_is_monotonic_and_never_erases_lineage() {
        let reg = store();
        let bare = payload(50);
        assert!(reg.upsert("/s/mono", bare.clone()));

        let mut richer = payload(50);
        richer.parent_url = Some("https://phi.network/s/parent".into());
        assert!(reg.upsert("/s/mono", richer));

        let stored = reg.payload_by_url("/s/mono").unwrap();
        assert_eq!(
            stored.parent_url.as_deref(),
            Some("https://phi.network/s/parent")
        );

        // A later observation missing the parent must not erase it.
        reg.upsert("/s/mono", bare);
        let stored = reg.payload_by_url("/s/mono").unwrap();
        assert_eq!(
            stored.parent_url.as_deref(),
            Some("https://phi.network/s/parent")
        );
    }

    #[test]
    fn newer_kai_time_replaces() {
        let reg = store();
        reg.upsert("/s/time", payload(10));
        assert!(reg.upsert("/s/time", payload(11)));
        assert_eq!(reg.payload_by_url("/s/time").unwrap().pulse, Some(11));
    }

    #[test]
    fn richer_payload_replaces() {
        let reg = store();
        reg.upsert("/s/rich", payload(5));
        let mut richer = payload(5);
        richer.extra.insert("note".into(), json!("extra knowledge"));
        assert!(reg.upsert("/s/rich", richer));
        assert!(reg
            .payload_by_url("/s/rich")
            .unwrap()
            .extra
            .contains_key("note"));
    }

    #[test]
    fn latest_pulse_tracks_the_maximum() {
        let reg = store();
        reg.upsert("/s/a", payload(3));
        reg.upsert("/s/b", payload(9));
        reg.upsert("/s/c", payload(6));
        assert_eq!(reg.latest_pulse(), Some(9));
    }

    #[test]
    fn persist_mirrors_both_keys() {
        let reg = store();
        reg.upsert("/s/px", payload(1));
        let storage = crate::store::MemStorage::default();
        reg.persist(&storage);
        let a = storage.get(REGISTRY_URLS_KEY).unwrap().unwrap();
        let b = storage.get(REGISTRY_URLS_MIRROR_KEY).unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_array().unwrap().len(), 1);
    }

    #[test]
    fn import_parsing_accepts_all_three_shapes() {
        let r = test_resolver();
        let arr = json!(["/s/a?p=1", {"url": "/s/b", "pulse": 4}, 42]);
        let parsed = parse_imported_json(&r, &arr).unwrap();
        assert_eq!(parsed.urls.len(), 2);
        assert_eq!(parsed.raw_records.len(), 1);

        let wrapped = json!({"urls": ["/s/c", "/s/c", "/s/d"]});
        let parsed = parse_imported_json(&r, &wrapped).unwrap();
        assert_eq!(parsed.urls.len(), 2);

        assert!(parse_imported_json(&r, &json!("just a string")).is_err());
    }
}
