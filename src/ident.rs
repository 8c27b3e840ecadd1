//! URL canonicalization and content identity resolution.
//!
//! Many URL encodings describe the same logical sigil: the hash-addressed
//! `/s/<hash>` post route, the `/stream/p/<token>` share route, the SMS-safe
//! `/p~<token>` short route (never browser-viewable), and the `/stream#p=`
//! hash viewer. The [`UrlResolver`] collapses all of them onto one canonical
//! string key, one [`ContentId`], and one coarser [`MomentKey`], and elects a
//! primary display URL by scoring the known variants.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::health::HealthScores;
use crate::payload::{self, SigilPayload};

/// Default view base used when the engine has no origin of its own.
pub const VIEW_BASE_FALLBACK: &str = "https://phi.network";

/// Fine-grained URL shape, feeding the view score ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    /// `/s/<hash>` post route.
    PostS,
    /// `t=` token viewer (query or fragment) or `/stream/t` route.
    StreamT,
    /// `/stream/p/<token>` or `/p~<token>`.
    StreamP,
    /// `/stream` with a `p=` token in query or fragment.
    StreamQ,
    /// Bare `/stream` route.
    Stream,
    Other,
}

/// Coarse content kind used for grouping and primary-URL preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Post,
    Stream,
    Other,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Post => "post",
            ContentKind::Stream => "stream",
            ContentKind::Other => "other",
        }
    }
}

/// The logical identity uniting every URL encoding of one record.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
pub struct ContentId(pub String);

/// Coarser key uniting a record with its alternate-kind companion (a post
/// and the live stream of the same moment).
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
pub struct MomentKey(pub String);

impl MomentKey {
    /// Specificity rank: phi-key moment > signature > token > hash > url.
    pub(crate) fn rank(&self) -> u8 {
        if self.0.starts_with("k:") {
            4
        } else if self.0.starts_with("sig:") {
            3
        } else if self.0.starts_with("tok:") {
            2
        } else if self.0.starts_with("h:") {
            1
        } else {
            0
        }
    }
}

/// Score assigned to internal routes that must never be elected primary.
pub const SCORE_NEVER: i64 = -1_000_000_000;

/// Minimal defensive percent-decoder for values that may arrive
/// double-encoded. Malformed escapes pass through untouched.
pub(crate) fn percent_decode_lossy(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = [bytes[i + 1], bytes[i + 2]];
            if let Some(b) = std::str::from_utf8(&hex)
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
            {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// True if the string looks like a bare share token rather than a URL.
pub fn looks_like_bare_token(s: &str) -> bool {
    let t = s.trim();
    t.len() >= 16
        && t.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Resolves URL variants to canonical keys and display choices.
///
/// Holds the view base every canonical URL is rooted on, the two remote
/// bases (scoring bonus), and the shared health score map.
#[derive(Debug, Clone)]
pub struct UrlResolver {
    view_base: Url,
    primary_base: Url,
    backup_base: Url,
    health: Arc<HealthScores>,
}

impl UrlResolver {
    pub fn new(view_base: Url, primary_base: Url, backup_base: Url, health: Arc<HealthScores>) -> Self {
        Self {
            view_base,
            primary_base,
            backup_base,
            health,
        }
    }

    pub fn view_base(&self) -> &Url {
        &self.view_base
    }

    fn parse(&self, raw: &str) -> Option<Url> {
        self.view_base.join(raw.trim()).ok()
    }

    /// Canonical URL: absolute, rooted on the view base, keeping only
    /// path + query + fragment. Total and idempotent; returns the input
    /// unchanged when it cannot be parsed.
    pub fn canonicalize(&self, raw: &str) -> String {
        match self.parse(raw) {
            Some(u) => {
                let mut rooted = self.view_base.clone();
                rooted.set_path(u.path());
                rooted.set_query(u.query());
                rooted.set_fragment(u.fragment());
                rooted.to_string()
            }
            None => raw.to_string(),
        }
    }

    /// Hash from a `/s/<hash>` route, if present.
    pub fn parse_hash(&self, url: &str) -> Option<String> {
        let u = self.parse(url)?;
        let mut segments = u.path_segments()?;
        while let Some(seg) = segments.next() {
            if seg == "s" {
                let hash = segments.next()?;
                if hash.is_empty() {
                    return None;
                }
                return Some(percent_decode_lossy(hash));
            }
        }
        None
    }

    /// True for the `/p~<token>` short route, which no browser can render.
    pub fn is_internal_route(&self, url: &str) -> bool {
        match self.parse(url) {
            Some(u) => u.path().to_ascii_lowercase().starts_with("/p~"),
            None => url.to_ascii_lowercase().contains("/p~"),
        }
    }

    /// Canonical stream URL for a bare token.
    pub fn stream_url_from_token(&self, token: &str) -> String {
        self.canonicalize(&format!("/stream/p/{token}"))
    }

    /// The working hash-viewer form `/stream#p=<token>`.
    pub fn stream_viewer_url_from_token(&self, token: &str) -> String {
        let mut u = self
            .view_base
            .join("/stream")
            .unwrap_or_else(|_| self.view_base.clone());
        u.set_fragment(Some(&format!("p={token}")));
        u.to_string()
    }

    fn fragment_params(u: &Url) -> Vec<(String, String)> {
        match u.fragment() {
            Some(frag) => url::form_urlencoded::parse(frag.as_bytes())
                .into_owned()
                .collect(),
            None => Vec::new(),
        }
    }

    fn query_param(u: &Url, name: &str) -> Option<String> {
        u.query_pairs().find(|(k, _)| k == name).map(|(_, v)| {
            let t = v.trim().to_string();
            t
        })
    }

    /// Stream token from `/stream/p/<token>`, `/p~<token>`, `?p=` or `#p=`.
    pub fn parse_stream_token(&self, url: &str) -> Option<String> {
        let u = self.parse(url)?;
        let path = u.path();

        if let Some(idx) = path.find("/stream/p/") {
            let rest = &path[idx + "/stream/p/".len()..];
            let token = rest.split('/').next().unwrap_or("");
            if !token.is_empty() {
                return Some(percent_decode_lossy(token));
            }
        }

        if let Some(rest) = path.strip_prefix("/p~") {
            let token = rest.split('/').next().unwrap_or("");
            if !token.is_empty() {
                return Some(percent_decode_lossy(token));
            }
        }

        if let Some(p) = Self::query_param(&u, "p") {
            if !p.is_empty() {
                return Some(p);
            }
        }

        Self::fragment_params(&u)
            .into_iter()
            .find(|(k, v)| k == "p" && !v.trim().is_empty())
            .map(|(_, v)| v.trim().to_string())
    }

    /// Convert `/stream/p/<token>` to `/stream#p=<token>`, preserving the
    /// query and any other fragment params.
    fn stream_p_path_to_viewer(&self, raw: &str) -> Option<String> {
        let u = self.parse(raw)?;
        let path = u.path();
        let idx = path.find("/stream/p/")?;
        let token = path[idx + "/stream/p/".len()..]
            .split('/')
            .next()
            .filter(|t| !t.is_empty())?;
        let token = percent_decode_lossy(token);

        let mut out = self.view_base.join("/stream").ok()?;
        out.set_query(u.query());

        let mut params: Vec<(String, String)> = Self::fragment_params(&u)
            .into_iter()
            .filter(|(k, _)| k != "p")
            .collect();
        params.push(("p".into(), token));
        let frag = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        out.set_fragment(Some(&frag));
        Some(out.to_string())
    }

    /// Browser-view normalization: `/p~` and `/stream/p/` collapse to the
    /// hash viewer. View-only; stored registry keys are never rewritten.
    pub fn browser_view_url(&self, url: &str) -> String {
        let abs = self.canonicalize(url);
        if self.is_internal_route(&abs) {
            return match self.parse_stream_token(&abs) {
                Some(tok) => self.canonicalize(&self.stream_viewer_url_from_token(&tok)),
                None => abs,
            };
        }
        match self.stream_p_path_to_viewer(&abs) {
            Some(v) => self.canonicalize(&v),
            None => abs,
        }
    }

    /// The `p=` payload parameter from the query string, if any.
    pub fn payload_param(&self, url: &str) -> Option<String> {
        match self.parse(url) {
            Some(u) => Self::query_param(&u, "p").filter(|p| !p.is_empty()),
            None => {
                let idx = url.find("?p=").or_else(|| url.find("&p="))?;
                let rest = &url[idx + 3..];
                let end = rest.find(['&', '#']).unwrap_or(rest.len());
                Some(percent_decode_lossy(&rest[..end]))
            }
        }
    }

    /// Token from the `#t=` viewer fragment or the `t=` query param.
    fn feed_token(&self, url: &str) -> Option<String> {
        let u = self.parse(url)?;
        if let Some((_, v)) = Self::fragment_params(&u)
            .into_iter()
            .find(|(k, v)| k == "t" && !v.trim().is_empty())
        {
            return Some(v.trim().to_string());
        }
        Self::query_param(&u, "t").filter(|t| !t.is_empty())
    }

    /// Decode the record embedded in a URL, whichever encoding carries it.
    ///
    /// Returns `None` for URLs that carry no decodable record; a malformed
    /// observation is dropped, never propagated.
    pub fn extract_payload(&self, url: &str) -> Option<SigilPayload> {
        if let Some(param) = self.payload_param(url) {
            if let Ok(p) = payload::decode_sigil_payload(&param) {
                return Some(p);
            }
        }
        let token = self
            .feed_token(url)
            .or_else(|| self.parse_stream_token(url))?;
        payload::decode_stream_token(&token).ok()
    }

    /// Classify a URL's fine-grained shape.
    pub fn classify_kind(&self, url: &str) -> UrlKind {
        let Some(u) = self.parse(url) else {
            let low = url.to_ascii_lowercase();
            if low.contains("/s/") {
                return UrlKind::PostS;
            }
            if low.contains("/p~") || low.contains("/stream/p/") {
                return UrlKind::StreamP;
            }
            if low.contains("/stream") {
                return UrlKind::Stream;
            }
            return UrlKind::Other;
        };
        let path = u.path().to_ascii_lowercase();

        if path.contains("/s/") {
            return UrlKind::PostS;
        }
        if path.starts_with("/p~") {
            return UrlKind::StreamP;
        }
        if !path.contains("/stream") {
            return UrlKind::Other;
        }
        if path.contains("/stream/p/") {
            return UrlKind::StreamP;
        }

        let frag = Self::fragment_params(&u);
        let has = |name: &str| {
            Self::query_param(&u, name)
                .map(|v| !v.is_empty())
                .unwrap_or(false)
                || frag.iter().any(|(k, v)| k == name && !v.trim().is_empty())
        };

        if has("t") || path.contains("/stream/t") {
            return UrlKind::StreamT;
        }
        if has("p") {
            return UrlKind::StreamQ;
        }
        UrlKind::Stream
    }

    pub fn content_kind(&self, url: &str) -> ContentKind {
        match self.classify_kind(url) {
            UrlKind::PostS => ContentKind::Post,
            UrlKind::StreamT | UrlKind::StreamP | UrlKind::StreamQ | UrlKind::Stream => {
                ContentKind::Stream
            }
            UrlKind::Other => ContentKind::Other,
        }
    }

    /// Moment key (kindless): groups a post with its stream counterpart.
    pub fn moment_key_for(&self, url: &str, p: &SigilPayload) -> MomentKey {
        if let (Some(key), Some(pulse)) = (p.phi_key(), p.pulse) {
            return MomentKey(format!("k:{key}|{pulse}"));
        }
        if let Some(sig) = p.kai_signature.as_deref().map(str::trim) {
            if !sig.is_empty() {
                return MomentKey(format!("sig:{sig}"));
            }
        }
        if let Some(tok) = self.parse_stream_token(url) {
            if !tok.trim().is_empty() {
                return MomentKey(format!("tok:{}", tok.trim()));
            }
        }
        if let Some(h) = self.parse_hash(url) {
            return MomentKey(format!("h:{h}"));
        }
        MomentKey(format!("u:{}", self.canonicalize(url)))
    }

    /// Content identity (kind-aware): post hash, then phi-key moment for
    /// streams, then signature, then token, then the URL itself.
    pub fn content_id_for(&self, url: &str, p: &SigilPayload) -> ContentId {
        let kind = self.content_kind(url);

        if kind == ContentKind::Post {
            if let Some(h) = self.parse_hash(url) {
                return ContentId(format!("post:{h}"));
            }
        }
        if kind == ContentKind::Stream {
            if let (Some(key), Some(pulse)) = (p.phi_key(), p.pulse) {
                return ContentId(format!("stream:{key}|{pulse}"));
            }
        }
        if let Some(sig) = p.kai_signature.as_deref().map(str::trim) {
            if !sig.is_empty() {
                return ContentId(format!("{}:sig:{sig}", kind.as_str()));
            }
        }
        if let Some(tok) = self.parse_stream_token(url) {
            if !tok.trim().is_empty() {
                return ContentId(format!("{}:tok:{}", kind.as_str(), tok.trim()));
            }
        }
        ContentId(format!("{}:u:{}", kind.as_str(), self.canonicalize(url)))
    }

    /// Packed hash-viewer URLs embed whole chains; heavily penalized as a
    /// display choice.
    fn is_packed_viewer(low: &str) -> bool {
        if !low.contains("/stream") {
            return false;
        }
        let packed = low.contains("root=") || low.contains("&seg=") || low.contains("&add=");
        let viewer = low.contains("/stream#") || low.contains("#v=");
        packed && viewer
    }

    /// Score a URL variant for display. Internal routes score [`SCORE_NEVER`]
    /// and are never elected primary.
    pub fn score_url_for_view(&self, u: &str, prefer: ContentKind) -> i64 {
        if self.is_internal_route(u) {
            return SCORE_NEVER;
        }

        let low = u.to_ascii_lowercase();
        let kind = self.classify_kind(u);
        let mut s: i64 = 0;

        if Self::is_packed_viewer(&low) {
            s -= 10_000;
        }

        match prefer {
            ContentKind::Post => {
                if kind == UrlKind::PostS {
                    s += 220;
                } else {
                    s -= 25;
                }
            }
            ContentKind::Stream => {
                s += match kind {
                    UrlKind::StreamT => 220,
                    UrlKind::StreamP => 190,
                    UrlKind::StreamQ => 175,
                    UrlKind::Stream => 160,
                    UrlKind::PostS => 80,
                    UrlKind::Other => -25,
                };
            }
            ContentKind::Other => {
                s += match kind {
                    UrlKind::PostS => 120,
                    UrlKind::StreamT => 125,
                    UrlKind::StreamP => 105,
                    UrlKind::StreamQ | UrlKind::Stream => 95,
                    UrlKind::Other => 0,
                };
            }
        }

        let view_origin = self.view_base.origin().ascii_serialization().to_ascii_lowercase();
        if low.starts_with(&view_origin) {
            s += 12;
        }
        for base in [&self.primary_base, &self.backup_base] {
            if low.starts_with(&base.origin().ascii_serialization().to_ascii_lowercase()) {
                s += 10;
            }
        }

        match self.health.get(&self.canonicalize(u)) {
            Some(1) => s += 200,
            Some(-1) => s -= 200,
            _ => {}
        }

        s += (20 - (u.len() as i64) / 40).max(0);
        s
    }

    /// The highest-scoring non-internal URL, or a synthesized viewer URL
    /// when only internal routes exist.
    pub fn pick_primary_url(&self, urls: &[String], prefer: ContentKind) -> String {
        let viewable: Vec<&String> = urls.iter().filter(|u| !self.is_internal_route(u)).collect();

        if viewable.is_empty() {
            if let Some(first) = urls.first() {
                if let Some(tok) = self.parse_stream_token(first) {
                    return self.canonicalize(&self.stream_viewer_url_from_token(&tok));
                }
            }
        }
        let candidates: Vec<&String> = if viewable.is_empty() {
            urls.iter().collect()
        } else {
            viewable
        };

        let mut best: &str = candidates.first().map(|s| s.as_str()).unwrap_or("");
        let mut best_score = SCORE_NEVER;
        for u in &candidates {
            let sc = self.score_url_for_view(u, prefer);
            if sc > best_score || (sc == best_score && u.len() < best.len()) {
                best = u;
                best_score = sc;
            }
        }
        best.to_string()
    }
}

/// Resolver over the default bases, for tests across the crate.
#[cfg(test)]
pub(crate) fn test_resolver() -> UrlResolver {
    UrlResolver::new(
        Url::parse(VIEW_BASE_FALLBACK).unwrap(),
        Url::parse("https://m.phi.network").unwrap(),
        Url::parse("https://memory.kaiklok.com").unwrap(),
        Arc::new(HealthScores::default()),
    )
}
