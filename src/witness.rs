//! Witness chain resolution.
//!
//! A sigil URL can carry its own ancestry as repeated `add=` markers in the
//! query and fragment: index 0 is the origin, the last element the immediate
//! parent. Everything here is derived purely from the URL itself, which is
//! what lets lineage survive offline sharing. Synthesis only ever fills
//! gaps; it never overwrites lineage the registry already knows.

use url::Url;

use crate::ident::{looks_like_bare_token, percent_decode_lossy, UrlResolver};
use crate::registry::RegistryStore;

/// Upper bound on chain length, bounding memory on hostile URLs.
pub const WITNESS_ADD_MAX: usize = 512;

/// Lineage derived from a URL's own witness markers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WitnessContext {
    /// Canonical URLs, origin first, immediate parent last.
    pub chain: Vec<String>,
    pub origin_url: Option<String>,
    pub parent_url: Option<String>,
}

fn add_params(u: &Url) -> Vec<String> {
    let mut out: Vec<String> = u
        .query_pairs()
        .filter(|(k, _)| k == "add")
        .map(|(_, v)| v.into_owned())
        .collect();
    if let Some(frag) = u.fragment() {
        out.extend(
            url::form_urlencoded::parse(frag.as_bytes())
                .filter(|(k, _)| k == "add")
                .map(|(_, v)| v.into_owned()),
        );
    }
    out
}

/// Extract the witness chain from a URL, canonicalized and deduplicated.
pub fn extract_chain(resolver: &UrlResolver, url: &str) -> Vec<String> {
    let abs = resolver.canonicalize(url);
    let Ok(u) = Url::parse(&abs) else {
        return Vec::new();
    };

    let mut out: Vec<String> = Vec::new();
    for raw in add_params(&u) {
        let decoded = percent_decode_lossy(raw.trim());
        let decoded = decoded.trim();
        if decoded.is_empty() {
            continue;
        }

        let abs = if looks_like_bare_token(decoded) {
            resolver.canonicalize(&resolver.stream_url_from_token(decoded))
        } else {
            let mut abs = resolver.canonicalize(decoded);
            if resolver.is_internal_route(&abs) {
                if let Some(tok) = resolver.parse_stream_token(&abs) {
                    abs = resolver.canonicalize(&resolver.stream_url_from_token(&tok));
                }
            }
            abs
        };

        if !out.contains(&abs) {
            out.push(abs);
        }
    }

    if out.len() > WITNESS_ADD_MAX {
        out.split_off(out.len() - WITNESS_ADD_MAX)
    } else {
        out
    }
}

/// Chain plus the origin/parent it implies.
pub fn derive_context(resolver: &UrlResolver, url: &str) -> WitnessContext {
    let chain = extract_chain(resolver, url);
    if chain.is_empty() {
        return WitnessContext::default();
    }
    let origin_url = chain.first().cloned();
    let parent_url = chain.last().cloned();
    WitnessContext {
        chain,
        origin_url,
        parent_url,
    }
}

/// Ensure every chain link exists in the registry and wire parent→child
/// edges along it, back-filling the leaf's lineage. Fill-only: known
/// parent/origin values are never replaced.
pub fn synthesize_edges(registry: &RegistryStore, chain: &[String], leaf_url: &str) -> bool {
    if chain.is_empty() {
        return false;
    }
    let resolver = registry.resolver().clone();
    let origin = resolver.canonicalize(&chain[0]);
    let mut changed = false;

    changed |= registry.ensure_url(&origin);
    if let Some(mut p) = registry.payload_by_url(&origin) {
        if p.origin_url.is_none() {
            p.origin_url = Some(origin.clone());
            changed |= registry.upsert(&origin, p);
        }
    }

    for i in 1..chain.len() {
        let child = resolver.canonicalize(&chain[i]);
        let parent = resolver.canonicalize(&chain[i - 1]);

        changed |= registry.ensure_url(&child);
        if let Some(mut p) = registry.payload_by_url(&child) {
            let mut touched = false;
            if p.origin_url.is_none() {
                p.origin_url = Some(origin.clone());
                touched = true;
            }
            if p.parent_url.is_none() {
                p.parent_url = Some(parent.clone());
                touched = true;
            }
            if touched {
                changed |= registry.upsert(&child, p);
            }
        }
    }

    let leaf = resolver.canonicalize(leaf_url);
    if let Some(mut p) = registry.payload_by_url(&leaf) {
        let mut touched = false;
        if p.origin_url.is_none() {
            p.origin_url = Some(origin.clone());
            touched = true;
        }
        if p.parent_url.is_none() {
            p.parent_url = Some(resolver.canonicalize(&chain[chain.len() - 1]));
            touched = true;
        }
        if touched {
            changed |= registry.upsert(&leaf, p);
        }
    }

    changed
}

/// Walk backwards child → parent → … following payloads embedded in the
/// URLs themselves. The first element is the start URL; a seen-set guards
/// against pathological loops.
pub fn resolve_lineage_backwards(resolver: &UrlResolver, start_url: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut current = Some(resolver.canonicalize(start_url));

    while let Some(url) = current.take() {
        if !seen.insert(url.clone()) {
            break;
        }
        chain.push(url.clone());
        let Some(p) = resolver.extract_payload(&url) else {
            break;
        };
        current = p.parent_url.map(|u| resolver.canonicalize(&u));
    }
    chain
}

/// The origin URL for any record URL: the embedded `origin_url` if present,
/// else the far end of the backward walk.
pub fn origin_url_for(resolver: &UrlResolver, start_url: &str) -> Option<String> {
    if let Some(p) = resolver.extract_payload(start_url) {
        if let Some(o) = p.origin_url {
            return Some(resolver.canonicalize(&o));
        }
    }
    resolve_lineage_backwards(resolver, start_url).pop()
}
