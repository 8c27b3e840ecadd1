//! Forest builder: the flat registry as rooted display trees.
//!
//! Entries are first grouped by moment key so a post and its stream
//! counterpart collapse onto one representative node, then grouped by
//! origin to find roots, then attached child-to-parent. The tree walk is
//! iterative with an explicit visited set: a node revisited inside its own
//! subtree is emitted as a leaf instead of recursed into, so cyclic lineage
//! can never hang the builder.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::Serialize;

use crate::ident::{ContentId, ContentKind, MomentKey, UrlResolver};
use crate::payload::SigilPayload;
use crate::registry::RegistryStore;
use crate::transfers;
use crate::witness;

/// One node of the presentation tree.
#[derive(Debug, Clone, Serialize)]
pub struct SigilNode {
    pub id: ContentId,
    /// Primary URL used to open this content.
    pub url: String,
    /// Every URL variant known for this content id.
    pub urls: Vec<String>,
    pub payload: SigilPayload,
    pub children: Vec<SigilNode>,
}

#[derive(Debug, Clone)]
struct EntryCtx {
    id: ContentId,
    payload: SigilPayload,
    urls: Vec<String>,
    primary_url: String,
    kind: ContentKind,
    moment_key: MomentKey,
    parent_id: Option<ContentId>,
    origin_id: ContentId,
}

fn is_root_candidate(resolver: &UrlResolver, e: &EntryCtx) -> bool {
    e.kind == ContentKind::Post
        && resolver.parse_hash(&e.primary_url).is_some()
        && transfers::move_from_payload(&e.payload).is_none()
        && !transfers::has_transfer_hints(&e.payload)
}

fn build_index(store: &RegistryStore) -> IndexMap<ContentId, EntryCtx> {
    let resolver = store.resolver().clone();
    let snapshot = store.entries();
    let url_to_id = store.url_index();

    // Pre-entries with their best moment key across all URL variants.
    let mut pre: IndexMap<ContentId, EntryCtx> = IndexMap::new();
    for (id, entry) in &snapshot {
        let urls: Vec<String> = entry.source_urls.iter().cloned().collect();
        let moment_key = urls
            .iter()
            .map(|u| resolver.moment_key_for(u, &entry.payload))
            .max_by_key(|k| k.rank())
            .unwrap_or_else(|| resolver.moment_key_for(&entry.primary_url, &entry.payload));

        pre.insert(
            id.clone(),
            EntryCtx {
                id: id.clone(),
                payload: entry.payload.clone(),
                urls,
                primary_url: entry.primary_url.clone(),
                kind: entry.kind,
                moment_key,
                parent_id: None,
                origin_id: id.clone(),
            },
        );
    }

    let mut entry_by_hash: HashMap<String, ContentId> = HashMap::new();
    for e in pre.values() {
        if let Some(hash) = resolver.parse_hash(&e.primary_url) {
            entry_by_hash.entry(hash).or_insert_with(|| e.id.clone());
        }
    }

    // Moment grouping: every id maps to its moment's representative parent.
    let mut moment_groups: IndexMap<MomentKey, Vec<ContentId>> = IndexMap::new();
    for e in pre.values() {
        moment_groups
            .entry(e.moment_key.clone())
            .or_default()
            .push(e.id.clone());
    }

    let mut moment_parent_by_id: HashMap<ContentId, ContentId> = HashMap::new();
    let mut moment_parent_by_url: HashMap<String, ContentId> = HashMap::new();
    for ids in moment_groups.values() {
        let candidates: Vec<&EntryCtx> = ids.iter().filter_map(|id| pre.get(id)).collect();
        let posts: Vec<&&EntryCtx> = candidates
            .iter()
            .filter(|c| c.kind == ContentKind::Post)
            .collect();

        let elect = |pool: &[&EntryCtx], prefer_post: bool| -> Option<ContentId> {
            let mut best: Option<(&EntryCtx, i64)> = None;
            for c in pool {
                let prefer = if prefer_post { ContentKind::Post } else { c.kind };
                let score = resolver.score_url_for_view(&c.primary_url, prefer);
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((c, score));
                }
            }
            best.map(|(c, _)| c.id.clone())
        };

        let parent_id = if posts.is_empty() {
            elect(&candidates, false)
        } else {
            let posts: Vec<&EntryCtx> = posts.into_iter().copied().collect();
            elect(&posts, true)
        }
        .unwrap_or_else(|| ids[0].clone());

        for id in ids {
            moment_parent_by_id.insert(id.clone(), parent_id.clone());
            if let Some(e) = pre.get(id) {
                for u in &e.urls {
                    moment_parent_by_url.insert(u.clone(), parent_id.clone());
                }
            }
        }
    }

    let mut root_by_hash: HashMap<String, ContentId> = HashMap::new();
    for e in pre.values() {
        if !is_root_candidate(&resolver, e) {
            continue;
        }
        if let Some(hash) = resolver.parse_hash(&e.primary_url) {
            root_by_hash.entry(hash).or_insert_with(|| e.id.clone());
        }
    }

    // Origin resolution happens once per moment parent.
    let mut moment_origin_by_parent: HashMap<ContentId, ContentId> = HashMap::new();
    for e in pre.values() {
        let mp = moment_parent_by_id.get(&e.id).unwrap_or(&e.id);
        if &e.id != mp {
            continue;
        }

        let origin_url = e
            .payload
            .origin_url
            .as_deref()
            .map(|u| resolver.canonicalize(u))
            .or_else(|| witness::origin_url_for(&resolver, &e.primary_url))
            .unwrap_or_else(|| e.primary_url.clone());

        let origin_hash = resolver.parse_hash(&origin_url);
        let origin_any = url_to_id
            .get(&origin_url)
            .cloned()
            .or_else(|| origin_hash.as_ref().and_then(|h| entry_by_hash.get(h).cloned()));
        let root_override = origin_hash.as_ref().and_then(|h| root_by_hash.get(h).cloned());
        let origin_parent = root_override
            .or(origin_any)
            .or_else(|| moment_parent_by_url.get(&origin_url).cloned());

        moment_origin_by_parent.insert(e.id.clone(), origin_parent.unwrap_or_else(|| e.id.clone()));
    }

    // Final pass: wire parent and origin ids.
    let mut out = pre.clone();
    for e in out.values_mut() {
        let mp = moment_parent_by_id.get(&e.id).cloned().unwrap_or_else(|| e.id.clone());
        e.origin_id = moment_origin_by_parent
            .get(&mp)
            .cloned()
            .unwrap_or_else(|| mp.clone());

        let mut parent_id = None;
        if let Some(raw) = e.payload.parent_url.as_deref() {
            let parent_url = store.resolver().canonicalize(raw);
            let parent_hash = store.resolver().parse_hash(&parent_url);
            let parent_any = url_to_id
                .get(&parent_url)
                .cloned()
                .or_else(|| parent_hash.as_ref().and_then(|h| entry_by_hash.get(h).cloned()));
            let candidate = parent_any.or_else(|| moment_parent_by_url.get(&parent_url).cloned());
            if let Some(p) = candidate {
                if p != e.id {
                    parent_id = Some(p);
                }
            }
        }
        if parent_id.is_none() && e.id != mp {
            parent_id = Some(mp);
        }
        e.parent_id = parent_id;
    }

    out
}

fn leaf_node(e: &EntryCtx) -> SigilNode {
    SigilNode {
        id: e.id.clone(),
        url: e.primary_url.clone(),
        urls: e.urls.clone(),
        payload: e.payload.clone(),
        children: Vec::new(),
    }
}

fn build_tree(
    root: &ContentId,
    idx: &IndexMap<ContentId, EntryCtx>,
    children: &HashMap<ContentId, Vec<ContentId>>,
) -> Option<SigilNode> {
    let root_entry = idx.get(root)?;

    struct Frame {
        node: SigilNode,
        kids: std::vec::IntoIter<ContentId>,
    }

    let mut visited: HashSet<ContentId> = HashSet::new();
    visited.insert(root.clone());
    let mut stack = vec![Frame {
        node: leaf_node(root_entry),
        kids: children.get(root).cloned().unwrap_or_default().into_iter(),
    }];

    loop {
        let next = stack.last_mut()?.kids.next();
        match next {
            Some(cid) => {
                let Some(child) = idx.get(&cid) else { continue };
                if visited.insert(cid.clone()) {
                    stack.push(Frame {
                        node: leaf_node(child),
                        kids: children.get(&cid).cloned().unwrap_or_default().into_iter(),
                    });
                } else {
                    // Revisited inside its own subtree: emit as a leaf.
                    let top = stack.last_mut()?;
                    top.node.children.push(leaf_node(child));
                }
            }
            None => {
                let done = stack.pop()?;
                match stack.last_mut() {
                    Some(parent) => parent.node.children.push(done.node),
                    None => return Some(done.node),
                }
            }
        }
    }
}

fn summarize(root: &SigilNode) -> (usize, SigilPayload) {
    let mut count = 0usize;
    let mut latest = root.payload.clone();
    let mut stack: Vec<&SigilNode> = vec![root];
    while let Some(n) = stack.pop() {
        count += 1;
        if n.payload.kai_cmp(&latest) == std::cmp::Ordering::Greater {
            latest = n.payload.clone();
        }
        stack.extend(n.children.iter());
    }
    (count, latest)
}

/// Build the forest: one rooted tree per shared origin, roots ordered by
/// most-recent-descendant time, then subtree size, then root time, then id.
pub fn build_forest(store: &RegistryStore) -> Vec<SigilNode> {
    let idx = build_index(store);

    let mut children: HashMap<ContentId, Vec<ContentId>> = HashMap::new();
    for e in idx.values() {
        if let Some(p) = &e.parent_id {
            children.entry(p.clone()).or_default().push(e.id.clone());
        }
    }
    for kids in children.values_mut() {
        kids.sort_by(|a, b| {
            let (Some(ea), Some(eb)) = (idx.get(a), idx.get(b)) else {
                return std::cmp::Ordering::Equal;
            };
            eb.payload.kai_cmp(&ea.payload)
        });
    }

    let mut groups: IndexMap<ContentId, ()> = IndexMap::new();
    for e in idx.values() {
        groups.entry(e.origin_id.clone()).or_insert(());
    }

    struct Branch {
        root: SigilNode,
        node_count: usize,
        latest: SigilPayload,
    }

    let mut decorated: Vec<Branch> = Vec::new();
    for origin_id in groups.keys() {
        let Some(tree) = build_tree(origin_id, &idx, &children) else {
            continue;
        };
        let (node_count, latest) = summarize(&tree);
        decorated.push(Branch {
            root: tree,
            node_count,
            latest,
        });
    }

    decorated.sort_by(|a, b| {
        b.latest
            .kai_cmp(&a.latest)
            .then_with(|| b.node_count.cmp(&a.node_count))
            .then_with(|| b.root.payload.kai_cmp(&a.root.payload))
            .then_with(|| a.root.id.cmp(&b.root.id))
    });

    decorated.into_iter().map(|d| d.root).collect()
}

/// Canonical hash for a node: explicit field first, then any URL variant.
pub fn resolve_canonical_hash(resolver: &UrlResolver, node: &SigilNode) -> Option<String> {
    if let Some(h) = node.payload.canonical_hash.as_deref() {
        return Some(h.to_string());
    }
    if let Some(h) = resolver.parse_hash(&node.url) {
        return Some(h);
    }
    for url in &node.urls {
        if let Some(h) = resolver.parse_hash(url) {
            return Some(h);
        }
        if let Some(p) = resolver.extract_payload(url) {
            if let Some(h) = p.canonical_hash {
                return Some(h);
            }
        }
    }
    None
}
