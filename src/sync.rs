//! Inbound sync types and state.
//!
//! The pull half of synchronization is driven by
//! [`SigilEngine::sync_once`](crate::engine::SigilEngine::sync_once): a
//! cheap seal check gates the expensive paginated listing, and a single
//! in-flight guard keeps cycles from overlapping.

use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Why a sync cycle was started. Carried for logging and for the
/// full-reseed decision (an explicit open always reseeds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncReason {
    Open,
    Pulse,
    Visible,
    Focus,
    Online,
    Import,
}

/// Pull tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    pub page_limit: u64,
    /// Safety cap on pages per cycle.
    pub max_pages: u32,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            page_limit: 5000,
            max_pages: 24,
        }
    }
}

/// What one sync cycle did.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOutcome {
    /// Another cycle was already running; nothing was done.
    pub in_flight: bool,
    /// The seal short-circuit skipped pagination entirely.
    pub skipped_pull: bool,
    /// At least one listing page was fetched.
    pub pulled: bool,
    /// Records merged into the registry this cycle.
    pub imported: usize,
    /// The outbound queue was reseeded from the full registry.
    pub reseeded: bool,
}

#[derive(Debug, Default)]
pub(crate) struct SyncState {
    pub(crate) in_flight: AtomicBool,
    pub(crate) remote_seal: Mutex<Option<String>>,
    pub(crate) last_seed_seal: Mutex<Option<String>>,
}
