//! Offline-first, content-addressed sigil registry and synchronization
//! engine.
//!
//! Many independent client instances and a remote backing service stay
//! consistent about a growing set of immutable, timestamped records without
//! a central transactional database, tolerating arbitrary offline periods.
//! The engine:
//!
//! - collapses every URL encoding of a record onto one canonical key and
//!   one content identity ([`ident`]),
//! - reconstructs ancestry from self-describing witness markers embedded in
//!   the URLs themselves ([`witness`]),
//! - merges observations monotonically into an append-only registry
//!   ([`registry`]),
//! - pushes local knowledge to a dual-base remote with debounce and
//!   backoff ([`queue`], [`client`]),
//! - pulls the remote listing behind a cheap seal check ([`engine`],
//!   [`sync`]),
//! - and renders the flat registry as rooted trees for presentation
//!   ([`forest`]).
//!
//! Consistency is eventual with at-least-once delivery toward the remote.
//! There are no locks across instances and no ordering guarantees; safety
//! comes from the merge policy being idempotent and monotonic, so replayed
//! or reordered observations converge to the same state.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sigil_sync::{EngineConfig, LoopbackTransport, MemStorage, SigilEngine, SyncReason};
//!
//! # async fn run() {
//! let engine = SigilEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(MemStorage::default()),
//!     Arc::new(LoopbackTransport::default()),
//! );
//! engine.ensure_hydrated();
//! engine.start();
//!
//! engine.add_url("/s/abc123?p=c:eyJ1IjoxMH0", Default::default());
//! engine.sync_once(SyncReason::Open).await;
//! let forest = engine.build_forest();
//! # drop(forest);
//! # }
//! ```

pub mod cadence;
pub mod client;
pub mod engine;
pub mod forest;
pub mod health;
pub mod ident;
pub mod payload;
pub mod queue;
pub mod registry;
pub mod store;
pub mod sync;
pub mod transfers;
pub mod transport;
pub mod witness;

pub use crate::client::{RemoteClient, RemoteConfig, SealResponse, UrlsPage};
pub use crate::engine::{AddSource, AddUrlOptions, EngineConfig, ImportSummary, SigilEngine};
pub use crate::forest::{build_forest, SigilNode};
pub use crate::health::{HealthProber, HealthScores, ProbeConfig, ProbeOutcome};
pub use crate::ident::{ContentId, ContentKind, MomentKey, UrlResolver};
pub use crate::payload::{ChakraDay, DecodeError, SigilPayload};
pub use crate::queue::{OutboundConfig, OutboundQueue};
pub use crate::registry::{RegistryEntry, RegistryStore};
pub use crate::store::{FsStorage, MemStorage, Storage, StoreError};
pub use crate::sync::{PullConfig, SyncOutcome, SyncReason};
pub use crate::transfers::{
    Movement, TransferDirection, TransferLedger, TransferMove, TransferRecord,
};
pub use crate::transport::{LoopbackTransport, SyncEvent, Transport};
