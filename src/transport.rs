//! Cross-instance signaling.
//!
//! Independent engine instances (tabs, windows, processes sharing a device)
//! reconcile through three channels: this transport for live notification,
//! the shared [`Storage`](crate::store::Storage) for instances not currently
//! listening, and the periodic remote pull. The transport is a trait so the
//! browser-bridge host can plug its broadcast primitive in while tests use
//! the in-process loopback.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::transfers::TransferRecord;

/// Events fanned out to sibling engine instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A record was added or materially merged under this canonical URL.
    Add { url: String },
    /// The presentation layer selected a record by hash.
    Select { hash: String },
    /// A transfer movement was recorded in the ledger.
    Transfer { record: TransferRecord },
}

/// Publish/subscribe fan-out between engine instances.
pub trait Transport: Send + Sync + fmt::Debug {
    fn publish(&self, event: SyncEvent);
    fn subscribe(&self) -> broadcast::Receiver<SyncEvent>;
}

/// In-process loopback transport; the default, and the test double.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(128);
        Self { tx }
    }
}

impl Transport for LoopbackTransport {
    fn publish(&self, event: SyncEvent) {
        // No subscribers is not an error; events are fire-and-forget.
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_delivers_to_subscribers() {
        let t = LoopbackTransport::default();
        let mut rx = t.subscribe();
        t.publish(SyncEvent::Add {
            url: "https://phi.network/s/abc".into(),
        });
        match rx.recv().await.unwrap() {
            SyncEvent::Add { url } => assert!(url.ends_with("/s/abc")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let t = LoopbackTransport::default();
        t.publish(SyncEvent::Select { hash: "h".into() });
    }
}
