//! Gap-filling between the engine's open documents and the registry.
//!
//! The engine knows which documents are open but not how many connections
//! each has. Reconciliation only discovers rooms the lifecycle tracker has
//! not counted yet (inserted at 1). It never corrects or removes an entry.

use std::sync::Arc;

use crate::engine::SyncEngine;
use crate::registry::{RoomId, RoomRegistry};

/// Merges engine document ids into a [`RoomRegistry`].
#[derive(Debug, Clone)]
pub struct Reconciler {
    registry: Arc<RoomRegistry>,
}

impl Reconciler {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    /// Insert every live, non-empty document id the registry does not track.
    ///
    /// Returns the number of rooms discovered.
    pub fn reconcile<I, S>(&self, live_document_ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut discovered = 0;
        for id in live_document_ids {
            let Some(room) = RoomId::new(id) else { continue };
            if self.registry.insert_if_absent(&room, 1) {
                log::debug!("Reconciliation discovered room {room}");
                discovered += 1;
            }
        }
        if discovered > 0 {
            log::info!("Reconciliation added {discovered} untracked room(s)");
        }
        discovered
    }

    /// Reconcile against the engine's current document table.
    ///
    /// Runs with the table locked: a room whose last session is leaving is
    /// either still open (its presence still counted) or already gone.
    pub async fn reconcile_engine(&self, engine: &SyncEngine) -> usize {
        engine.with_document_ids(|ids| self.reconcile(ids)).await
    }

    /// Run [`Self::reconcile_engine`] forever on a fixed interval.
    pub async fn run_periodic(self, engine: Arc<SyncEngine>, every: std::time::Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.reconcile_engine(&engine).await;
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(name: &str) -> RoomId {
        RoomId::new(name).unwrap()
    }

    #[test]
    fn test_discovers_untracked_rooms() {
        let registry = Arc::new(RoomRegistry::new());
        let reconciler = Reconciler::new(registry.clone());

        let added = reconciler.reconcile(["doc-a", "doc-b"]);
        assert_eq!(added, 2);
        assert_eq!(registry.count(&room("doc-a")), 1);
        assert_eq!(registry.count(&room("doc-b")), 1);
    }

    #[test]
    fn test_never_overwrites_counts() {
        let registry = Arc::new(RoomRegistry::new());
        let a = room("doc-a");
        registry.increment(&a);
        registry.increment(&a);

        let reconciler = Reconciler::new(registry.clone());
        assert_eq!(reconciler.reconcile(["doc-a"]), 0);
        assert_eq!(registry.count(&a), 2);
    }

    #[test]
    fn test_never_removes_entries() {
        let registry = Arc::new(RoomRegistry::new());
        registry.increment(&room("doc-a"));
        registry.increment(&room("doc-c"));

        let reconciler = Reconciler::new(registry.clone());
        reconciler.reconcile(Vec::<String>::new());
        reconciler.reconcile(["doc-b"]);

        assert!(registry.contains(&room("doc-a")));
        assert!(registry.contains(&room("doc-c")));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_skips_empty_document_id() {
        let registry = Arc::new(RoomRegistry::new());
        let reconciler = Reconciler::new(registry.clone());
        assert_eq!(reconciler.reconcile([""]), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_repeated_pass_is_stable() {
        let registry = Arc::new(RoomRegistry::new());
        let reconciler = Reconciler::new(registry.clone());
        reconciler.reconcile(["doc-a"]);
        let first = registry.snapshot();
        assert_eq!(reconciler.reconcile(["doc-a"]), 0);
        assert_eq!(registry.snapshot(), first);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pass_never_resurrects_closed_room() {
        use crate::engine::EngineConfig;
        use crate::lifecycle::Presence;

        let registry = Arc::new(RoomRegistry::new());
        let engine = Arc::new(SyncEngine::new(EngineConfig::default()));
        let reconciler = Reconciler::new(registry.clone());
        let a = room("doc-a");

        for _ in 0..500 {
            // Same order as a session: count, open, close, release.
            let presence = Presence::register(&registry, Some(&a));
            engine.open_document("doc-a").await;

            let pass = {
                let reconciler = reconciler.clone();
                let engine = engine.clone();
                tokio::spawn(async move { reconciler.reconcile_engine(&engine).await })
            };
            engine.close_document("doc-a").await;
            drop(presence);

            assert_eq!(pass.await.unwrap(), 0);
            assert!(registry.is_empty());
        }
    }

    #[tokio::test]
    async fn test_reconcile_engine_discovers_open_documents() {
        let registry = Arc::new(RoomRegistry::new());
        let reconciler = Reconciler::new(registry.clone());
        let engine = SyncEngine::new(crate::engine::EngineConfig::default());
        engine.open_document("doc-a").await;
        engine.open_document("").await;

        assert_eq!(reconciler.reconcile_engine(&engine).await, 1);
        assert_eq!(registry.count(&room("doc-a")), 1);
        assert_eq!(reconciler.reconcile_engine(&engine).await, 0);
    }

    #[tokio::test]
    async fn test_reconcile_empty_engine() {
        let registry = Arc::new(RoomRegistry::new());
        let reconciler = Reconciler::new(registry.clone());
        let engine = SyncEngine::new(crate::engine::EngineConfig::default());
        assert_eq!(reconciler.reconcile_engine(&engine).await, 0);
        assert!(registry.is_empty());
    }
}
