//! Connection lifecycle: one presence unit per admitted connection.
//!
//! Connection events are the only thing that changes a room's count. The
//! engine's document table is used for discovery alone (see
//! [`crate::reconcile`]), so the two sources never both count the same
//! connection.
//!
//! Ordering per connection: admission resolves, then the count is
//! incremented, then the engine opens the document. The decrement runs when
//! the [`Presence`] guard drops, after the engine has released the
//! document, whichever way the connection ended.

use std::sync::Arc;

use axum::extract::ws::WebSocket;

use crate::engine::{SessionEnd, SyncEngine};
use crate::gate::PendingAdmission;
use crate::reconcile::Reconciler;
use crate::registry::{RoomId, RoomRegistry};

/// One counted connection. Dropping it releases the count.
#[derive(Debug)]
pub struct Presence {
    registry: Arc<RoomRegistry>,
    room: RoomId,
}

impl Presence {
    /// Count a connection in `room`. Connections without a room are not
    /// tracked and yield `None`.
    pub fn register(registry: &Arc<RoomRegistry>, room: Option<&RoomId>) -> Option<Self> {
        let room = room?.clone();
        let count = registry.increment(&room);
        log::info!("Room {room} now has {count} connection(s)");
        Some(Self {
            registry: registry.clone(),
            room,
        })
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }
}

impl Drop for Presence {
    fn drop(&mut self) {
        match self.registry.decrement_or_evict(&self.room) {
            0 => log::info!("Room {} is empty", self.room),
            remaining => log::info!("Room {} now has {remaining} connection(s)", self.room),
        }
    }
}

/// Ties each admitted connection to a presence unit for its lifetime.
#[derive(Clone)]
pub struct LifecycleTracker {
    registry: Arc<RoomRegistry>,
    reconciler: Reconciler,
    engine: Arc<SyncEngine>,
}

impl LifecycleTracker {
    pub fn new(registry: Arc<RoomRegistry>, engine: Arc<SyncEngine>) -> Self {
        Self {
            reconciler: Reconciler::new(registry.clone()),
            registry,
            engine,
        }
    }

    /// Hand a connection to the engine and track it until it closes.
    ///
    /// Rejected or timed-out connections are never counted.
    pub async fn track(&self, socket: WebSocket, mut admission: PendingAdmission) -> SessionEnd {
        let room = admission.room().cloned();
        let mut presence: Option<Presence> = None;

        let end = {
            let slot = &mut presence;
            let registry = &self.registry;
            let authorization = async move {
                let decision = admission.decision().await;
                if decision.accept {
                    *slot = Presence::register(registry, decision.room.as_ref());
                }
                decision.accept
            };
            self.engine.serve(socket, room, authorization).await
        };

        log::debug!("Session ended: {end:?}");
        drop(presence);
        self.reconciler.reconcile_engine(&self.engine).await;
        end
    }
}
