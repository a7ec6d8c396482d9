//! Room presence registry: room → number of live admitted connections.
//!
//! Invariants:
//! - a room is present iff its count is at least 1 (zero is evicted, never stored)
//! - iteration follows insertion order, and eviction keeps the order of the rest
//!
//! The map is only reachable through [`RoomRegistry`]'s methods. The lock is
//! held for a single operation and never across an `.await`.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use serde::Serialize;

/// A non-empty room name taken from a connection's request path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

impl RoomId {
    /// Wrap a room name. Empty names are "no room" and yield `None`.
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        (!name.is_empty()).then_some(Self(name))
    }

    /// Derive a room from a request path by stripping one leading `/`.
    ///
    /// `"/doc-a"` → `doc-a`, `"/a/b"` → `a/b`, `"/"` and `""` → no room.
    /// No other normalization: case and inner separators are kept.
    pub fn from_path(path: &str) -> Option<Self> {
        Self::new(path.strip_prefix('/').unwrap_or(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One row of a registry snapshot, as served by `/rooms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomPresence {
    pub name: String,
    pub connections: usize,
}

/// Process-wide presence counts.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: Mutex<IndexMap<RoomId, usize>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Counts stay consistent even if a holder panicked: every operation
    // completes its single map update before returning.
    fn rooms(&self) -> MutexGuard<'_, IndexMap<RoomId, usize>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add one presence unit. Returns the new count.
    pub fn increment(&self, room: &RoomId) -> usize {
        let mut rooms = self.rooms();
        let count = rooms.entry(room.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Remove one presence unit, evicting the room when it would reach zero.
    ///
    /// Returns the remaining count (0 once evicted or if the room was absent).
    pub fn decrement_or_evict(&self, room: &RoomId) -> usize {
        let mut rooms = self.rooms();
        match rooms.get_mut(room) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                rooms.shift_remove(room);
                0
            }
            None => 0,
        }
    }

    /// Insert `room` with `count` unless it is already tracked.
    ///
    /// Never overwrites an existing entry. A zero `count` is ignored so the
    /// no-zero invariant holds. Returns true if the room was inserted.
    pub fn insert_if_absent(&self, room: &RoomId, count: usize) -> bool {
        if count == 0 {
            return false;
        }
        let mut rooms = self.rooms();
        if rooms.contains_key(room) {
            return false;
        }
        rooms.insert(room.clone(), count);
        true
    }

    /// Current count for a room (0 when absent).
    pub fn count(&self, room: &RoomId) -> usize {
        self.rooms().get(room).copied().unwrap_or(0)
    }

    /// Whether the room is tracked at all.
    pub fn contains(&self, room: &RoomId) -> bool {
        self.rooms().contains_key(room)
    }

    /// Number of tracked rooms.
    pub fn len(&self) -> usize {
        self.rooms().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms().is_empty()
    }

    /// Point-in-time copy in insertion order.
    pub fn snapshot(&self) -> Vec<RoomPresence> {
        self.rooms()
            .iter()
            .map(|(room, &connections)| RoomPresence {
                name: room.as_str().to_string(),
                connections,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(name: &str) -> RoomId {
        RoomId::new(name).unwrap()
    }

    #[test]
    fn test_room_from_path() {
        assert_eq!(RoomId::from_path("/doc-a"), Some(room("doc-a")));
        assert_eq!(RoomId::from_path("/a/b"), Some(room("a/b")));
        assert_eq!(RoomId::from_path("//x"), Some(room("/x")));
        assert_eq!(RoomId::from_path("/Doc"), Some(room("Doc")));
        assert_eq!(RoomId::from_path("plain"), Some(room("plain")));
        assert_eq!(RoomId::from_path("/"), None);
        assert_eq!(RoomId::from_path(""), None);
    }

    #[test]
    fn test_room_case_sensitive() {
        assert_ne!(room("Doc"), room("doc"));
    }

    #[test]
    fn test_increment_and_decrement() {
        let registry = RoomRegistry::new();
        let a = room("doc-a");

        assert_eq!(registry.increment(&a), 1);
        assert_eq!(registry.increment(&a), 2);
        assert_eq!(registry.decrement_or_evict(&a), 1);
        assert_eq!(registry.count(&a), 1);
        assert_eq!(registry.decrement_or_evict(&a), 0);
        assert!(!registry.contains(&a));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_decrement_absent_room_is_noop() {
        let registry = RoomRegistry::new();
        let a = room("doc-a");
        assert_eq!(registry.decrement_or_evict(&a), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_never_stores_zero() {
        let registry = RoomRegistry::new();
        let a = room("doc-a");
        registry.increment(&a);
        registry.decrement_or_evict(&a);
        registry.decrement_or_evict(&a);
        assert!(registry.snapshot().iter().all(|r| r.connections > 0));
        assert!(!registry.insert_if_absent(&a, 0));
        assert!(!registry.contains(&a));
    }

    #[test]
    fn test_insert_if_absent_never_overwrites() {
        let registry = RoomRegistry::new();
        let a = room("doc-a");
        registry.increment(&a);
        registry.increment(&a);
        registry.increment(&a);

        assert!(!registry.insert_if_absent(&a, 1));
        assert_eq!(registry.count(&a), 3);

        let b = room("doc-b");
        assert!(registry.insert_if_absent(&b, 1));
        assert_eq!(registry.count(&b), 1);
    }

    #[test]
    fn test_snapshot_insertion_order() {
        let registry = RoomRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.increment(&room(name));
        }
        let names: Vec<String> = registry.snapshot().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_eviction_preserves_order_of_remaining() {
        let registry = RoomRegistry::new();
        for name in ["a", "b", "c"] {
            registry.increment(&room(name));
        }
        registry.decrement_or_evict(&room("b"));
        let names: Vec<String> = registry.snapshot().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn test_snapshot_idempotent() {
        let registry = RoomRegistry::new();
        registry.increment(&room("doc-a"));
        registry.increment(&room("doc-a"));
        registry.increment(&room("doc-c"));
        assert_eq!(registry.snapshot(), registry.snapshot());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = RoomRegistry::new();
        let a = room("doc-a");
        registry.increment(&a);
        let before = registry.snapshot();
        registry.increment(&a);
        assert_eq!(before[0].connections, 1);
        assert_eq!(registry.snapshot()[0].connections, 2);
    }

    #[test]
    fn test_count_tracks_open_connections() {
        // Interleaved opens/closes: the count always equals opens minus closes.
        let registry = RoomRegistry::new();
        let a = room("doc-a");
        let events = [true, true, false, true, false, false, true, false];
        let mut open = 0usize;
        for opened in events {
            if opened {
                open += 1;
                registry.increment(&a);
            } else {
                open -= 1;
                registry.decrement_or_evict(&a);
            }
            assert_eq!(registry.count(&a), open);
            assert_eq!(registry.contains(&a), open > 0);
        }
    }

    #[test]
    fn test_rooms_are_independent() {
        let registry = RoomRegistry::new();
        let a = room("doc-a");
        let b = room("doc-b");
        registry.increment(&a);
        registry.increment(&b);
        registry.decrement_or_evict(&a);
        assert_eq!(registry.count(&b), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_serializes_as_name_and_connections() {
        let row = RoomPresence { name: "doc-a".to_string(), connections: 2 };
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"{"name":"doc-a","connections":2}"#
        );
    }
}
