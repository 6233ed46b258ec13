//! The optimistic cache arena. Entries are keyed by a locally-generated
//! entry id, with secondary indices by optimistic and by server id. An
//! object is reachable through exactly one identity at any time, which is
//! what keeps ghost duplicates structurally impossible.

use concave_proto::JsonObject;
use std::collections::HashMap;

pub(crate) type EntryId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Identity {
    Optimistic(String),
    Server(String),
}

impl Identity {
    pub fn as_str(&self) -> &str {
        match self {
            Identity::Optimistic(id) | Identity::Server(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub object: JsonObject,
    pub identity: Identity,
    /// Arrival stamps for the append/prepend view modes. Preserved across
    /// subsequent `changed` events on the same entry.
    pub appended_at: Option<u64>,
    pub prepended_at: Option<u64>,
}

/// Where a newly observed server object lands positionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Position {
    Plain,
    Appended,
    Prepended,
}

#[derive(Default)]
pub(crate) struct Cache {
    entries: HashMap<EntryId, CacheEntry>,
    by_optimistic: HashMap<String, EntryId>,
    by_server: HashMap<String, EntryId>,
    /// optimistic id -> server id, recorded when confirmation arrives.
    mappings: HashMap<String, String>,
    /// reverse of `mappings` for event-side lookups.
    reverse_mappings: HashMap<String, String>,
    next_entry: EntryId,
    arrival: u64,
}

impl Cache {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> { self.entries.values() }

    fn next_entry_id(&mut self) -> EntryId {
        self.next_entry += 1;
        self.next_entry
    }

    fn next_arrival(&mut self) -> u64 {
        self.arrival += 1;
        self.arrival
    }

    pub fn insert_optimistic(&mut self, optimistic_id: &str, object: JsonObject) -> EntryId {
        let entry_id = self.next_entry_id();
        let stamp = self.next_arrival();
        self.entries.insert(
            entry_id,
            CacheEntry {
                object,
                identity: Identity::Optimistic(optimistic_id.to_string()),
                // locally-created objects take the "new arrival" position
                appended_at: Some(stamp),
                prepended_at: Some(stamp),
            },
        );
        self.by_optimistic.insert(optimistic_id.to_string(), entry_id);
        entry_id
    }

    pub fn insert_server(&mut self, server_id: &str, object: JsonObject, position: Position) -> EntryId {
        let entry_id = self.next_entry_id();
        let (appended_at, prepended_at) = match position {
            Position::Plain => (None, None),
            Position::Appended => (Some(self.next_arrival()), None),
            Position::Prepended => (None, Some(self.next_arrival())),
        };
        self.entries
            .insert(entry_id, CacheEntry { object, identity: Identity::Server(server_id.to_string()), appended_at, prepended_at });
        self.by_server.insert(server_id.to_string(), entry_id);
        entry_id
    }

    pub fn get(&self, entry_id: EntryId) -> Option<&CacheEntry> { self.entries.get(&entry_id) }

    pub fn get_mut(&mut self, entry_id: EntryId) -> Option<&mut CacheEntry> { self.entries.get_mut(&entry_id) }

    pub fn by_optimistic(&self, optimistic_id: &str) -> Option<EntryId> { self.by_optimistic.get(optimistic_id).copied() }

    pub fn by_server(&self, server_id: &str) -> Option<EntryId> { self.by_server.get(server_id).copied() }

    /// Resolve a user-facing id: optimistic first, then server, then
    /// through the mapping in either direction.
    pub fn resolve(&self, id: &str) -> Option<EntryId> {
        self.by_optimistic(id)
            .or_else(|| self.by_server(id))
            .or_else(|| self.mappings.get(id).and_then(|server_id| self.by_server(server_id)))
            .or_else(|| self.reverse_mappings.get(id).and_then(|optimistic_id| self.by_optimistic(optimistic_id)))
    }

    pub fn record_mapping(&mut self, optimistic_id: &str, server_id: &str) {
        self.mappings.insert(optimistic_id.to_string(), server_id.to_string());
        self.reverse_mappings.insert(server_id.to_string(), optimistic_id.to_string());
    }

    pub fn mapping_for(&self, optimistic_id: &str) -> Option<&str> { self.mappings.get(optimistic_id).map(String::as_str) }

    pub fn optimistic_for(&self, server_id: &str) -> Option<&str> { self.reverse_mappings.get(server_id).map(String::as_str) }

    /// Atomically swap an optimistic entry to its server identity,
    /// installing the authoritative object. Positional markers survive.
    pub fn promote(&mut self, optimistic_id: &str, server_id: &str, object: JsonObject) -> Option<EntryId> {
        let entry_id = self.by_optimistic.remove(optimistic_id)?;
        let entry = self.entries.get_mut(&entry_id)?;
        entry.identity = Identity::Server(server_id.to_string());
        entry.object = object;
        self.by_server.insert(server_id.to_string(), entry_id);
        self.record_mapping(optimistic_id, server_id);
        Some(entry_id)
    }

    pub fn remove(&mut self, entry_id: EntryId) -> Option<CacheEntry> {
        let entry = self.entries.remove(&entry_id)?;
        match &entry.identity {
            Identity::Optimistic(id) => {
                self.by_optimistic.remove(id);
            }
            Identity::Server(id) => {
                self.by_server.remove(id);
            }
        }
        Some(entry)
    }

    /// Drop every server-identified entry (after an `invalidate`); pending
    /// optimistic entries survive so local edits are not lost.
    pub fn clear_server_entries(&mut self) {
        let server_entries: Vec<EntryId> = self.by_server.values().copied().collect();
        for entry_id in server_entries {
            self.remove(entry_id);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_optimistic.clear();
        self.by_server.clear();
        self.mappings.clear();
        self.reverse_mappings.clear();
    }

    /// Server ids currently cached, for reconnect `known_ids`.
    pub fn server_ids(&self) -> Vec<String> { self.by_server.keys().cloned().collect() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: serde_json::Value) -> JsonObject {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn one_identity_at_a_time() {
        let mut cache = Cache::new();
        let entry_id = cache.insert_optimistic("opt_1", object(json!({"id": "opt_1", "done": true})));
        assert_eq!(cache.by_optimistic("opt_1"), Some(entry_id));
        assert_eq!(cache.by_server("srv_1"), None);

        cache.promote("opt_1", "srv_1", object(json!({"id": "srv_1", "done": true})));
        assert_eq!(cache.by_optimistic("opt_1"), None, "optimistic index released on promote");
        assert_eq!(cache.by_server("srv_1"), Some(entry_id));
        assert_eq!(cache.len(), 1);

        // both ids still resolve to the same entry
        assert_eq!(cache.resolve("opt_1"), Some(entry_id));
        assert_eq!(cache.resolve("srv_1"), Some(entry_id));
    }

    #[test]
    fn promote_preserves_positional_markers() {
        let mut cache = Cache::new();
        cache.insert_optimistic("opt_1", object(json!({"id": "opt_1"})));
        let appended = cache.get(cache.by_optimistic("opt_1").unwrap()).unwrap().appended_at;
        assert!(appended.is_some());

        let entry_id = cache.promote("opt_1", "srv_1", object(json!({"id": "srv_1"}))).unwrap();
        assert_eq!(cache.get(entry_id).unwrap().appended_at, appended);
    }

    #[test]
    fn clear_server_entries_keeps_optimistic() {
        let mut cache = Cache::new();
        cache.insert_optimistic("opt_1", object(json!({"id": "opt_1"})));
        cache.insert_server("srv_9", object(json!({"id": "srv_9"})), Position::Plain);
        cache.clear_server_entries();
        assert_eq!(cache.len(), 1);
        assert!(cache.by_optimistic("opt_1").is_some());
        assert!(cache.by_server("srv_9").is_none());
    }
}
