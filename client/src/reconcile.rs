//! Reconciliation decisions and relation-preserving merges. The decision
//! is a pure function over (mapping, pending) so the ghost-prevention
//! algorithm stays auditable.

use concave_proto::JsonObject;
use serde_json::Value;

/// What to do with a server object whose id maps to a cached optimistic
/// entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reconcile {
    /// Replace the optimistic entry with the server entry.
    Replace,
    /// A pending mutation still targets the optimistic id: keep the local
    /// entry (and its edits) visible; only record the mapping.
    Defer,
    /// Not ours to apply (e.g. unknown id in strict mode).
    Ignore,
}

pub(crate) fn decide_replacement(has_pending: bool) -> Reconcile {
    if has_pending {
        Reconcile::Defer
    } else {
        Reconcile::Replace
    }
}

fn is_relation_value(value: &Value) -> bool { value.is_object() || value.is_array() }

/// Did the foreign key for `relation` change between the cached object and
/// the incoming one (or become null)? A changed/nulled key makes the
/// cached sidecar stale.
fn foreign_key_invalidates(relation: &str, current: &JsonObject, incoming: &JsonObject) -> bool {
    let fk = format!("{relation}Id");
    match (current.get(&fk), incoming.get(&fk)) {
        (Some(old), Some(new)) => new.is_null() || old != new,
        (None, Some(new)) => new.is_null(),
        // incoming does not mention the key: nothing changed
        _ => false,
    }
}

/// Merge an incoming server object over the cached one. Incoming fields
/// win; fields the server omitted are carried over, and cached relation
/// sidecars survive unless their foreign key changed.
pub(crate) fn merge_preserving_relations(current: &JsonObject, incoming: &JsonObject) -> JsonObject {
    let mut result = incoming.clone();
    for (key, value) in current {
        if result.contains_key(key) {
            continue;
        }
        if is_relation_value(value) && foreign_key_invalidates(key, current, incoming) {
            continue; // stale sidecar cleared
        }
        result.insert(key.clone(), value.clone());
    }
    result
}

/// Apply an optimistic patch locally. Setting a `*Id` field to a new (or
/// null) value clears the corresponding relation sidecar.
pub(crate) fn apply_patch(current: &JsonObject, patch: &JsonObject) -> JsonObject {
    let mut result = current.clone();
    for (key, value) in patch {
        if let Some(relation) = key.strip_suffix("Id") {
            if !relation.is_empty() && (value.is_null() || current.get(key) != Some(value)) {
                result.remove(relation);
            }
        }
        result.insert(key.clone(), value.clone());
    }
    result
}
