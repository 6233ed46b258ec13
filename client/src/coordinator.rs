//! Host capability handed to the live query at construction. Folds the
//! source's optional-callback grab bag into one trait so reconciliation
//! inputs are explicit.

use std::collections::HashMap;

use crate::error::ClientError;

pub trait Coordinator: Send + Sync + 'static {
    /// Optimistic-to-server id mappings known to the host (e.g. an outbox
    /// that confirmed creates while this query was detached).
    fn id_mappings(&self) -> HashMap<String, String> { HashMap::new() }

    /// Whether the host still has mutations in flight targeting `id`.
    /// A pending mutation defers optimistic-entry replacement.
    fn has_pending_mutations(&self, _id: &str) -> bool { false }

    /// Wire status 401 lands here instead of on the snapshot.
    fn on_auth_error(&self, _error: &ClientError) {}

    /// An optimistic entry was replaced by its server identity.
    fn on_id_remapped(&self, _optimistic_id: &str, _server_id: &str) {}
}

/// Default capability: no external mappings, no external pending state.
pub struct NoopCoordinator;

impl Coordinator for NoopCoordinator {}
