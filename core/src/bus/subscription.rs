use chrono::{DateTime, Utc};
use concave_proto::{HandlerId, JsonObject, Seq, SubscriptionId};
use std::{collections::HashSet, sync::Arc};

use crate::filter::CompiledFilter;

/// Everything needed to create a subscription. `filter` and `scope_filter`
/// are DSL source strings; the bus compiles them once at creation.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub resource: String,
    pub filter: String,
    pub handler_id: HandlerId,
    pub auth_id: String,
    /// Authorization overlay, AND-composed with the user filter.
    pub scope_filter: Option<String>,
    pub auth_expires_at: Option<DateTime<Utc>>,
    /// Omit the initial `existing` snapshot entirely.
    pub skip_existing: bool,
    /// Ids the client already holds; `existing` is skipped for them but
    /// they still enter the relevance set.
    pub known_ids: Vec<String>,
}

impl SubscriptionSpec {
    pub fn new(resource: impl Into<String>, filter: impl Into<String>, handler_id: HandlerId, auth_id: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            filter: filter.into(),
            handler_id,
            auth_id: auth_id.into(),
            scope_filter: None,
            auth_expires_at: None,
            skip_existing: false,
            known_ids: Vec::new(),
        }
    }

    pub fn scope(mut self, scope_filter: impl Into<String>) -> Self {
        self.scope_filter = Some(scope_filter.into());
        self
    }

    pub fn auth_expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.auth_expires_at = Some(at);
        self
    }
}

pub(crate) struct SubState {
    pub last_seq: Seq,
    pub relevant: HashSet<String>,
}

pub(crate) struct SubInner {
    pub id: SubscriptionId,
    pub resource: String,
    pub handler_id: HandlerId,
    pub filter: Arc<dyn CompiledFilter>,
    pub scope: Option<Arc<dyn CompiledFilter>>,
    pub auth_id: String,
    pub auth_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub skip_existing: bool,
    pub known_ids: HashSet<String>,
    pub state: std::sync::Mutex<SubState>,
}

/// A filter + scope + cursor attached to a handler; the unit of delivery.
#[derive(Clone)]
pub(crate) struct Subscription(pub(crate) Arc<SubInner>);

impl std::ops::Deref for Subscription {
    type Target = SubInner;
    fn deref(&self) -> &Self::Target { &self.0 }
}

impl Subscription {
    pub(crate) fn new(spec: &SubscriptionSpec, filter: Arc<dyn CompiledFilter>, scope: Option<Arc<dyn CompiledFilter>>) -> Self {
        Self(Arc::new(SubInner {
            id: SubscriptionId::new(),
            resource: spec.resource.clone(),
            handler_id: spec.handler_id,
            filter,
            scope,
            auth_id: spec.auth_id.clone(),
            auth_expires_at: spec.auth_expires_at,
            created_at: Utc::now(),
            skip_existing: spec.skip_existing,
            known_ids: spec.known_ids.iter().cloned().collect(),
            // ids the client already holds are its last-known snapshot
            state: std::sync::Mutex::new(SubState { last_seq: 0, relevant: spec.known_ids.iter().cloned().collect() }),
        }))
    }

    /// Scope mismatch is treated as "not matching".
    pub(crate) fn matches(&self, object: &JsonObject) -> bool {
        self.filter.matches(object) && self.scope.as_ref().map_or(true, |scope| scope.matches(object))
    }

    pub(crate) fn auth_expired(&self, now: DateTime<Utc>) -> bool {
        self.auth_expires_at.map_or(false, |expires| expires <= now)
    }

    pub(crate) fn lock_state(&self) -> std::sync::MutexGuard<'_, SubState> {
        self.state.lock().expect("subscription state lock poisoned")
    }

    pub(crate) fn last_seq(&self) -> Seq { self.lock_state().last_seq }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        write!(
            f,
            "Subscription {{ id: {}, resource: {}, filter: {}, last_seq: {}, relevant: {} }}",
            self.id,
            self.resource,
            self.filter.source(),
            state.last_seq,
            state.relevant.len()
        )
    }
}
