use chrono::Utc;
use concave_proto::{EventMeta, JsonObject, Seq, StreamEvent};
use rand::Rng;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

use crate::{
    cache::{Cache, Position},
    client::{ListRequest, MutationMeta, ResourceClient},
    connection,
    coordinator::Coordinator,
    error::ClientError,
    observe::{ListenerGuard, Listeners},
    options::{LiveQueryOptions, SubscriptionMode},
    reconcile::{apply_patch, decide_replacement, merge_preserving_relations, Reconcile},
    view,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Loading,
    Live,
    Offline,
    Reconnecting,
    Error,
}

/// Materialized view handed to observers. Referentially stable between
/// change notifications: repeated `get_snapshot` calls return clones of
/// the same `Arc`ed items until the next notification.
#[derive(Clone)]
pub struct Snapshot {
    pub items: Arc<Vec<JsonObject>>,
    pub status: QueryStatus,
    pub error: Option<Arc<ClientError>>,
    pub has_more: bool,
}

/// A mutation waiting for connectivity (or for its create to be confirmed).
#[derive(Debug)]
pub(crate) enum QueuedOp {
    Create { optimistic_id: String, object: JsonObject },
    Update { target: String, patch: JsonObject },
    Delete { target: String },
}

pub(crate) struct QueryState {
    pub cache: Cache,
    /// Count of in-flight or queued mutations per target id. A nonzero
    /// count defers optimistic-entry replacement.
    pub pending: HashMap<String, usize>,
    pub queued: VecDeque<QueuedOp>,
    pub status: QueryStatus,
    pub error: Option<Arc<ClientError>>,
    pub last_seq: Seq,
    pub next_cursor: Option<String>,
    snapshot: Option<Snapshot>,
}

pub(crate) struct Inner {
    pub client: Arc<dyn ResourceClient>,
    pub coordinator: Arc<dyn Coordinator>,
    pub options: LiveQueryOptions,
    pub mode: SubscriptionMode,
    pub state: std::sync::Mutex<QueryState>,
    pub listeners: Listeners,
    pub online: tokio::sync::watch::Receiver<bool>,
    pub destroyed: AtomicBool,
    pump: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    flush_lock: tokio::sync::Mutex<()>,
}

/// One live query over a resource. Cheap to clone; `destroy` ends it.
#[derive(Clone)]
pub struct LiveQuery(pub(crate) Arc<Inner>);

/// What the pump should do after an applied event.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Directive {
    None,
    Resnapshot,
}

fn coin_optimistic_id() -> String {
    let suffix: String = rand::thread_rng().sample_iter(&rand::distributions::Alphanumeric).take(8).map(char::from).collect();
    format!("optimistic_{}_{}", Utc::now().timestamp_millis(), suffix)
}

enum ServerEventKind {
    Existing,
    Added(Option<EventMeta>),
    Changed,
}

impl LiveQuery {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        options: LiveQueryOptions,
        coordinator: Arc<dyn Coordinator>,
        online: tokio::sync::watch::Receiver<bool>,
    ) -> Self {
        let mode = options.resolved_mode();
        let query = Self(Arc::new(Inner {
            client,
            coordinator,
            options,
            mode,
            state: std::sync::Mutex::new(QueryState {
                cache: Cache::new(),
                pending: HashMap::new(),
                queued: VecDeque::new(),
                status: QueryStatus::Loading,
                error: None,
                last_seq: 0,
                next_cursor: None,
                snapshot: None,
            }),
            listeners: Listeners::new(),
            online,
            destroyed: AtomicBool::new(false),
            pump: std::sync::Mutex::new(None),
            flush_lock: tokio::sync::Mutex::new(()),
        }));
        let handle = connection::spawn_pump(&query);
        *query.0.pump.lock().expect("pump lock poisoned") = Some(handle);
        query
    }

    pub(crate) fn lock_state(&self) -> std::sync::MutexGuard<'_, QueryState> {
        self.0.state.lock().expect("live query state lock poisoned")
    }

    pub(crate) fn is_online(&self) -> bool { *self.0.online.borrow() }

    pub fn is_destroyed(&self) -> bool { self.0.destroyed.load(Ordering::SeqCst) }

    fn ensure_alive(&self) -> Result<(), ClientError> {
        if self.is_destroyed() {
            return Err(ClientError::Destroyed);
        }
        Ok(())
    }

    fn id_field(&self) -> &str { &self.0.options.id_field }

    /// Current snapshot; stable between notifications.
    pub fn get_snapshot(&self) -> Snapshot {
        let mut state = self.lock_state();
        if state.snapshot.is_none() {
            self.rebuild_snapshot(&mut state);
        }
        state.snapshot.clone().expect("snapshot rebuilt above")
    }

    /// Every listener call is paired with a subsequent `get_snapshot`
    /// observing a distinct state.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerGuard { self.0.listeners.add(listener) }

    fn rebuild_snapshot(&self, state: &mut QueryState) {
        let items = view::materialize(&state.cache, self.0.mode, &self.0.options.order_by, self.id_field());
        state.snapshot = Some(Snapshot {
            items: Arc::new(items),
            status: state.status,
            error: state.error.clone(),
            has_more: state.next_cursor.is_some(),
        });
    }

    /// Rebuild the snapshot, release the lock, then notify synchronously.
    fn commit(&self, mut state: std::sync::MutexGuard<'_, QueryState>) {
        self.rebuild_snapshot(&mut state);
        drop(state);
        self.0.listeners.notify();
    }

    pub(crate) fn set_status(&self, status: QueryStatus) {
        let mut state = self.lock_state();
        if state.status == status {
            return;
        }
        state.status = status;
        if status == QueryStatus::Live {
            state.error = None;
        }
        self.commit(state);
    }

    pub(crate) fn set_error(&self, error: ClientError) {
        let mut state = self.lock_state();
        state.status = QueryStatus::Error;
        state.error = Some(Arc::new(error));
        self.commit(state);
    }

    pub(crate) fn subscribe_options(&self) -> concave_proto::SubscribeOptions {
        let state = self.lock_state();
        let resuming = state.last_seq > 0;
        concave_proto::SubscribeOptions {
            filter: self.0.options.filter.clone(),
            include: self.0.options.include.clone(),
            resume_from: resuming.then_some(state.last_seq),
            skip_existing: false,
            known_ids: if resuming { state.cache.server_ids() } else { Vec::new() },
        }
    }

    // Mutations.

    /// Optimistic create: the object is visible in the cache (and observers
    /// are notified) before the server request is awaited. Returns the
    /// optimistic id.
    pub async fn create(&self, object: JsonObject) -> Result<String, ClientError> {
        self.ensure_alive()?;
        let optimistic_id = coin_optimistic_id();
        let mut local = object.clone();
        local.insert(self.id_field().to_string(), serde_json::Value::String(optimistic_id.clone()));
        {
            let mut state = self.lock_state();
            state.cache.insert_optimistic(&optimistic_id, local);
            inc_pending(&mut state, &optimistic_id);
            self.commit(state);
        }

        if !self.is_online() {
            debug!("offline: queueing create for {optimistic_id}");
            self.lock_state().queued.push_back(QueuedOp::Create { optimistic_id: optimistic_id.clone(), object });
            return Ok(optimistic_id);
        }

        match self.0.client.create(object.clone(), MutationMeta { optimistic_id: Some(optimistic_id.clone()) }).await {
            Ok(confirmed) => {
                let server_id = concave_proto::object_id(&confirmed, self.id_field())
                    .ok_or_else(|| ClientError::Decode("create response missing id".into()))?;
                {
                    let mut state = self.lock_state();
                    state.cache.record_mapping(&optimistic_id, &server_id);
                    dec_pending(&mut state, &optimistic_id);
                }
                self.flush_queued().await;
                Ok(optimistic_id)
            }
            Err(e) if e.is_retryable() => {
                debug!("create for {optimistic_id} deferred: {e}");
                self.lock_state().queued.push_back(QueuedOp::Create { optimistic_id: optimistic_id.clone(), object });
                Ok(optimistic_id)
            }
            Err(e) if e.is_auth() => {
                self.0.coordinator.on_auth_error(&e);
                self.rollback_create(&optimistic_id);
                Err(e)
            }
            Err(e) => {
                self.rollback_create(&optimistic_id);
                Err(e)
            }
        }
    }

    fn rollback_create(&self, optimistic_id: &str) {
        let mut state = self.lock_state();
        if let Some(entry_id) = state.cache.by_optimistic(optimistic_id) {
            state.cache.remove(entry_id);
        }
        dec_pending(&mut state, optimistic_id);
        self.commit(state);
    }

    /// Optimistic update: applied to the cache immediately; the server call
    /// follows (or is queued while offline / while the create is in flight).
    pub async fn update(&self, id: &str, patch: JsonObject) -> Result<(), ClientError> {
        self.ensure_alive()?;
        let (pending_key, server_target) = {
            let mut state = self.lock_state();
            let entry_id = state.cache.resolve(id).ok_or_else(|| ClientError::NotFound(id.to_string()))?;
            let entry = state.cache.get_mut(entry_id).expect("resolved entry present");
            entry.object = apply_patch(&entry.object, &patch);
            let pending_key = entry.identity.as_str().to_string();
            inc_pending(&mut state, &pending_key);

            let server_target = match state.cache.by_server(&pending_key) {
                Some(_) => Some(pending_key.clone()),
                None => state.cache.mapping_for(&pending_key).map(str::to_string),
            };
            self.commit(state);
            (pending_key, server_target)
        };

        let Some(server_id) = server_target else {
            // server identity unknown yet: sync after the create confirms
            self.lock_state().queued.push_back(QueuedOp::Update { target: pending_key, patch });
            return Ok(());
        };

        if !self.is_online() {
            self.lock_state().queued.push_back(QueuedOp::Update { target: pending_key, patch });
            return Ok(());
        }

        match self.0.client.update(&server_id, patch.clone()).await {
            Ok(confirmed) => {
                let mut state = self.lock_state();
                dec_pending(&mut state, &pending_key);
                if let Some(entry_id) = state.cache.resolve(&server_id) {
                    if let Some(entry) = state.cache.get_mut(entry_id) {
                        entry.object = merge_preserving_relations(&entry.object, &confirmed);
                    }
                }
                self.commit(state);
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                self.lock_state().queued.push_back(QueuedOp::Update { target: pending_key, patch });
                Ok(())
            }
            Err(e) => {
                let mut state = self.lock_state();
                dec_pending(&mut state, &pending_key);
                drop(state);
                if e.is_auth() {
                    self.0.coordinator.on_auth_error(&e);
                }
                Err(e)
            }
        }
    }

    /// Optimistic delete.
    pub async fn delete(&self, id: &str) -> Result<(), ClientError> {
        self.ensure_alive()?;
        let server_target = {
            let mut state = self.lock_state();
            let entry_id = state.cache.resolve(id).ok_or_else(|| ClientError::NotFound(id.to_string()))?;
            let entry = state.cache.remove(entry_id).expect("resolved entry present");
            let identity = entry.identity.as_str().to_string();

            let server_target = match &entry.identity {
                crate::cache::Identity::Server(server_id) => Some(server_id.clone()),
                crate::cache::Identity::Optimistic(optimistic_id) => state.cache.mapping_for(optimistic_id).map(str::to_string),
            };
            if server_target.is_none() {
                // unconfirmed create: cancel everything queued for it
                state.queued.retain(|op| match op {
                    QueuedOp::Create { optimistic_id, .. } => optimistic_id != &identity,
                    QueuedOp::Update { target, .. } | QueuedOp::Delete { target } => target != &identity,
                });
                state.pending.remove(&identity);
            }
            self.commit(state);
            server_target
        };

        let Some(server_id) = server_target else { return Ok(()) };

        if !self.is_online() {
            self.lock_state().queued.push_back(QueuedOp::Delete { target: server_id });
            return Ok(());
        }

        match self.0.client.delete(&server_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                self.lock_state().queued.push_back(QueuedOp::Delete { target: server_id });
                Ok(())
            }
            Err(e) => {
                if e.is_auth() {
                    self.0.coordinator.on_auth_error(&e);
                }
                Err(e)
            }
        }
    }

    /// Drain queued mutations in order. Stops (and re-queues the head) on
    /// the first transport failure.
    pub(crate) async fn flush_queued(&self) {
        let _flush = self.0.flush_lock.lock().await;
        loop {
            if self.is_destroyed() || !self.is_online() {
                return;
            }
            let Some(op) = self.lock_state().queued.pop_front() else { return };
            match op {
                QueuedOp::Create { optimistic_id, object } => {
                    match self.0.client.create(object.clone(), MutationMeta { optimistic_id: Some(optimistic_id.clone()) }).await {
                        Ok(confirmed) => {
                            let Some(server_id) = concave_proto::object_id(&confirmed, self.id_field()) else {
                                warn!("create response missing id; dropping queued create");
                                let mut state = self.lock_state();
                                dec_pending(&mut state, &optimistic_id);
                                continue;
                            };
                            let mut state = self.lock_state();
                            state.cache.record_mapping(&optimistic_id, &server_id);
                            dec_pending(&mut state, &optimistic_id);
                        }
                        Err(e) if e.is_retryable() => {
                            self.lock_state().queued.push_front(QueuedOp::Create { optimistic_id, object });
                            return;
                        }
                        Err(e) => {
                            warn!("queued create failed permanently: {e}");
                            let mut state = self.lock_state();
                            dec_pending(&mut state, &optimistic_id);
                            if let Some(entry_id) = state.cache.by_optimistic(&optimistic_id) {
                                state.cache.remove(entry_id);
                            }
                            state.error = Some(Arc::new(e));
                            self.commit(state);
                        }
                    }
                }
                QueuedOp::Update { target, patch } => {
                    let server_id = {
                        let state = self.lock_state();
                        match state.cache.by_server(&target) {
                            Some(_) => Some(target.clone()),
                            None => state.cache.mapping_for(&target).map(str::to_string),
                        }
                    };
                    let Some(server_id) = server_id else {
                        warn!("dropping queued update for {target}: no server identity");
                        let mut state = self.lock_state();
                        dec_pending(&mut state, &target);
                        continue;
                    };
                    match self.0.client.update(&server_id, patch.clone()).await {
                        Ok(confirmed) => {
                            let mut state = self.lock_state();
                            dec_pending(&mut state, &target);
                            if let Some(entry_id) = state.cache.resolve(&server_id) {
                                if let Some(entry) = state.cache.get_mut(entry_id) {
                                    entry.object = merge_preserving_relations(&entry.object, &confirmed);
                                }
                            }
                            self.commit(state);
                        }
                        Err(e) if e.is_retryable() => {
                            self.lock_state().queued.push_front(QueuedOp::Update { target, patch });
                            return;
                        }
                        Err(e) => {
                            warn!("queued update failed permanently: {e}");
                            let mut state = self.lock_state();
                            dec_pending(&mut state, &target);
                            state.error = Some(Arc::new(e));
                            self.commit(state);
                        }
                    }
                }
                QueuedOp::Delete { target } => match self.0.client.delete(&target).await {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => {
                        self.lock_state().queued.push_front(QueuedOp::Delete { target });
                        return;
                    }
                    Err(e) => {
                        warn!("queued delete failed permanently: {e}");
                        let mut state = self.lock_state();
                        state.error = Some(Arc::new(e));
                        self.commit(state);
                    }
                },
            }
        }
    }

    // Server events.

    pub(crate) fn apply_stream_event(&self, event: StreamEvent) -> Directive {
        let mut state = self.lock_state();
        let directive = match event {
            StreamEvent::Connected { .. } => Directive::None,
            StreamEvent::Existing { object, seq, .. } => {
                self.apply_server_object(&mut state, object, Some(seq), ServerEventKind::Existing);
                Directive::None
            }
            StreamEvent::Added { object, seq, meta, .. } => {
                self.apply_server_object(&mut state, object, Some(seq), ServerEventKind::Added(meta));
                Directive::None
            }
            StreamEvent::Changed { object, seq, .. } => {
                self.apply_server_object(&mut state, object, Some(seq), ServerEventKind::Changed);
                Directive::None
            }
            StreamEvent::Removed { object_id, seq, .. } => {
                state.last_seq = state.last_seq.max(seq);
                if let Some(entry_id) = state.cache.resolve(&object_id) {
                    state.cache.remove(entry_id);
                }
                Directive::None
            }
            StreamEvent::Invalidate { reason, .. } => {
                debug!("stream invalidated: {reason}; discarding server state");
                state.cache.clear_server_entries();
                state.last_seq = 0;
                Directive::Resnapshot
            }
            StreamEvent::Error { message } => {
                state.status = QueryStatus::Error;
                state.error = Some(Arc::new(ClientError::Server { status: 500, message }));
                Directive::None
            }
        };
        self.commit(state);
        directive
    }

    fn apply_server_object(&self, state: &mut QueryState, object: JsonObject, seq: Option<Seq>, kind: ServerEventKind) {
        if let Some(seq) = seq {
            state.last_seq = state.last_seq.max(seq);
        }
        let Some(server_id) = concave_proto::object_id(&object, self.id_field()) else {
            warn!("server object without {} ignored", self.id_field());
            return;
        };

        // Already installed under its server identity: merge in place.
        if let Some(entry_id) = state.cache.by_server(&server_id) {
            let entry = state.cache.get_mut(entry_id).expect("indexed entry present");
            entry.object = merge_preserving_relations(&entry.object, &object);
            return;
        }

        // Does this server id correspond to a cached optimistic entry?
        let optimistic_id = match &kind {
            ServerEventKind::Added(Some(meta)) => meta.optimistic_id.clone(),
            _ => None,
        }
        .filter(|optimistic_id| state.cache.by_optimistic(optimistic_id).is_some())
        .or_else(|| state.cache.optimistic_for(&server_id).map(str::to_string))
        .or_else(|| {
            // the host may know mappings this query never saw
            self.0
                .coordinator
                .id_mappings()
                .into_iter()
                .find(|(_, mapped_server)| mapped_server == &server_id)
                .map(|(optimistic_id, _)| optimistic_id)
                .filter(|optimistic_id| state.cache.by_optimistic(optimistic_id).is_some())
        });

        if let Some(optimistic_id) = optimistic_id {
            state.cache.record_mapping(&optimistic_id, &server_id);
            let has_pending = state.pending.get(&optimistic_id).copied().unwrap_or(0) > 0
                || self.0.coordinator.has_pending_mutations(&optimistic_id);
            match decide_replacement(has_pending) {
                Reconcile::Defer => {
                    // The user's local edits stay visible; the mapping is
                    // recorded so future server events land on this record.
                    debug!("deferred replacement of {optimistic_id} by {server_id} (pending mutations)");
                }
                Reconcile::Replace => {
                    let current =
                        state.cache.by_optimistic(&optimistic_id).and_then(|entry_id| state.cache.get(entry_id)).map(|e| e.object.clone());
                    let merged = match current {
                        Some(current) => merge_preserving_relations(&current, &object),
                        None => object,
                    };
                    state.cache.promote(&optimistic_id, &server_id, merged);
                    self.0.coordinator.on_id_remapped(&optimistic_id, &server_id);
                }
                Reconcile::Ignore => {}
            }
            return;
        }

        // Unknown id.
        match kind {
            ServerEventKind::Existing => {
                state.cache.insert_server(&server_id, object, Position::Plain);
            }
            ServerEventKind::Added(_) | ServerEventKind::Changed => match self.0.mode {
                // strict caching: server-pushed unknowns are ignored
                SubscriptionMode::Strict => {}
                SubscriptionMode::Sorted | SubscriptionMode::Live => {
                    state.cache.insert_server(&server_id, object, Position::Plain);
                }
                SubscriptionMode::Append => {
                    state.cache.insert_server(&server_id, object, Position::Appended);
                }
                SubscriptionMode::Prepend => {
                    state.cache.insert_server(&server_id, object, Position::Prepended);
                }
            },
        }
    }

    // Fetching.

    /// Refetch the first page and merge it into the cache.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        self.ensure_alive()?;
        let request = ListRequest::from_options(&self.0.options, None);
        match self.0.client.list(request).await {
            Ok(page) => {
                let mut state = self.lock_state();
                for item in page.items {
                    self.apply_server_object(&mut state, item, None, ServerEventKind::Existing);
                }
                state.next_cursor = page.next_cursor;
                if state.status == QueryStatus::Loading {
                    state.status = QueryStatus::Live;
                }
                self.commit(state);
                Ok(())
            }
            Err(e) if e.is_auth() => {
                self.0.coordinator.on_auth_error(&e);
                Ok(())
            }
            Err(e) => {
                let mut state = self.lock_state();
                state.status = QueryStatus::Error;
                state.error = Some(Arc::new(e.clone()));
                self.commit(state);
                Err(e)
            }
        }
    }

    /// Fetch the next page through the stored cursor. Returns whether more
    /// pages remain. Items merged this way are cached: later stream events
    /// for them apply even in strict mode, and mutations dispatch normally.
    pub async fn load_more(&self) -> Result<bool, ClientError> {
        self.ensure_alive()?;
        let Some(cursor) = self.lock_state().next_cursor.clone() else { return Ok(false) };
        let request = ListRequest::from_options(&self.0.options, Some(cursor));
        match self.0.client.list(request).await {
            Ok(page) => {
                let mut state = self.lock_state();
                for item in page.items {
                    self.apply_server_object(&mut state, item, None, ServerEventKind::Existing);
                }
                state.next_cursor = page.next_cursor.clone();
                self.commit(state);
                Ok(page.next_cursor.is_some())
            }
            Err(e) if e.is_auth() => {
                self.0.coordinator.on_auth_error(&e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Unsubscribe, clear listeners, drop the cache. Mutations afterwards
    /// fail with [`ClientError::Destroyed`].
    pub fn destroy(&self) {
        if self.0.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.0.pump.lock().expect("pump lock poisoned").take() {
            handle.abort();
        }
        self.0.listeners.clear();
        let mut state = self.lock_state();
        state.cache.clear();
        state.queued.clear();
        state.pending.clear();
        state.snapshot = None;
        debug!("live query on {} destroyed", self.0.options.resource);
    }
}

fn inc_pending(state: &mut QueryState, id: &str) { *state.pending.entry(id.to_string()).or_insert(0) += 1; }

fn dec_pending(state: &mut QueryState, id: &str) {
    if let Some(count) = state.pending.get_mut(id) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            state.pending.remove(id);
        }
    }
}
