//! The live subscription bus: per-subscriber filtered event delivery over
//! long-lived stream sinks, with catch-up, reconnect, relevance tracking
//! and authorization re-checks.

mod handler;
mod subscription;

pub use subscription::SubscriptionSpec;

use chrono::Utc;
use concave_kv::SharedKv;
use concave_proto::{
    event::reason, ChangeEntry, ChangeKind, EventMeta, HandlerId, JsonObject, Seq, StreamEvent, SubscriptionId,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, warn};

use crate::{
    changelog::{Changelog, NewChange},
    error::SubscriptionError,
    filter::FilterEngine,
    sink::EventSink,
};

use self::{handler::Handler, subscription::Subscription};

struct BusState {
    handlers: HashMap<HandlerId, Handler>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    by_resource: HashMap<String, Vec<SubscriptionId>>,
}

struct BusInner {
    changelog: Arc<Changelog>,
    state: std::sync::Mutex<BusState>,
    /// Serializes push invocations so events on any one subscription are
    /// strictly ordered by seq. Deliveries to distinct subscriptions
    /// remain isolated from each other's failures.
    notify_lock: tokio::sync::Mutex<()>,
}

/// Outcome of one delivery attempt to a subscription's sink.
enum Delivery {
    Delivered,
    AuthExpired,
    SinkFailed,
}

/// Teardown work accumulated during a fan-out pass and applied after it.
#[derive(Default)]
struct FanOutScratch {
    failed_handlers: HashSet<HandlerId>,
    expired_subscriptions: HashSet<SubscriptionId>,
}

pub struct SubscriptionBus(Arc<BusInner>);

impl Clone for SubscriptionBus {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl SubscriptionBus {
    pub fn new(changelog: Arc<Changelog>) -> Self {
        Self(Arc::new(BusInner {
            changelog,
            state: std::sync::Mutex::new(BusState {
                handlers: HashMap::new(),
                subscriptions: HashMap::new(),
                by_resource: HashMap::new(),
            }),
            notify_lock: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn changelog(&self) -> &Arc<Changelog> { &self.0.changelog }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BusState> { self.0.state.lock().expect("bus state lock poisoned") }

    /// Attach a stream sink under `handler_id` and acknowledge it with a
    /// `connected` event. Re-registering an id after a disconnect installs
    /// the fresh sink; the client re-subscribes with `resume_from`.
    pub fn register_handler(&self, handler_id: HandlerId, sink: Arc<dyn EventSink>) {
        {
            let mut state = self.lock_state();
            state.handlers.insert(handler_id, Handler::new(handler_id, sink.clone()));
        }
        debug!("handler {handler_id} registered");
        if let Err(e) = sink.send(StreamEvent::Connected { seq: self.0.changelog.current_seq() }) {
            warn!("handler {handler_id} failed initial acknowledgment: {e}");
            self.teardown_handler(handler_id, &e.to_string());
        }
    }

    /// Detach a handler and delete all its subscriptions. Must be called
    /// when the sink closes even if other handlers remain active; safe to
    /// call when the handler is already gone.
    pub fn unregister_handler(&self, handler_id: HandlerId) {
        let mut state = self.lock_state();
        let Some(handler) = state.handlers.remove(&handler_id) else { return };
        for sub_id in handler.subscriptions {
            remove_subscription_locked(&mut state, sub_id);
        }
        debug!("handler {handler_id} unregistered");
    }

    pub fn create_subscription(&self, engine: &dyn FilterEngine, spec: SubscriptionSpec) -> Result<SubscriptionId, SubscriptionError> {
        let filter = engine.compile(&spec.filter)?;
        let scope = spec.scope_filter.as_deref().map(|source| engine.compile(source)).transpose()?;
        let subscription = Subscription::new(&spec, filter, scope);
        let id = subscription.id;

        let mut state = self.lock_state();
        let handler = state.handlers.get_mut(&spec.handler_id).ok_or(SubscriptionError::HandlerNotFound(spec.handler_id))?;
        if !handler.connected {
            return Err(SubscriptionError::HandlerDisconnected(spec.handler_id));
        }
        handler.subscriptions.insert(id);
        state.by_resource.entry(spec.resource.clone()).or_default().push(id);
        state.subscriptions.insert(id, subscription);
        debug!("subscription {id} created on {} for handler {}", spec.resource, spec.handler_id);
        Ok(id)
    }

    pub fn remove_subscription(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock_state();
        let removed = remove_subscription_locked(&mut state, id);
        if let Some(sub) = &removed {
            if let Some(handler) = state.handlers.get_mut(&sub.handler_id) {
                handler.subscriptions.remove(&id);
            }
        }
        removed.is_some()
    }

    /// Deliver the initial snapshot: each item as `existing`, its id entering
    /// the relevance set. Items the client declared as known (or the whole
    /// snapshot under `skip_existing`) enter the relevance set silently.
    pub fn send_existing_items(&self, id: SubscriptionId, items: Vec<JsonObject>, id_field: &str) -> Result<(), SubscriptionError> {
        let (subscription, sink) = {
            let state = self.lock_state();
            let subscription = state.subscriptions.get(&id).ok_or(SubscriptionError::SubscriptionNotFound(id))?.clone();
            let handler =
                state.handlers.get(&subscription.handler_id).ok_or(SubscriptionError::HandlerNotFound(subscription.handler_id))?;
            (subscription, handler.sink.clone())
        };

        let seq = self.0.changelog.current_seq();
        let mut scratch = FanOutScratch::default();
        for object in items {
            let Some(object_id) = concave_proto::object_id(&object, id_field) else {
                warn!("snapshot item without {id_field} ignored on subscription {id}");
                continue;
            };
            let silent = subscription.skip_existing || subscription.known_ids.contains(&object_id);
            {
                let mut sub_state = subscription.lock_state();
                sub_state.relevant.insert(object_id);
                sub_state.last_seq = sub_state.last_seq.max(seq);
            }
            if silent {
                continue;
            }
            let event = StreamEvent::Existing { subscription_id: id, object, seq };
            match self.deliver(&subscription, &sink, event, seq) {
                Delivery::Delivered => {}
                Delivery::AuthExpired => {
                    scratch.expired_subscriptions.insert(id);
                    break;
                }
                Delivery::SinkFailed => {
                    scratch.failed_handlers.insert(subscription.handler_id);
                    break;
                }
            }
        }
        self.apply_scratch(scratch);
        Ok(())
    }

    /// Record creations in the changelog and fan them out to matching
    /// subscriptions as `added`.
    pub async fn push_inserts(&self, resource: &str, items: Vec<JsonObject>, id_field: &str) {
        self.push_inserts_with_meta(resource, items.into_iter().map(|object| (object, None)).collect(), id_field).await
    }

    /// Variant carrying mutation metadata (the creator's optimistic id) to
    /// echo on the `added` event.
    pub async fn push_inserts_with_meta(&self, resource: &str, items: Vec<(JsonObject, Option<EventMeta>)>, id_field: &str) {
        let _ordering = self.0.notify_lock.lock().await;
        let mut scratch = FanOutScratch::default();
        for (object, meta) in items {
            let Some(object_id) = concave_proto::object_id(&object, id_field) else {
                warn!("insert without {id_field} ignored on {resource}");
                continue;
            };
            let seq = self.0.changelog.append(NewChange::create(resource, &object_id, object.clone())).await;
            let targets = self.targets(resource);
            self.fan_out(&targets, seq, ChangeKind::Create, &object_id, Some(&object), None, meta.as_ref(), id_field, &mut scratch);
        }
        self.apply_scratch(scratch);
    }

    /// Record updates and fan them out by the was/now relevance table.
    pub async fn push_updates(
        &self,
        resource: &str,
        items: Vec<JsonObject>,
        id_field: &str,
        previous_by_id: Option<&HashMap<String, JsonObject>>,
    ) {
        let _ordering = self.0.notify_lock.lock().await;
        let mut scratch = FanOutScratch::default();
        for object in items {
            let Some(object_id) = concave_proto::object_id(&object, id_field) else {
                warn!("update without {id_field} ignored on {resource}");
                continue;
            };
            let previous = previous_by_id.and_then(|map| map.get(&object_id)).cloned();
            let seq = self.0.changelog.append(NewChange::update(resource, &object_id, object.clone(), previous.clone())).await;
            let targets = self.targets(resource);
            self.fan_out(&targets, seq, ChangeKind::Update, &object_id, Some(&object), previous.as_ref(), None, id_field, &mut scratch);
        }
        self.apply_scratch(scratch);
    }

    /// Record deletions; `removed` is emitted only to subscriptions that
    /// held the object in their relevance set.
    pub async fn push_deletes(&self, resource: &str, ids: &[String]) {
        let _ordering = self.0.notify_lock.lock().await;
        let mut scratch = FanOutScratch::default();
        for object_id in ids {
            let seq = self.0.changelog.append(NewChange::delete(resource, object_id)).await;
            let targets = self.targets(resource);
            self.fan_out(&targets, seq, ChangeKind::Delete, object_id, None, None, None, "id", &mut scratch);
        }
        self.apply_scratch(scratch);
    }

    /// Replay changelog entries (typically announced by a sibling process)
    /// to subscriptions that have not seen them yet.
    pub async fn process_changelog_entries(&self, entries: &[ChangeEntry], id_field: &str) {
        let _ordering = self.0.notify_lock.lock().await;
        let mut scratch = FanOutScratch::default();
        for entry in entries {
            let targets = self.targets(&entry.resource);
            self.fan_out(
                &targets,
                entry.seq,
                entry.kind,
                &entry.object_id,
                entry.object.as_ref(),
                entry.previous_object.as_ref(),
                None,
                id_field,
                &mut scratch,
            );
        }
        self.apply_scratch(scratch);
    }

    /// Catch-up for a reconnecting subscriber. `None` signals that the log
    /// has truncated past the cursor and the consumer must be invalidated.
    pub fn get_catchup_events(&self, id: SubscriptionId, since: Seq) -> Result<Option<Vec<StreamEvent>>, SubscriptionError> {
        let subscription = {
            let state = self.lock_state();
            state.subscriptions.get(&id).ok_or(SubscriptionError::SubscriptionNotFound(id))?.clone()
        };

        if subscription.auth_expired(Utc::now()) {
            self.remove_subscription(id);
            return Ok(Some(vec![StreamEvent::Invalidate { subscription_id: Some(id), reason: reason::AUTH_EXPIRED.into() }]));
        }

        if self.0.changelog.needs_invalidation(since) {
            return Ok(None);
        }

        let entries = self.0.changelog.get_since(Some(&subscription.resource), since);
        let mut events = Vec::new();
        for entry in entries {
            let mut sub_state = subscription.lock_state();
            if sub_state.last_seq >= entry.seq {
                continue;
            }
            if let Some(event) = evaluate_entry(
                &subscription,
                &mut sub_state,
                id,
                entry.seq,
                entry.kind,
                &entry.object_id,
                entry.object.as_ref(),
                entry.previous_object.as_ref(),
                None,
                "id",
            ) {
                sub_state.last_seq = entry.seq;
                events.push(event);
            }
        }
        Ok(Some(events))
    }

    /// Tear down every subscription whose credentials have lapsed.
    pub fn sweep_expired_auth(&self) {
        let now = Utc::now();
        let expired: Vec<(Subscription, Option<Arc<dyn EventSink>>)> = {
            let state = self.lock_state();
            state
                .subscriptions
                .values()
                .filter(|sub| sub.auth_expired(now))
                .map(|sub| (sub.clone(), state.handlers.get(&sub.handler_id).map(|h| h.sink.clone())))
                .collect()
        };
        for (subscription, sink) in expired {
            debug!("subscription {} auth expired, tearing down", subscription.id);
            if let Some(sink) = sink {
                let _ = sink.send(StreamEvent::Invalidate {
                    subscription_id: Some(subscription.id),
                    reason: reason::AUTH_EXPIRED.into(),
                });
            }
            self.remove_subscription(subscription.id);
        }
    }

    /// Periodic sweeper so a quiet subscription cannot outlive its
    /// credentials. Abort the returned handle to stop it.
    pub fn spawn_auth_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                bus.sweep_expired_auth();
            }
        })
    }

    /// Consume changelog announcements from the KV channel and replay them
    /// locally (bus wake-up for entries appended by sibling processes).
    pub fn spawn_changelog_listener(&self, kv: SharedKv, id_field: String) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        let channel = self.0.changelog.notify_channel().to_string();
        tokio::spawn(async move {
            let mut receiver = match kv.subscribe(&channel).await {
                Ok(receiver) => receiver,
                Err(e) => {
                    warn!("changelog listener could not subscribe: {e}");
                    return;
                }
            };
            while let Some(message) = receiver.rx.recv().await {
                match serde_json::from_str::<ChangeEntry>(&message) {
                    Ok(entry) => bus.process_changelog_entries(&[entry], &id_field).await,
                    Err(e) => warn!("ignoring malformed changelog announcement: {e}"),
                }
            }
        })
    }

    // Introspection, used by operators and tests.

    pub fn handler_count(&self) -> usize { self.lock_state().handlers.len() }

    pub fn subscription_count(&self) -> usize { self.lock_state().subscriptions.len() }

    pub fn subscription_last_seq(&self, id: SubscriptionId) -> Option<Seq> {
        self.lock_state().subscriptions.get(&id).map(|sub| sub.last_seq())
    }

    pub fn relevant_object_ids(&self, id: SubscriptionId) -> Option<Vec<String>> {
        self.lock_state().subscriptions.get(&id).map(|sub| sub.lock_state().relevant.iter().cloned().collect())
    }

    // Internals.

    fn targets(&self, resource: &str) -> Vec<(Subscription, Arc<dyn EventSink>)> {
        let state = self.lock_state();
        let Some(ids) = state.by_resource.get(resource) else { return Vec::new() };
        ids.iter()
            .filter_map(|id| {
                let subscription = state.subscriptions.get(id)?;
                let handler = state.handlers.get(&subscription.handler_id)?;
                handler.connected.then(|| (subscription.clone(), handler.sink.clone()))
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn fan_out(
        &self,
        targets: &[(Subscription, Arc<dyn EventSink>)],
        seq: Seq,
        kind: ChangeKind,
        object_id: &str,
        object: Option<&JsonObject>,
        previous_object: Option<&JsonObject>,
        meta: Option<&EventMeta>,
        id_field: &str,
        scratch: &mut FanOutScratch,
    ) {
        for (subscription, sink) in targets {
            if scratch.failed_handlers.contains(&subscription.handler_id) || scratch.expired_subscriptions.contains(&subscription.id) {
                continue;
            }

            let event = {
                let mut sub_state = subscription.lock_state();
                if sub_state.last_seq >= seq {
                    continue; // already delivered (replay path)
                }
                match evaluate_entry(
                    subscription,
                    &mut sub_state,
                    subscription.id,
                    seq,
                    kind,
                    object_id,
                    object,
                    previous_object,
                    meta,
                    id_field,
                ) {
                    Some(event) => event,
                    None => continue,
                }
            };

            match self.deliver(subscription, sink, event, seq) {
                Delivery::Delivered => {}
                Delivery::AuthExpired => {
                    scratch.expired_subscriptions.insert(subscription.id);
                }
                Delivery::SinkFailed => {
                    scratch.failed_handlers.insert(subscription.handler_id);
                }
            }
        }
    }

    fn deliver(&self, subscription: &Subscription, sink: &Arc<dyn EventSink>, event: StreamEvent, seq: Seq) -> Delivery {
        if subscription.auth_expired(Utc::now()) {
            let _ = sink.send(StreamEvent::Invalidate { subscription_id: Some(subscription.id), reason: reason::AUTH_EXPIRED.into() });
            return Delivery::AuthExpired;
        }
        match sink.send(event) {
            Ok(()) => {
                let mut sub_state = subscription.lock_state();
                sub_state.last_seq = sub_state.last_seq.max(seq);
                Delivery::Delivered
            }
            Err(e) => {
                warn!("delivery to subscription {} failed: {e}", subscription.id);
                Delivery::SinkFailed
            }
        }
    }

    fn apply_scratch(&self, scratch: FanOutScratch) {
        for id in scratch.expired_subscriptions {
            self.remove_subscription(id);
        }
        for handler_id in scratch.failed_handlers {
            self.teardown_handler(handler_id, "stream write failed");
        }
    }

    /// A sink write failed: mark the handler disconnected, emit a
    /// best-effort error event, close the sink and delete its
    /// subscriptions. Other subscribers are unaffected.
    fn teardown_handler(&self, handler_id: HandlerId, message: &str) {
        let (sink, sub_ids) = {
            let mut state = self.lock_state();
            let Some(handler) = state.handlers.get_mut(&handler_id) else { return };
            handler.connected = false;
            let sub_ids: Vec<SubscriptionId> = handler.subscriptions.drain().collect();
            let sink = handler.sink.clone();
            for sub_id in &sub_ids {
                remove_subscription_locked(&mut state, *sub_id);
            }
            (sink, sub_ids)
        };
        let _ = sink.send(StreamEvent::Error { message: message.to_string() });
        sink.close();
        debug!("handler {handler_id} torn down, {} subscriptions removed", sub_ids.len());
    }
}

fn remove_subscription_locked(state: &mut BusState, id: SubscriptionId) -> Option<Subscription> {
    let subscription = state.subscriptions.remove(&id)?;
    if let Some(ids) = state.by_resource.get_mut(&subscription.resource) {
        ids.retain(|sub_id| *sub_id != id);
        if ids.is_empty() {
            state.by_resource.remove(&subscription.resource);
        }
    }
    Some(subscription)
}

/// The update-semantics table. Combines whether the object *was* relevant
/// with whether it *is now* matched, producing the event to emit (if any)
/// and maintaining the relevance set.
#[allow(clippy::too_many_arguments)]
fn evaluate_entry(
    subscription: &Subscription,
    sub_state: &mut subscription::SubState,
    subscription_id: SubscriptionId,
    seq: Seq,
    kind: ChangeKind,
    object_id: &str,
    object: Option<&JsonObject>,
    previous_object: Option<&JsonObject>,
    meta: Option<&EventMeta>,
    id_field: &str,
) -> Option<StreamEvent> {
    match kind {
        ChangeKind::Create => {
            let object = object?;
            if !subscription.matches(object) {
                return None;
            }
            sub_state.relevant.insert(object_id.to_string());
            Some(StreamEvent::Added { subscription_id, object: object.clone(), seq, meta: meta.cloned() })
        }
        ChangeKind::Update => {
            let object = object?;
            // An id change shows up as a differing id on the pre-image.
            let previous_id = previous_object
                .and_then(|prev| concave_proto::object_id(prev, id_field))
                .filter(|prev_id| prev_id != object_id);

            let was = sub_state.relevant.contains(object_id)
                || previous_id.as_ref().map_or(false, |prev_id| sub_state.relevant.contains(prev_id));
            let now = subscription.matches(object);

            if let Some(prev_id) = &previous_id {
                sub_state.relevant.remove(prev_id);
            }

            match (was, now) {
                (false, false) => None,
                (false, true) => {
                    sub_state.relevant.insert(object_id.to_string());
                    Some(StreamEvent::Added { subscription_id, object: object.clone(), seq, meta: meta.cloned() })
                }
                (true, true) => {
                    sub_state.relevant.insert(object_id.to_string());
                    Some(StreamEvent::Changed { subscription_id, object: object.clone(), seq, previous_object_id: previous_id })
                }
                (true, false) => {
                    sub_state.relevant.remove(object_id);
                    Some(StreamEvent::Removed { subscription_id, object_id: object_id.to_string(), seq })
                }
            }
        }
        ChangeKind::Delete => {
            if sub_state.relevant.remove(object_id) {
                Some(StreamEvent::Removed { subscription_id, object_id: object_id.to_string(), seq })
            } else {
                None // never relevant: a no-op
            }
        }
    }
}
