//! Test harness: an in-process "server" (authoritative store + changelog +
//! subscription bus) and a `ResourceClient` implementation wired to it, so
//! live queries run against the real event pipeline end to end.

use async_trait::async_trait;
use concave_client::{ClientError, EventStream, ListRequest, MutationMeta, Page, ResourceClient};
use concave_core::{
    changelog::{Changelog, ChangelogConfig},
    filter::JsonFieldEngine,
    sink::ChannelSink,
    EventSink, SubscriptionBus, SubscriptionSpec,
};
use concave_proto::{EventMeta, HandlerId, JsonObject, StreamEvent, SubscribeOptions};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;

pub struct TestServer {
    pub bus: SubscriptionBus,
    objects: Mutex<HashMap<String, Vec<JsonObject>>>,
    next_id: AtomicU64,
}

impl TestServer {
    pub fn new() -> Arc<Self> { Self::with_retention(1024) }

    pub fn with_retention(max_entries: usize) -> Arc<Self> {
        let changelog = Arc::new(Changelog::new(ChangelogConfig::with_max_entries(max_entries)));
        Arc::new(Self { bus: SubscriptionBus::new(changelog), objects: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) })
    }

    pub fn client(self: &Arc<Self>, resource: &str) -> ServerBackedClient {
        ServerBackedClient {
            server: self.clone(),
            resource: resource.to_string(),
            handler_id: HandlerId::new(),
            active_sink: Mutex::new(None),
        }
    }

    fn snapshot(&self, resource: &str) -> Vec<JsonObject> {
        self.objects.lock().unwrap().get(resource).cloned().unwrap_or_default()
    }

    pub async fn seed(self: &Arc<Self>, resource: &str, object: JsonObject) -> String {
        let id = format!("srv_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut stored = object;
        stored.insert("id".to_string(), serde_json::Value::String(id.clone()));
        self.objects.lock().unwrap().entry(resource.to_string()).or_default().push(stored.clone());
        self.bus.push_inserts(resource, vec![stored], "id").await;
        id
    }

    pub async fn server_update(self: &Arc<Self>, resource: &str, id: &str, patch: JsonObject) {
        let (updated, previous) = {
            let mut objects = self.objects.lock().unwrap();
            let list = objects.entry(resource.to_string()).or_default();
            let Some(object) = list.iter_mut().find(|o| o.get("id").and_then(|v| v.as_str()) == Some(id)) else { return };
            let previous = object.clone();
            for (key, value) in patch {
                object.insert(key, value);
            }
            (object.clone(), previous)
        };
        let previous_by_id = HashMap::from([(id.to_string(), previous)]);
        self.bus.push_updates(resource, vec![updated], "id", Some(&previous_by_id)).await;
    }

    pub async fn server_delete(self: &Arc<Self>, resource: &str, id: &str) {
        self.objects
            .lock()
            .unwrap()
            .entry(resource.to_string())
            .or_default()
            .retain(|o| o.get("id").and_then(|v| v.as_str()) != Some(id));
        self.bus.push_deletes(resource, &[id.to_string()]).await;
    }
}

/// A `ResourceClient` whose transport is the in-process bus. One instance
/// models one browser tab: a single handler id, re-registered with a fresh
/// sink on every (re)subscribe.
pub struct ServerBackedClient {
    server: Arc<TestServer>,
    resource: String,
    handler_id: HandlerId,
    active_sink: Mutex<Option<Arc<ChannelSink>>>,
}

impl ServerBackedClient {
    /// Kill the current stream, as if the connection dropped. The client's
    /// pump will reconnect with `resume_from`.
    pub fn drop_stream(&self) {
        self.server.bus.unregister_handler(self.handler_id);
        if let Some(sink) = self.active_sink.lock().unwrap().take() {
            sink.close();
        }
    }
}

#[async_trait]
impl ResourceClient for ServerBackedClient {
    async fn list(&self, _request: ListRequest) -> Result<Page, ClientError> {
        Ok(Page { items: self.server.snapshot(&self.resource), next_cursor: None })
    }

    async fn create(&self, object: JsonObject, meta: MutationMeta) -> Result<JsonObject, ClientError> {
        let id = format!("srv_{}", self.server.next_id.fetch_add(1, Ordering::SeqCst));
        let mut stored = object;
        stored.insert("id".to_string(), serde_json::Value::String(id));
        self.server.objects.lock().unwrap().entry(self.resource.clone()).or_default().push(stored.clone());

        let event_meta = meta.optimistic_id.map(EventMeta::optimistic);
        self.server.bus.push_inserts_with_meta(&self.resource, vec![(stored.clone(), event_meta)], "id").await;
        Ok(stored)
    }

    async fn update(&self, id: &str, patch: JsonObject) -> Result<JsonObject, ClientError> {
        let (updated, previous) = {
            let mut objects = self.server.objects.lock().unwrap();
            let list = objects.entry(self.resource.clone()).or_default();
            let object = list
                .iter_mut()
                .find(|o| o.get("id").and_then(|v| v.as_str()) == Some(id))
                .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
            let previous = object.clone();
            for (key, value) in patch {
                object.insert(key, value);
            }
            (object.clone(), previous)
        };
        let previous_by_id = HashMap::from([(id.to_string(), previous)]);
        self.server.bus.push_updates(&self.resource, vec![updated.clone()], "id", Some(&previous_by_id)).await;
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<(), ClientError> {
        self.server
            .objects
            .lock()
            .unwrap()
            .entry(self.resource.clone())
            .or_default()
            .retain(|o| o.get("id").and_then(|v| v.as_str()) != Some(id));
        self.server.bus.push_deletes(&self.resource, &[id.to_string()]).await;
        Ok(())
    }

    async fn subscribe(&self, options: SubscribeOptions) -> Result<EventStream, ClientError> {
        let (sink, mut sink_rx) = ChannelSink::pair(256);
        self.server.bus.register_handler(self.handler_id, sink.clone());
        *self.active_sink.lock().unwrap() = Some(sink);

        let mut spec = SubscriptionSpec::new(
            self.resource.clone(),
            options.filter.clone().unwrap_or_else(|| "*".to_string()),
            self.handler_id,
            "test-user",
        );
        spec.skip_existing = options.skip_existing;
        spec.known_ids = options.known_ids.clone();
        let sub_id = self
            .server
            .bus
            .create_subscription(&JsonFieldEngine, spec)
            .map_err(|e| ClientError::Server { status: 500, message: e.to_string() })?;

        let sink = self.active_sink.lock().unwrap().clone().expect("sink installed above");
        match options.resume_from {
            Some(since) => match self.server.bus.get_catchup_events(sub_id, since) {
                Ok(Some(events)) => {
                    for event in events {
                        let _ = sink.send(event);
                    }
                }
                Ok(None) => {
                    let _ = sink.send(StreamEvent::Invalidate {
                        subscription_id: Some(sub_id),
                        reason: concave_proto::event::reason::LOG_TRUNCATED.into(),
                    });
                }
                Err(e) => return Err(ClientError::Server { status: 500, message: e.to_string() }),
            },
            None => {
                let items = self.server.snapshot(&self.resource);
                self.server
                    .bus
                    .send_existing_items(sub_id, items, "id")
                    .map_err(|e| ClientError::Server { status: 500, message: e.to_string() })?;
            }
        }

        // forward sink events to the client stream
        let (out_tx, out_rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(event) = sink_rx.recv().await {
                if out_tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(out_rx)
    }
}

pub fn object(value: serde_json::Value) -> JsonObject {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}
