use serde_json::{json, Value};

use crate::{error::DecodeError, id::SubscriptionId, JsonObject, Seq};

/// Well-known `invalidate` reasons.
pub mod reason {
    pub const LOG_TRUNCATED: &str = "log truncated";
    pub const AUTH_EXPIRED: &str = "auth expired";
}

/// Mutation metadata echoed back on server events.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimistic_id: Option<String>,
}

impl EventMeta {
    pub fn optimistic(id: impl Into<String>) -> Self { Self { optimistic_id: Some(id.into()) } }

    pub fn is_empty(&self) -> bool { self.optimistic_id.is_none() }
}

/// One event on a subscriber's stream. The variant name travels in the
/// `event:` frame header; everything else is the single-line JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Initial sink acknowledgment.
    Connected { seq: Seq },
    /// Snapshot element.
    Existing { subscription_id: SubscriptionId, object: JsonObject, seq: Seq },
    /// New object now matches the filter.
    Added { subscription_id: SubscriptionId, object: JsonObject, seq: Seq, meta: Option<EventMeta> },
    /// Existing object updated and still matches.
    Changed { subscription_id: SubscriptionId, object: JsonObject, seq: Seq, previous_object_id: Option<String> },
    /// Object no longer matches (deleted or filter-exit).
    Removed { subscription_id: SubscriptionId, object_id: String, seq: Seq },
    /// Consumer must discard state and resnapshot.
    Invalidate { subscription_id: Option<SubscriptionId>, reason: String },
    /// Best-effort terminal error before the sink closes.
    Error { message: String },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::Existing { .. } => "existing",
            StreamEvent::Added { .. } => "added",
            StreamEvent::Changed { .. } => "changed",
            StreamEvent::Removed { .. } => "removed",
            StreamEvent::Invalidate { .. } => "invalidate",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Sequence number carried by the event, if any.
    pub fn seq(&self) -> Option<Seq> {
        match self {
            StreamEvent::Connected { seq }
            | StreamEvent::Existing { seq, .. }
            | StreamEvent::Added { seq, .. }
            | StreamEvent::Changed { seq, .. }
            | StreamEvent::Removed { seq, .. } => Some(*seq),
            StreamEvent::Invalidate { .. } | StreamEvent::Error { .. } => None,
        }
    }

    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        match self {
            StreamEvent::Existing { subscription_id, .. }
            | StreamEvent::Added { subscription_id, .. }
            | StreamEvent::Changed { subscription_id, .. }
            | StreamEvent::Removed { subscription_id, .. } => Some(*subscription_id),
            StreamEvent::Invalidate { subscription_id, .. } => *subscription_id,
            StreamEvent::Connected { .. } | StreamEvent::Error { .. } => None,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            StreamEvent::Connected { seq } => json!({ "seq": seq }),
            StreamEvent::Existing { subscription_id, object, seq } => {
                json!({ "subscriptionId": subscription_id, "object": object, "seq": seq })
            }
            StreamEvent::Added { subscription_id, object, seq, meta } => {
                let mut payload = json!({ "subscriptionId": subscription_id, "object": object, "seq": seq });
                if let Some(meta) = meta {
                    if !meta.is_empty() {
                        payload["meta"] = json!(meta);
                    }
                }
                payload
            }
            StreamEvent::Changed { subscription_id, object, seq, previous_object_id } => {
                let mut payload = json!({ "subscriptionId": subscription_id, "object": object, "seq": seq });
                if let Some(prev) = previous_object_id {
                    payload["previousObjectId"] = json!(prev);
                }
                payload
            }
            StreamEvent::Removed { subscription_id, object_id, seq } => {
                json!({ "subscriptionId": subscription_id, "objectId": object_id, "seq": seq })
            }
            StreamEvent::Invalidate { subscription_id, reason } => match subscription_id {
                Some(id) => json!({ "subscriptionId": id, "reason": reason }),
                None => json!({ "reason": reason }),
            },
            StreamEvent::Error { message } => json!({ "error": message }),
        }
    }

    /// Reassemble an event from its frame name and JSON payload.
    pub fn from_wire(name: &str, payload: &Value) -> Result<Self, DecodeError> {
        match name {
            "connected" => Ok(StreamEvent::Connected { seq: require_seq(payload)? }),
            "existing" => Ok(StreamEvent::Existing {
                subscription_id: require_subscription(payload)?,
                object: require_object(payload)?,
                seq: require_seq(payload)?,
            }),
            "added" => Ok(StreamEvent::Added {
                subscription_id: require_subscription(payload)?,
                object: require_object(payload)?,
                seq: require_seq(payload)?,
                meta: match payload.get("meta") {
                    Some(meta) => Some(serde_json::from_value(meta.clone())?),
                    None => None,
                },
            }),
            "changed" => Ok(StreamEvent::Changed {
                subscription_id: require_subscription(payload)?,
                object: require_object(payload)?,
                seq: require_seq(payload)?,
                previous_object_id: payload.get("previousObjectId").and_then(Value::as_str).map(str::to_string),
            }),
            "removed" => Ok(StreamEvent::Removed {
                subscription_id: require_subscription(payload)?,
                object_id: payload
                    .get("objectId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or(DecodeError::MissingField("objectId"))?,
                seq: require_seq(payload)?,
            }),
            "invalidate" => Ok(StreamEvent::Invalidate {
                subscription_id: match payload.get("subscriptionId") {
                    Some(id) => Some(serde_json::from_value(id.clone())?),
                    None => None,
                },
                reason: payload.get("reason").and_then(Value::as_str).unwrap_or_default().to_string(),
            }),
            "error" => {
                Ok(StreamEvent::Error { message: payload.get("error").and_then(Value::as_str).unwrap_or_default().to_string() })
            }
            other => Err(DecodeError::UnknownEvent(other.to_string())),
        }
    }
}

fn require_seq(payload: &Value) -> Result<Seq, DecodeError> {
    payload.get("seq").and_then(Value::as_u64).ok_or(DecodeError::MissingField("seq"))
}

fn require_subscription(payload: &Value) -> Result<SubscriptionId, DecodeError> {
    let id = payload.get("subscriptionId").ok_or(DecodeError::MissingField("subscriptionId"))?;
    Ok(serde_json::from_value(id.clone())?)
}

fn require_object(payload: &Value) -> Result<JsonObject, DecodeError> {
    match payload.get("object") {
        Some(Value::Object(map)) => Ok(map.clone()),
        _ => Err(DecodeError::MissingField("object")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(id: &str) -> JsonObject {
        let mut map = JsonObject::new();
        map.insert("id".into(), json!(id));
        map
    }

    #[test]
    fn wire_round_trip() {
        let sub = SubscriptionId::new();
        let events = vec![
            StreamEvent::Connected { seq: 5 },
            StreamEvent::Existing { subscription_id: sub, object: object("a"), seq: 6 },
            StreamEvent::Added { subscription_id: sub, object: object("b"), seq: 7, meta: Some(EventMeta::optimistic("opt_1")) },
            StreamEvent::Changed { subscription_id: sub, object: object("b"), seq: 8, previous_object_id: Some("b0".into()) },
            StreamEvent::Removed { subscription_id: sub, object_id: "b".into(), seq: 9 },
            StreamEvent::Invalidate { subscription_id: Some(sub), reason: reason::LOG_TRUNCATED.into() },
            StreamEvent::Error { message: "write failed".into() },
        ];
        for event in events {
            let back = StreamEvent::from_wire(event.name(), &event.payload()).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn added_without_meta_omits_field() {
        let event = StreamEvent::Added { subscription_id: SubscriptionId::new(), object: object("x"), seq: 1, meta: None };
        assert!(event.payload().get("meta").is_none());
        // An empty meta is also elided rather than serialized as {}.
        let event = StreamEvent::Added { subscription_id: SubscriptionId::new(), object: object("x"), seq: 1, meta: Some(EventMeta::default()) };
        assert!(event.payload().get("meta").is_none());
    }

    #[test]
    fn unknown_event_is_an_error() {
        assert!(matches!(StreamEvent::from_wire("nonsense", &json!({})), Err(DecodeError::UnknownEvent(_))));
    }
}
