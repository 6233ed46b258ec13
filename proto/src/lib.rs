pub mod change;
pub mod error;
pub mod event;
pub mod framing;
pub mod id;
pub mod subscribe;

pub use change::{ChangeEntry, ChangeKind, Seq};
pub use error::DecodeError;
pub use event::{reason, EventMeta, StreamEvent};
pub use framing::{write_frame, FrameDecoder};
pub use id::{HandlerId, ScheduleId, SubscriptionId, TaskId, WorkerId};
pub use subscribe::SubscribeOptions;

/// An opaque resource record as it travels on the wire.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Extract the object id from a record, given the id field name.
pub fn object_id(object: &JsonObject, id_field: &str) -> Option<String> {
    match object.get(id_field)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
