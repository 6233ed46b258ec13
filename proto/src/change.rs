use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JsonObject;

/// Global sequence number. Dense and strictly increasing across all
/// resources; the unit of ordering for every delivered event.
pub type Seq = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Create => write!(f, "create"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// One entry in the append-only changelog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub seq: Seq,
    pub resource: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub object_id: String,
    /// Absent for deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<JsonObject>,
    /// Pre-image for updates, when the caller supplies one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_object: Option<JsonObject>,
    pub timestamp: DateTime<Utc>,
}
