//! The seam to the transport layer. The live query drives everything
//! through this trait; the HTTP client (out of scope here) implements it.

use async_trait::async_trait;
use concave_proto::{JsonObject, StreamEvent, SubscribeOptions};

use crate::{
    error::ClientError,
    options::{OrderBy, SortDirection},
};

/// Stream of server events for one subscription. A closed channel means
/// the stream disconnected; the pump reconnects with `resume_from`.
pub type EventStream = tokio::sync::mpsc::Receiver<StreamEvent>;

#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub filter: Option<String>,
    pub include: Vec<String>,
    pub order_by: Vec<(String, bool)>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

impl ListRequest {
    pub(crate) fn from_options(options: &crate::options::LiveQueryOptions, cursor: Option<String>) -> Self {
        Self {
            filter: options.filter.clone(),
            include: options.include.clone(),
            order_by: options
                .order_by
                .iter()
                .map(|OrderBy { field, direction }| (field.clone(), *direction == SortDirection::Desc))
                .collect(),
            limit: options.limit,
            cursor,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<JsonObject>,
    pub next_cursor: Option<String>,
}

/// Metadata attached to a create so the server can echo the client's
/// optimistic id back on the resulting `added` event.
#[derive(Debug, Clone, Default)]
pub struct MutationMeta {
    pub optimistic_id: Option<String>,
}

#[async_trait]
pub trait ResourceClient: Send + Sync + 'static {
    async fn list(&self, request: ListRequest) -> Result<Page, ClientError>;

    /// Create an object; the response is the authoritative record with its
    /// server-assigned id.
    async fn create(&self, object: JsonObject, meta: MutationMeta) -> Result<JsonObject, ClientError>;

    async fn update(&self, id: &str, patch: JsonObject) -> Result<JsonObject, ClientError>;

    async fn delete(&self, id: &str) -> Result<(), ClientError>;

    async fn subscribe(&self, options: SubscribeOptions) -> Result<EventStream, ClientError>;
}
