//! Client-side live query: reconciles an optimistic local cache against
//! authoritative server events without creating ghost duplicates and
//! without clobbering locally-pending edits.

mod cache;
mod connection;
mod observe;
mod reconcile;
mod view;

pub mod client;
pub mod coordinator;
pub mod error;
pub mod livequery;
pub mod options;

pub use client::{EventStream, ListRequest, MutationMeta, Page, ResourceClient};
pub use coordinator::{Coordinator, NoopCoordinator};
pub use error::ClientError;
pub use livequery::{LiveQuery, QueryStatus, Snapshot};
pub use observe::ListenerGuard;
pub use options::{LiveQueryOptions, OrderBy, SortDirection, SubscriptionMode};

/// Host network-online signal consumed by the connection pump. The host
/// flips the sender as connectivity changes.
pub fn online_channel(initially_online: bool) -> (tokio::sync::watch::Sender<bool>, tokio::sync::watch::Receiver<bool>) {
    tokio::sync::watch::channel(initially_online)
}
