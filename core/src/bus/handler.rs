use concave_proto::{HandlerId, SubscriptionId};
use std::{collections::HashSet, sync::Arc};

use crate::sink::EventSink;

/// A long-lived stream sink. One handler may carry many subscriptions;
/// when the sink ends, all of them are deleted.
pub(crate) struct Handler {
    pub id: HandlerId,
    pub sink: Arc<dyn EventSink>,
    pub connected: bool,
    pub subscriptions: HashSet<SubscriptionId>,
}

impl Handler {
    pub(crate) fn new(id: HandlerId, sink: Arc<dyn EventSink>) -> Self {
        Self { id, sink, connected: true, subscriptions: HashSet::new() }
    }
}
