use concave_proto::{HandlerId, SubscriptionId};
use thiserror::Error;

use crate::filter::FilterError;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("handler not found: {0}")]
    HandlerNotFound(HandlerId),

    #[error("handler disconnected: {0}")]
    HandlerDisconnected(HandlerId),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Failure writing to a stream sink. Either way the handler is torn down;
/// other subscribers are unaffected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,

    #[error("sink buffer overflow")]
    Overflow,
}
