pub mod bus;
pub mod changelog;
pub mod error;
pub mod filter;
pub mod sink;

pub use bus::{SubscriptionBus, SubscriptionSpec};
pub use changelog::{Changelog, ChangelogConfig, NewChange};
pub use error::{SinkError, SubscriptionError};
pub use filter::{CompiledFilter, FilterEngine, FilterError};
pub use sink::{ChannelSink, EventSink};
