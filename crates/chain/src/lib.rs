pub mod channel;
pub mod client;
pub mod detector;
pub mod heads;
pub mod metrics;
pub mod reconnect;

pub use channel::TrackedReceiver;
pub use client::NodeClient;
pub use detector::{BlockFetchError, ContractDetector, ReceiptLookupError};
pub use heads::{FeedEvent, NewHeadStream};
pub use metrics::FeedMetrics;
pub use reconnect::{FeedError, FeedErrorKind, ReconnectConfig, ReconnectSupervisor};
