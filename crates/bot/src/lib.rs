pub mod checkpoint;
pub mod metrics;
pub mod notifier;
pub mod watcher;

pub use checkpoint::{CheckpointIOError, CheckpointStore};
pub use notifier::{AlertDispatcher, AlertOutcome, TelegramNotifier};
pub use watcher::{launch, ChainWatcher, ClonePipeline, WatcherError};
