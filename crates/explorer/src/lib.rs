pub mod bundle;
pub mod source;

pub use bundle::{normalize, SourcePayload};
pub use source::{ExplorerResponse, SourceFetcher, SourceUnavailableError};
