pub mod completion;
pub mod config;
pub mod deferred_delete;
pub mod errors;
pub mod protocol;

pub use completion::CompletionAggregator;
pub use config::LeaseConfig;
pub use deferred_delete::DeferredDeleteSweeper;
pub use errors::CommandFeedError;
pub use protocol::{CheckpointParams, CheckpointResponse, CommandFeed};
