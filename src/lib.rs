// Library crate - market data sync, daily metrics and leaderboards

pub mod catalog;
pub mod config;
pub mod freshness;
pub mod leaderboard;
pub mod metrics;
pub mod query;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use scheduler::{PipelineRun, RunSummary};
pub use store::{FileStore, MemoryStore, Store};
pub use types::*;
