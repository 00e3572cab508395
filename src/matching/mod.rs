pub mod committer;
pub mod index;
pub mod matcher;
pub mod normalizer;
pub mod orchestrator;
pub mod similarity;
pub mod types;

#[cfg(test)]
mod tests;

pub use committer::{BatchCommitter, CommitReport, FailedBatch};
pub use index::{BlockingIndex, IndexStats};
pub use matcher::Matcher;
pub use normalizer::Normalizer;
pub use orchestrator::{RunOptions, RunSummary, TierOrchestrator, TierSummary};
pub use types::*;

// Re-exports from crate root
pub use crate::TARGET_MATCH;
