// crates/server/src/lib.rs
//! The hindsight engine binary's library half: transcript indexer wiring,
//! the line-framed JSON-RPC surface, metrics, and repository auto-detection.

pub mod autodetect;
pub mod handlers;
pub mod indexer;
pub mod metrics;
pub mod rpc;
pub mod state;

pub use indexer::{IndexerProgress, TranscriptIndexer};
pub use metrics::MetricsRecorder;
pub use state::AppState;
