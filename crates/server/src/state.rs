// crates/server/src/state.rs
use hindsight_db::Store;
use hindsight_git::RepoResolver;
use hindsight_shadow::RestorePoints;
use std::path::PathBuf;
use std::sync::Arc;

use crate::metrics::MetricsRecorder;

/// Everything an RPC handler can reach. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub resolver: Arc<RepoResolver>,
    pub restore: RestorePoints,
    pub metrics: Arc<MetricsRecorder>,
    pub transcripts_dir: PathBuf,
}

impl AppState {
    pub fn new(store: Store, resolver: Arc<RepoResolver>, transcripts_dir: PathBuf) -> Self {
        let restore = RestorePoints::new(store.clone());
        Self {
            store,
            resolver,
            restore,
            metrics: Arc::new(MetricsRecorder::new()),
            transcripts_dir,
        }
    }
}
